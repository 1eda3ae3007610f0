use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A single compiler message with its source location, when rhai reported one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), line: None, column: None }
    }

    pub fn at(message: impl Into<String>, position: rhai::Position) -> Self {
        Self { message: message.into(), line: position.line(), column: position.position() }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "{line}:{column}: {}", self.message),
            (Some(line), None) => write!(f, "{line}: {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub path: PathBuf,
    pub diagnostics: Vec<Diagnostic>,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.path.display())?;
        match self.diagnostics.as_slice() {
            [] => f.write_str("compilation failed"),
            [single] => write!(f, "{single}"),
            many => {
                write!(f, "{} errors", many.len())?;
                for diagnostic in many {
                    write!(f, "\n  {diagnostic}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for CompileError {}

/// Where in a unit's lifecycle a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Initialize,
    Execute,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Initialize => "initialize",
            Stage::Execute => "execute",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("cannot instantiate unit '{unit}': {reason}")]
    Instantiate { unit: String, reason: String },
    #[error("unit '{unit}' failed during {stage}: {message}")]
    Runtime { unit: String, stage: Stage, message: String },
    #[error("{} is not a script file (expected suffix '{suffix}')", .path.display())]
    NotAScript { path: PathBuf, suffix: String },
    #[error("invalid script configuration: {0}")]
    Config(String),
    #[error("failed to start the reload worker: {0}")]
    Worker(#[source] io::Error),
}

impl ScriptError {
    pub fn runtime(unit: impl Into<String>, stage: Stage, message: impl Into<String>) -> Self {
        ScriptError::Runtime { unit: unit.into(), stage, message: message.into() }
    }
}
