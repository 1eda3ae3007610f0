use parking_lot::Mutex;
use std::fmt;
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender};

use crate::error::CompileError;
use crate::scripts::{BuildInfo, UnitKey};

/// Structured diagnostics emitted by the script engine alongside its log lines.
#[derive(Debug, Clone)]
pub enum ScriptEvent {
    Loaded { path: PathBuf, build: BuildInfo, units: Vec<String> },
    CompileFailed { path: PathBuf, error: CompileError },
    ReadFailed { path: PathBuf, reason: String },
    UnitRejected { key: UnitKey, reason: String },
    Removed { path: PathBuf, units: Vec<String> },
    WatchUnavailable { directory: PathBuf, reason: String },
}

impl ScriptEvent {
    pub fn path(&self) -> &std::path::Path {
        match self {
            ScriptEvent::Loaded { path, .. }
            | ScriptEvent::CompileFailed { path, .. }
            | ScriptEvent::ReadFailed { path, .. }
            | ScriptEvent::Removed { path, .. } => path,
            ScriptEvent::UnitRejected { key, .. } => &key.path,
            ScriptEvent::WatchUnavailable { directory, .. } => directory,
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, ScriptEvent::Loaded { .. } | ScriptEvent::Removed { .. })
    }
}

impl fmt::Display for ScriptEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptEvent::Loaded { path, build, units } => {
                write!(f, "Loaded path={} build={} units=[{}]", path.display(), build.short_id(), units.join(", "))
            }
            ScriptEvent::CompileFailed { error, .. } => write!(f, "CompileFailed {error}"),
            ScriptEvent::ReadFailed { path, reason } => write!(f, "ReadFailed path={} reason={reason}", path.display()),
            ScriptEvent::UnitRejected { key, reason } => write!(f, "UnitRejected unit={key} reason={reason}"),
            ScriptEvent::Removed { path, units } => {
                write!(f, "Removed path={} units=[{}]", path.display(), units.join(", "))
            }
            ScriptEvent::WatchUnavailable { directory, reason } => {
                write!(f, "WatchUnavailable directory={} reason={reason}", directory.display())
            }
        }
    }
}

/// Fan-out of script events to any number of subscribers. Subscribers whose receiver was
/// dropped are pruned on the next emit.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ScriptEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ScriptEvent> {
        let (tx, rx) = channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: ScriptEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
