use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rhai::{CallFnOptions, Dynamic, Engine, Map, Scope, AST};
use uuid::Uuid;

use crate::error::{ScriptError, Stage};

/// The capability object a host hands to every `execute` call.
///
/// Implementors are cheap handles (usually an `Arc` around the real game state) so one
/// clone can be passed into the script VM per call.
pub trait HostContext: Clone + Send + Sync + 'static {
    /// Registers the context type and every host function scripts are allowed to call.
    fn register_api(engine: &mut Engine);
}

/// One loaded behaviour. `initialize` runs exactly once before the first `execute`.
pub trait ScriptUnit<C>: Send {
    fn name(&self) -> &str;

    fn initialize(&mut self) -> Result<(), ScriptError>;

    fn execute(&mut self, ctx: &C) -> Result<(), ScriptError>;
}

/// Registry identity of a unit: the script file plus the unit declared inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitKey {
    pub path: PathBuf,
    pub unit: String,
}

impl UnitKey {
    pub fn new(path: impl Into<PathBuf>, unit: impl Into<String>) -> Self {
        Self { path: path.into(), unit: unit.into() }
    }

    pub fn belongs_to(&self, path: &Path) -> bool {
        self.path == path
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.path.display(), self.unit)
    }
}

/// Identity of one compilation. The id is fresh for every load, even of identical content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildInfo {
    pub id: Uuid,
    pub content_hash: blake3::Hash,
}

impl BuildInfo {
    pub fn for_source(source: &str) -> Self {
        Self { id: Uuid::new_v4(), content_hash: blake3::hash(source.as_bytes()) }
    }

    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

/// A unit backed by a compiled rhai AST.
///
/// Unit state lives in an object map bound as `this`, so `this.timer = 0.0;` inside
/// `initialize` survives into later `execute` calls. Every instance starts with an empty map.
pub struct RhaiUnit {
    name: String,
    engine: Arc<Engine>,
    ast: Arc<AST>,
    scope: Scope<'static>,
    state: Dynamic,
    initialize_fn: Option<String>,
    execute_fn: String,
    build: BuildInfo,
}

impl RhaiUnit {
    pub(crate) fn new(
        name: impl Into<String>,
        engine: Arc<Engine>,
        ast: Arc<AST>,
        initialize_fn: Option<String>,
        execute_fn: String,
        build: BuildInfo,
    ) -> Self {
        Self {
            name: name.into(),
            engine,
            ast,
            scope: Scope::new(),
            state: Dynamic::from_map(Map::new()),
            initialize_fn,
            execute_fn,
            build,
        }
    }

    pub fn build(&self) -> BuildInfo {
        self.build
    }

    pub fn state(&self) -> &Dynamic {
        &self.state
    }
}

impl<C: HostContext> ScriptUnit<C> for RhaiUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self) -> Result<(), ScriptError> {
        self.engine
            .run_ast_with_scope(&mut self.scope, &self.ast)
            .map_err(|err| ScriptError::runtime(&self.name, Stage::Initialize, err.to_string()))?;
        if let Some(func) = &self.initialize_fn {
            let options = CallFnOptions::new().eval_ast(false).bind_this_ptr(&mut self.state);
            self.engine
                .call_fn_with_options::<Dynamic>(options, &mut self.scope, &self.ast, func, ())
                .map_err(|err| ScriptError::runtime(&self.name, Stage::Initialize, err.to_string()))?;
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &C) -> Result<(), ScriptError> {
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true).bind_this_ptr(&mut self.state);
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut self.scope, &self.ast, &self.execute_fn, (ctx.clone(),))
            .map(|_| ())
            .map_err(|err| ScriptError::runtime(&self.name, Stage::Execute, err.to_string()))
    }
}
