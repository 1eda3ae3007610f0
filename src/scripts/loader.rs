use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use rhai::packages::{
    BasicArrayPackage, BasicMapPackage, BasicMathPackage, BasicStringPackage, BasicTimePackage, CorePackage,
    LogicPackage, MoreStringPackage, Package,
};
use rhai::{ASTNode, Engine, Expr, FnAccess, Stmt, AST};

use super::unit::{BuildInfo, HostContext, RhaiUnit, ScriptUnit};
use crate::config::ScriptConfig;
use crate::error::{CompileError, Diagnostic, ScriptError};

const EXECUTE_HOOK: &str = "execute";
const INITIALIZE_HOOK: &str = "initialize";

/// Language-level functions the parser handles itself; they never show up in signatures.
const KEYWORD_FUNCTIONS: &[&str] =
    &["print", "debug", "type_of", "Fn", "call", "curry", "is_def_var", "is_def_fn", "is_shared"];

/// Result of instantiating one declared unit.
pub type UnitOutcome<C> = Result<Box<dyn ScriptUnit<C>>, ScriptError>;

/// Everything a single successful compile of one file produced.
pub struct LoadedScript<C> {
    pub path: PathBuf,
    pub build: BuildInfo,
    pub units: Vec<(String, UnitOutcome<C>)>,
}

/// A unit declaration found in a compiled AST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDecl {
    pub name: String,
    pub execute_fn: String,
    pub initialize_fn: Option<String>,
}

struct AstCache {
    limit: usize,
    order: VecDeque<blake3::Hash>,
    entries: HashMap<blake3::Hash, Arc<AST>>,
}

impl AstCache {
    fn new(limit: usize) -> Self {
        Self { limit, order: VecDeque::new(), entries: HashMap::new() }
    }

    fn get(&self, hash: &blake3::Hash) -> Option<Arc<AST>> {
        self.entries.get(hash).cloned()
    }

    fn insert(&mut self, hash: blake3::Hash, ast: Arc<AST>) {
        if self.limit == 0 {
            return;
        }
        if self.entries.insert(hash, ast).is_none() {
            self.order.push_back(hash);
        }
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

/// Compiles script files into units against a fixed capability surface.
pub struct ScriptLoader<C> {
    engine: Arc<Engine>,
    known_functions: HashSet<String>,
    config: ScriptConfig,
    cache: Mutex<AstCache>,
    _host: PhantomData<fn(&C)>,
}

impl<C: HostContext> ScriptLoader<C> {
    pub fn new(config: &ScriptConfig) -> Result<Self, ScriptError> {
        let engine = build_engine::<C>(config)?;
        let known_functions =
            engine.gen_fn_signatures(true).iter().filter_map(|sig| signature_name(sig)).map(String::from).collect();
        Ok(Self {
            engine: Arc::new(engine),
            known_functions,
            config: config.clone(),
            cache: Mutex::new(AstCache::new(config.ast_cache_limit)),
            _host: PhantomData,
        })
    }

    pub fn config(&self) -> &ScriptConfig {
        &self.config
    }

    pub fn load(&self, path: &Path) -> Result<LoadedScript<C>, ScriptError> {
        if !self.config.is_script_path(path) {
            return Err(ScriptError::NotAScript { path: path.to_path_buf(), suffix: self.config.suffix.clone() });
        }
        let source = self.read_source(path)?;
        self.load_source(path, &source)
    }

    /// Compiles `source` as if it had been read from `path` and instantiates its units.
    pub fn load_source(&self, path: &Path, source: &str) -> Result<LoadedScript<C>, ScriptError> {
        let build = BuildInfo::for_source(source);
        let cached = self.cache.lock().get(&build.content_hash);
        let ast = match cached {
            Some(ast) => ast,
            None => {
                let ast = Arc::new(self.compile(path, source)?);
                self.cache.lock().insert(build.content_hash, ast.clone());
                ast
            }
        };

        let stem = self.config.script_stem(path).unwrap_or("script");
        let units = discover_units(&ast, stem)
            .into_iter()
            .map(|(name, decl)| {
                let outcome = decl.map(|decl| {
                    Box::new(RhaiUnit::new(
                        decl.name,
                        self.engine.clone(),
                        ast.clone(),
                        decl.initialize_fn,
                        decl.execute_fn,
                        build,
                    )) as Box<dyn ScriptUnit<C>>
                });
                (name, outcome)
            })
            .collect();
        Ok(LoadedScript { path: path.to_path_buf(), build, units })
    }

    /// Parses `source` and rejects calls that fall outside the allowed surface.
    pub fn compile(&self, path: &Path, source: &str) -> Result<AST, CompileError> {
        let ast = self.engine.compile(source).map_err(|err| CompileError {
            path: path.to_path_buf(),
            diagnostics: vec![Diagnostic::at(err.err_type().to_string(), err.position())],
        })?;
        let diagnostics = self.disallowed_calls(&ast);
        if !diagnostics.is_empty() {
            return Err(CompileError { path: path.to_path_buf(), diagnostics });
        }
        Ok(ast)
    }

    fn disallowed_calls(&self, ast: &AST) -> Vec<Diagnostic> {
        let bound = bound_names(ast);
        let mut diagnostics = Vec::new();
        ast.walk(&mut |nodes: &[ASTNode<'_>]| {
            let call = match nodes.last() {
                Some(ASTNode::Expr(Expr::FnCall(call, pos)))
                | Some(ASTNode::Expr(Expr::MethodCall(call, pos)))
                | Some(ASTNode::Stmt(Stmt::FnCall(call, pos))) => Some((call.name.as_str(), *pos)),
                _ => None,
            };
            if let Some((name, pos)) = call {
                if is_identifier(name)
                    && !bound.contains(name)
                    && !self.known_functions.contains(name)
                    && !KEYWORD_FUNCTIONS.contains(&name)
                {
                    diagnostics.push(Diagnostic::at(format!("function '{name}' is not available to scripts"), pos));
                }
            }
            true
        });
        diagnostics
    }

    fn read_source(&self, path: &Path) -> Result<String, ScriptError> {
        match fs::read_to_string(path) {
            Ok(source) => Ok(source),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => Err(ScriptError::Read { path: path.to_path_buf(), source: err }),
            Err(err) => {
                log::debug!(target: "scripts", "read of {} failed ({err}), retrying", path.display());
                thread::sleep(self.config.read_retry_delay());
                fs::read_to_string(path).map_err(|source| ScriptError::Read { path: path.to_path_buf(), source })
            }
        }
    }
}

/// Names a call may legally resolve to inside the script itself: its own functions, their
/// parameters, and `let`/`const` bindings (a variable holding a function pointer can be
/// called as `f(x)`).
fn bound_names(ast: &AST) -> HashSet<String> {
    let mut bound = HashSet::new();
    for func in ast.iter_functions() {
        bound.insert(func.name.to_string());
        bound.extend(func.params.iter().map(|param| param.to_string()));
    }
    ast.walk(&mut |nodes: &[ASTNode<'_>]| {
        if let Some(ASTNode::Stmt(Stmt::Var(decl, ..))) = nodes.last() {
            bound.insert(decl.0.name.to_string());
        }
        true
    });
    bound
}

fn build_engine<C: HostContext>(config: &ScriptConfig) -> Result<Engine, ScriptError> {
    config.validate()?;
    let mut engine = Engine::new_raw();
    engine.register_global_module(CorePackage::new().as_shared_module());
    for package in &config.packages {
        let module = match package.as_str() {
            "core" => continue,
            "logic" => LogicPackage::new().as_shared_module(),
            "math" => BasicMathPackage::new().as_shared_module(),
            "string" => BasicStringPackage::new().as_shared_module(),
            "string_more" => MoreStringPackage::new().as_shared_module(),
            "array" => BasicArrayPackage::new().as_shared_module(),
            "map" => BasicMapPackage::new().as_shared_module(),
            "time" => BasicTimePackage::new().as_shared_module(),
            other => return Err(ScriptError::Config(format!("unknown package '{other}'"))),
        };
        engine.register_global_module(module);
    }
    engine.disable_symbol("eval");
    engine.set_fast_operators(true);

    let limits = &config.limits;
    engine.set_max_operations(limits.max_operations);
    engine.set_max_call_levels(limits.max_call_levels);
    engine.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);
    engine.set_max_string_size(limits.max_string_size);
    engine.set_max_array_size(limits.max_array_size);
    engine.set_max_map_size(limits.max_map_size);

    engine.on_print(|text| log::info!(target: "script", "{text}"));
    engine.on_debug(|text, source, pos| {
        log::debug!(target: "script", "{} {pos}: {text}", source.unwrap_or("<script>"));
    });

    C::register_api(&mut engine);
    Ok(engine)
}

/// Groups public `execute`/`initialize` hooks into units.
///
/// `execute`/`initialize` form the unit named after the file stem; `<name>_execute` and
/// `<name>_initialize` form unit `<name>`. Private functions never form units.
pub fn discover_units(ast: &AST, stem: &str) -> Vec<(String, Result<UnitDecl, ScriptError>)> {
    let mut execute_fns: BTreeMap<String, Vec<(String, usize)>> = BTreeMap::new();
    let mut initialize_fns: BTreeMap<String, Vec<(String, usize)>> = BTreeMap::new();
    for func in ast.iter_functions() {
        if func.access == FnAccess::Private {
            continue;
        }
        if let Some(unit) = unit_for_hook(func.name, EXECUTE_HOOK, stem) {
            execute_fns.entry(unit).or_default().push((func.name.to_string(), func.params.len()));
        } else if let Some(unit) = unit_for_hook(func.name, INITIALIZE_HOOK, stem) {
            initialize_fns.entry(unit).or_default().push((func.name.to_string(), func.params.len()));
        }
    }

    let mut units = Vec::new();
    for (unit, executes) in &execute_fns {
        let decl = resolve_unit(unit, executes, initialize_fns.get(unit).map(Vec::as_slice).unwrap_or(&[]));
        units.push((unit.clone(), decl));
    }
    for (unit, inits) in &initialize_fns {
        if !execute_fns.contains_key(unit) {
            let func = &inits[0].0;
            units.push((
                unit.clone(),
                Err(ScriptError::Instantiate {
                    unit: unit.clone(),
                    reason: format!("'{func}' is declared but there is no matching execute hook"),
                }),
            ));
        }
    }
    units
}

fn resolve_unit(
    unit: &str,
    executes: &[(String, usize)],
    inits: &[(String, usize)],
) -> Result<UnitDecl, ScriptError> {
    for hooks in [executes, inits] {
        if let Some((first, second)) = conflicting_hooks(hooks) {
            return Err(ScriptError::Instantiate {
                unit: unit.to_string(),
                reason: format!("declared by both '{first}' and '{second}'"),
            });
        }
    }
    let execute_fn = executes
        .iter()
        .find(|(_, arity)| *arity == 1)
        .map(|(name, _)| name.clone())
        .ok_or_else(|| ScriptError::Instantiate {
            unit: unit.to_string(),
            reason: format!("'{}' must take exactly one parameter (the host context)", executes[0].0),
        })?;
    let initialize_fn = match inits.iter().find(|(_, arity)| *arity == 0) {
        Some((name, _)) => Some(name.clone()),
        None if inits.is_empty() => None,
        None => {
            return Err(ScriptError::Instantiate {
                unit: unit.to_string(),
                reason: format!("'{}' must not take parameters", inits[0].0),
            })
        }
    };
    Ok(UnitDecl { name: unit.to_string(), execute_fn, initialize_fn })
}

/// Two differently named functions claiming the same hook, e.g. `execute` and
/// `Spawner_execute` in `Spawner.script.rhai`.
fn conflicting_hooks(hooks: &[(String, usize)]) -> Option<(&str, &str)> {
    let (first, _) = hooks.first()?;
    hooks.iter().find(|(name, _)| name != first).map(|(name, _)| (first.as_str(), name.as_str()))
}

fn unit_for_hook(fn_name: &str, hook: &str, stem: &str) -> Option<String> {
    if fn_name == hook {
        return Some(stem.to_string());
    }
    fn_name.strip_suffix(hook)?.strip_suffix('_').filter(|prefix| !prefix.is_empty()).map(str::to_string)
}

fn signature_name(signature: &str) -> Option<&str> {
    let head = signature.split('(').next()?;
    let head = head.rsplit("::").next()?;
    head.split_whitespace().last()
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    }
}
