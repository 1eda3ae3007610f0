//! Hot-reloading rhai script units.
//!
//! A script file (`*.script.rhai`) declares one or more units through `execute` hooks.
//! [`ScriptEngine`] loads a directory of them, runs every unit once per frame against a
//! host-supplied [`HostContext`], and swaps units in place when their files change.

mod debounce;
mod engine;
mod loader;
mod registry;
mod unit;
mod watch;

pub use debounce::{Debouncer, PendingAction};
pub use engine::{LoadSummary, ReloadStats, ScriptEngine};
pub use loader::{discover_units, LoadedScript, ScriptLoader, UnitDecl, UnitOutcome};
pub use registry::{FrameReport, ScriptRegistry, SwapReport};
pub use unit::{BuildInfo, HostContext, RhaiUnit, ScriptUnit, UnitKey};
pub use watch::{normalize_event, normalize_path, ScriptFileEvent, ScriptFilter, ScriptWatcher};
