pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod runner;
pub mod script_harness;
pub mod scripts;
pub mod time;
pub mod world;

pub use error::ScriptError;
pub use runner::{run, run_with_overrides};
pub use scripts::{HostContext, ScriptEngine, ScriptUnit};
pub use world::{GameContext, GameWorld};
