use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::config::ScriptConfig;
use crate::scripts::ScriptEngine;
use crate::world::{EntityKind, GameContext, GameWorld, SpawnRecord};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessFixture {
    /// Script directory, relative to the fixture file when loaded with [`load_fixture`].
    pub scripts_dir: PathBuf,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_dt_ms")]
    pub dt_ms: u64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub player: [f32; 2],
    #[serde(default)]
    pub packages: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessOutput {
    pub steps: usize,
    pub dt_ms: u64,
    pub units: Vec<String>,
    pub rejected: Vec<String>,
    pub results: Vec<StepResult>,
    pub final_counts: BTreeMap<EntityKind, usize>,
}

/// Everything observable during one step. Quiet steps are left out of the output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub step: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spawns: Vec<SpawnRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

impl StepResult {
    fn is_quiet(&self) -> bool {
        self.spawns.is_empty() && self.logs.is_empty() && self.failures.is_empty()
    }
}

impl HarnessOutput {
    /// Execute failures summed over every step.
    pub fn failure_count(&self) -> usize {
        self.results.iter().map(|step| step.failures.len()).sum()
    }

    pub fn spawn_count(&self) -> usize {
        self.results.iter().map(|step| step.spawns.len()).sum()
    }

    /// True when every script compiled and no step reported a failure.
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty() && self.failure_count() == 0
    }

    /// One line for the console: unit, rejection, spawn and failure totals.
    pub fn summary_line(&self, label: &str) -> String {
        format!(
            "{label}: {} steps x {}ms, {} units, {} rejected, {} spawns, {} failures",
            self.steps,
            self.dt_ms,
            self.units.len(),
            self.rejected.len(),
            self.spawn_count(),
            self.failure_count()
        )
    }
}

/// Runs the fixture's scripts for a fixed number of steps on a seeded world with a fixed
/// clock. Hot reload stays off so the output depends only on the script sources.
pub fn run_fixture(fixture: &HarnessFixture) -> Result<HarnessOutput> {
    let mut config = ScriptConfig { watch: false, ..ScriptConfig::default() };
    if let Some(packages) = &fixture.packages {
        config.packages = packages.clone();
    }
    let mut engine: ScriptEngine<GameContext> =
        ScriptEngine::new(config).context("failed to start script engine")?;

    let mut world = GameWorld::with_seed(fixture.seed);
    world.set_player(Vec2::from_array(fixture.player));
    let ctx = GameContext::new(world);

    let summary = engine.load_all(&fixture.scripts_dir);
    let mut rejected: Vec<String> =
        summary.failed.iter().map(|(path, err)| format!("{}: {err}", file_label(path))).collect();
    for key in engine.registry().keys() {
        log::debug!(target: "harness", "unit {key}");
    }
    let units: Vec<String> = engine
        .registry()
        .keys()
        .into_iter()
        .map(|key| format!("{}#{}", file_label(&key.path), key.unit))
        .collect();
    if units.is_empty() && rejected.is_empty() {
        log::warn!(target: "harness", "no scripts found in {}", fixture.scripts_dir.display());
    }
    rejected.sort();

    let dt = Duration::from_millis(fixture.dt_ms);
    let mut results = Vec::new();
    for step in 0..fixture.steps {
        ctx.with(|world| world.advance(dt));
        let report = engine.execute_all(&ctx);
        let (spawns, logs) = ctx.with(|world| (world.take_spawns(), world.take_logs()));
        let failures = report
            .failures
            .iter()
            .map(|(key, err)| format!("{}#{}: {err}", file_label(&key.path), key.unit))
            .collect();
        let result = StepResult { step, spawns, logs, failures };
        if !result.is_quiet() {
            results.push(result);
        }
    }

    let final_counts = ctx.with(|world| world.counts());
    Ok(HarnessOutput { steps: fixture.steps, dt_ms: fixture.dt_ms, units, rejected, results, final_counts })
}

pub fn load_fixture<P: AsRef<Path>>(path: P) -> Result<HarnessFixture> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening harness fixture '{}'", path.display()))?;
    let mut fixture: HarnessFixture =
        serde_json::from_reader(file).with_context(|| format!("parsing harness fixture '{}'", path.display()))?;
    if fixture.scripts_dir.is_relative() {
        if let Some(parent) = path.parent() {
            fixture.scripts_dir = parent.join(&fixture.scripts_dir);
        }
    }
    Ok(fixture)
}

/// `<stem>.golden.json` next to the fixture file.
pub fn golden_path(fixture_path: &Path) -> PathBuf {
    let stem = fixture_path.file_stem().map(|stem| stem.to_string_lossy().into_owned()).unwrap_or_default();
    fixture_path.with_file_name(format!("{stem}.golden.json"))
}

/// Compares `output` with the golden file at `path`. `Ok(false)` means the file exists but
/// differs.
pub fn matches_golden(output: &HarnessOutput, path: &Path) -> Result<bool> {
    let file = File::open(path).with_context(|| format!("opening golden file '{}'", path.display()))?;
    let expected: HarnessOutput =
        serde_json::from_reader(file).with_context(|| format!("parsing golden file '{}'", path.display()))?;
    Ok(&expected == output)
}

/// File name only, so outputs do not depend on where the repo is checked out.
fn file_label(path: &Path) -> String {
    path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_else(|| path.display().to_string())
}

fn default_steps() -> usize {
    60
}

fn default_dt_ms() -> u64 {
    16
}

fn default_seed() -> u64 {
    0x5eed
}
