use std::collections::BTreeMap;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use glam::Vec2;

use crate::cli::CliOverrides;
use crate::config::{AppConfig, AppConfigOverrides};
use crate::scripts::ScriptEngine;
use crate::world::{EntityKind, GameContext, GameWorld};

/// Totals for a finished run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u64,
    pub script_failures: u64,
    pub counts: BTreeMap<EntityKind, usize>,
}

pub fn run() -> Result<RunSummary> {
    run_with_overrides(CliOverrides::default())
}

pub fn run_with_overrides(cli: CliOverrides) -> Result<RunSummary> {
    let config_path = cli.config_path();
    let config = if cli.config_explicit() {
        AppConfig::load(&config_path)?
    } else if config_path.exists() {
        AppConfig::load_or_default(&config_path)
    } else {
        log::debug!("no config at {}, using defaults", config_path.display());
        AppConfig::default()
    };
    let overrides = cli.into_config_overrides();
    run_config(config, &overrides)
}

/// Runs the frame loop until the configured frame count is reached (or forever).
pub fn run_config(mut config: AppConfig, overrides: &AppConfigOverrides) -> Result<RunSummary> {
    if !overrides.is_empty() {
        log::info!("CLI overrides applied: {}", overrides.applied_fields().join(", "));
    }
    config.apply_overrides(overrides);
    config.scripts.validate().context("invalid script settings")?;

    let mut world = match config.runner.seed {
        Some(seed) => GameWorld::with_seed(seed),
        None => GameWorld::new(),
    };
    world.set_player(Vec2::from_array(config.runner.player));
    let ctx = GameContext::new(world);

    let mut engine: ScriptEngine<GameContext> =
        ScriptEngine::new(config.scripts.clone()).context("failed to start script engine")?;
    let events = engine.subscribe();
    let summary = engine.load_all(&config.runner.scripts_dir);
    for (path, err) in &summary.failed {
        log::warn!("{} skipped: {err}", path.display());
    }

    let frame_duration = config.runner.frame_duration();
    let mut totals = RunSummary::default();
    loop {
        if config.runner.frames.is_some_and(|limit| totals.frames >= limit) {
            break;
        }
        let started = Instant::now();
        ctx.with(|world| world.advance(frame_duration));
        let report = engine.execute_all(&ctx);
        totals.frames += 1;
        totals.script_failures += report.failures.len() as u64;

        for event in events.try_iter() {
            if event.is_error() {
                log::warn!("{event}");
            } else {
                log::debug!("{event}");
            }
        }

        if config.runner.summary_every > 0 && totals.frames % config.runner.summary_every == 0 {
            let counts = ctx.with(|world| world.counts());
            log::info!(
                "frame {}: {} units, {}",
                totals.frames,
                engine.registry().len(),
                describe_counts(&counts)
            );
        }
        ctx.with(|world| {
            world.take_spawns();
            world.take_logs();
        });

        if let Some(remaining) = frame_duration.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }

    totals.counts = ctx.with(|world| world.counts());
    log::info!("finished {} frames: {}", totals.frames, describe_counts(&totals.counts));
    Ok(totals)
}

fn describe_counts(counts: &BTreeMap<EntityKind, usize>) -> String {
    if counts.is_empty() {
        return "world empty".to_string();
    }
    counts.iter().map(|(kind, count)| format!("{kind}={count}")).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn describes_counts_in_kind_order() {
        let mut counts = BTreeMap::new();
        counts.insert(EntityKind::Chest, 2);
        counts.insert(EntityKind::Ore, 1);
        assert_eq!(describe_counts(&counts), "Ore=1 Chest=2");
        assert_eq!(describe_counts(&BTreeMap::new()), "world empty");
    }

    #[test]
    fn bounded_run_executes_scripts_each_frame() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("Ore.script.rhai"), "fn execute(world) { world.spawn_at(\"Ore\", 1.0, 2.0); }")
            .expect("write script");
        let overrides = AppConfigOverrides {
            scripts_dir: Some(PathBuf::from(dir.path())),
            frames: Some(3),
            frame_ms: Some(1),
            watch: Some(false),
            seed: Some(5),
        };
        let summary = run_config(AppConfig::default(), &overrides).expect("run");
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.script_failures, 0);
        assert_eq!(summary.counts.get(&EntityKind::Ore), Some(&3));
    }
}
