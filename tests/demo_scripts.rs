use std::collections::BTreeMap;
use std::path::PathBuf;

use cavern_scripts::config::{AppConfig, AppConfigOverrides};
use cavern_scripts::runner::run_config;
use cavern_scripts::script_harness::{run_fixture, HarnessFixture};
use cavern_scripts::world::EntityKind;

fn demo_fixture(steps: usize, seed: u64) -> HarnessFixture {
    HarnessFixture {
        scripts_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("assets/scripts"),
        steps,
        dt_ms: 16,
        seed,
        player: [0.0, 0.0],
        packages: None,
    }
}

#[test]
fn shipped_scripts_compile_into_their_units() {
    let output = run_fixture(&demo_fixture(1, 1)).expect("run demo scripts");
    assert!(output.rejected.is_empty(), "{:?}", output.rejected);
    assert_eq!(
        output.units,
        vec![
            "BossBombs.script.rhai#BossBombs",
            "ChestSpawner.script.rhai#ChestSpawner",
            "Drops.script.rhai#potion",
            "Drops.script.rhai#slime",
            "OreSpawner.script.rhai#OreSpawner",
        ]
    );
}

#[test]
fn forty_seconds_of_play_fill_the_cavern() {
    for seed in [1, 42] {
        let output = run_fixture(&demo_fixture(2500, seed)).expect("run demo scripts");
        let failures: Vec<&String> = output.results.iter().flat_map(|step| step.failures.iter()).collect();
        assert!(failures.is_empty(), "{failures:?}");

        let expected = BTreeMap::from([
            (EntityKind::Ore, 12),
            (EntityKind::Chest, 1),
            (EntityKind::Potion, 10),
            (EntityKind::Slime, 15),
            (EntityKind::Bomb, 3),
        ]);
        assert_eq!(output.final_counts, expected, "seed {seed}");

        let logs: Vec<&str> =
            output.results.iter().flat_map(|step| step.logs.iter().map(String::as_str)).collect();
        assert_eq!(logs.iter().filter(|line| line.starts_with("slime wave")).count(), 5);
        assert!(logs.contains(&"a chest appeared"));
        assert!(logs.contains(&"chest skipped, one is already close"));
    }
}

#[test]
fn shipped_config_runs_the_shipped_scripts() {
    let config = AppConfig::load(concat!(env!("CARGO_MANIFEST_DIR"), "/config/cavern.json")).expect("load config");
    let overrides = AppConfigOverrides {
        scripts_dir: Some(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("assets/scripts")),
        frames: Some(5),
        frame_ms: Some(1),
        watch: Some(false),
        seed: Some(3),
    };
    let summary = run_config(config, &overrides).expect("run");
    assert_eq!(summary.frames, 5);
    assert_eq!(summary.script_failures, 0);
    assert!(summary.counts.is_empty(), "nothing is due in the first five milliseconds");
}
