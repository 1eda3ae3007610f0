use cavern_scripts::script_harness::{load_fixture, run_fixture};
use cavern_scripts::world::EntityKind;

const FIXTURE: &str = "tests/fixtures/cavern/harness.json";

#[test]
fn fixture_spawns_on_schedule() {
    let fixture = load_fixture(FIXTURE).expect("load fixture");
    let output = run_fixture(&fixture).expect("run fixture");

    assert_eq!(output.units, vec!["Timed.script.rhai#Timed".to_string()]);
    assert_eq!(output.rejected.len(), 1, "broken script should be reported: {:?}", output.rejected);
    assert!(output.rejected[0].starts_with("Broken.script.rhai"), "{}", output.rejected[0]);

    let frames: Vec<u64> = output.results.iter().flat_map(|step| step.spawns.iter().map(|s| s.frame)).collect();
    assert_eq!(frames, vec![10, 20, 30, 40, 50]);
    assert!(output.results.iter().all(|step| step.failures.is_empty()));
    assert_eq!(output.results[0].logs, vec!["ore at frame 10".to_string()]);
    assert_eq!(output.final_counts.get(&EntityKind::Ore), Some(&5));
    for spawn in output.results.iter().flat_map(|step| step.spawns.iter()) {
        assert!((2.0..=18.0).contains(&spawn.position[0]), "x offset stays near the player");
        assert_eq!(spawn.position[1], -5.0);
    }
}

#[test]
fn fixture_output_is_stable_across_runs() {
    let fixture = load_fixture(FIXTURE).expect("load fixture");
    let first = run_fixture(&fixture).expect("run fixture first time");
    let second = run_fixture(&fixture).expect("run fixture second time");
    assert_eq!(first, second, "seeded fixture should produce identical output across runs");
}

#[test]
fn output_serializes_to_json() {
    let fixture = load_fixture(FIXTURE).expect("load fixture");
    let output = run_fixture(&fixture).expect("run fixture");
    let json = serde_json::to_value(&output).expect("serialize");
    assert_eq!(json["final_counts"]["Ore"], 5);
    assert_eq!(json["steps"], 50);
}
