use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use cavern_scripts::config::ScriptConfig;
use cavern_scripts::events::ScriptEvent;
use cavern_scripts::scripts::{normalize_path, ScriptEngine, ScriptFileEvent, UnitKey};
use cavern_scripts::world::{GameContext, GameWorld};
use tempfile::tempdir;

fn versioned_pair(version: u32) -> String {
    format!(
        "fn left_execute(world) {{ world.log(\"v{version}\"); }}\nfn right_execute(world) {{ world.log(\"v{version}\"); }}\n"
    )
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

#[test]
fn frames_never_see_a_half_swapped_file() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("Pair.script.rhai");
    fs::write(&path, versioned_pair(0)).expect("write script");
    let path = normalize_path(&path);

    let config = ScriptConfig { watch: false, ..ScriptConfig::default() };
    let mut engine: ScriptEngine<GameContext> = ScriptEngine::new(config).expect("engine");
    engine.load_all(dir.path());
    let ctx = GameContext::new(GameWorld::with_seed(11));
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        let loader = engine.loader();
        let registry = engine.registry();
        let reload_path = path.as_path();
        let done = &done;
        scope.spawn(move || {
            for version in 1..=40 {
                let loaded = loader.load_source(reload_path, &versioned_pair(version)).expect("compile");
                let report = registry.replace_source(reload_path, loaded.build, loaded.units);
                assert_eq!(report.installed.len(), 2);
                thread::yield_now();
            }
            done.store(true, Ordering::Release);
        });

        let mut frames = 0;
        while !done.load(Ordering::Acquire) || frames < 10 {
            let report = engine.execute_all(&ctx);
            assert_eq!(report.invoked, 2);
            let logs = ctx.with(|world| world.take_logs());
            assert_eq!(logs.len(), 2);
            assert_eq!(logs[0], logs[1], "units from one file must come from the same build");
            frames += 1;
        }
    });

    let builds: Vec<_> = engine.registry().keys().iter().filter_map(|key| engine.registry().build_of(key)).collect();
    assert_eq!(builds.len(), 2);
    assert_eq!(builds[0].id, builds[1].id);
    ctx.with(|world| world.take_logs());
    engine.execute_all(&ctx);
    assert_eq!(ctx.with(|world| world.take_logs()), vec!["v40", "v40"]);
}

#[test]
fn burst_of_change_events_runs_one_reload() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("Burst.script.rhai");
    fs::write(&path, "fn execute(world) { world.log(\"old\"); }").expect("write script");
    let path = normalize_path(&path);

    let config = ScriptConfig { watch: false, debounce_ms: 150, ..ScriptConfig::default() };
    let mut engine: ScriptEngine<GameContext> = ScriptEngine::new(config).expect("engine");
    engine.load_all(dir.path());
    let key = UnitKey::new(&path, "Burst");
    let first = engine.registry().build_of(&key).expect("loaded");

    fs::write(&path, "fn execute(world) { world.log(\"new\"); }").expect("rewrite");
    for _ in 0..5 {
        engine.queue_event(ScriptFileEvent::Changed(path.clone()));
    }
    assert!(wait_until(Duration::from_secs(5), || engine.stats().reload_passes >= 1), "reload never ran");
    thread::sleep(Duration::from_millis(400));
    assert_eq!(engine.stats().reload_passes, 1);
    assert_ne!(engine.registry().build_of(&key).map(|b| b.id), Some(first.id));

    let ctx = GameContext::new(GameWorld::with_seed(1));
    engine.execute_all(&ctx);
    assert_eq!(ctx.with(|world| world.take_logs()), vec!["new"]);
}

#[test]
fn queued_delete_then_create_keeps_the_script_loaded() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("Flip.script.rhai");
    fs::write(&path, "fn execute(world) { }").expect("write script");
    let path = normalize_path(&path);

    let config = ScriptConfig { watch: false, debounce_ms: 50, ..ScriptConfig::default() };
    let mut engine: ScriptEngine<GameContext> = ScriptEngine::new(config).expect("engine");
    engine.load_all(dir.path());

    engine.queue_event(ScriptFileEvent::Deleted(path.clone()));
    engine.queue_event(ScriptFileEvent::Created(path.clone()));
    assert!(wait_until(Duration::from_secs(5), || engine.stats().reload_passes >= 1));
    assert_eq!(engine.stats().removals, 0);
    assert!(engine.registry().contains(&UnitKey::new(&path, "Flip")));
}

#[test]
fn queued_rename_moves_units_to_the_new_path() {
    let dir = tempdir().expect("tempdir");
    let old = dir.path().join("Ore.script.rhai");
    fs::write(&old, "fn execute(world) { }").expect("write script");
    let old = normalize_path(&old);

    let config = ScriptConfig { watch: false, debounce_ms: 50, ..ScriptConfig::default() };
    let mut engine: ScriptEngine<GameContext> = ScriptEngine::new(config).expect("engine");
    engine.load_all(dir.path());

    let new = dir.path().join("Gold.script.rhai");
    fs::rename(&old, &new).expect("rename");
    let new = normalize_path(&new);
    engine.queue_event(ScriptFileEvent::Renamed { from: old.clone(), to: new.clone() });

    assert!(wait_until(Duration::from_secs(5), || engine.registry().contains(&UnitKey::new(&new, "Gold"))));
    assert!(wait_until(Duration::from_secs(5), || engine.registry().units_for(&old).is_empty()));
    assert_eq!(engine.registry().len(), 1);
}

fn watched_engine(dir: &Path) -> Option<ScriptEngine<GameContext>> {
    let config = ScriptConfig { watch: true, debounce_ms: 200, ..ScriptConfig::default() };
    let mut engine: ScriptEngine<GameContext> = ScriptEngine::new(config).expect("engine");
    let summary = engine.load_all(dir);
    if !summary.watching {
        eprintln!("file watching unavailable here, skipping");
        return None;
    }
    Some(engine)
}

#[test]
fn watcher_picks_up_create_edit_and_delete() {
    let dir = tempdir().expect("tempdir");
    let Some(engine) = watched_engine(dir.path()) else { return };
    let path = normalize_path(dir.path()).join("Live.script.rhai");
    let key = UnitKey::new(&path, "Live");
    let ctx = GameContext::new(GameWorld::with_seed(2));

    fs::write(&path, "fn execute(world) { world.log(\"one\"); }").expect("create script");
    assert!(wait_until(Duration::from_secs(10), || engine.registry().contains(&key)), "created script never loaded");
    engine.execute_all(&ctx);
    assert_eq!(ctx.with(|world| world.take_logs()), vec!["one"]);

    let first = engine.registry().build_of(&key).expect("build");
    fs::write(&path, "fn execute(world) { world.log(\"two\"); }").expect("edit script");
    assert!(
        wait_until(Duration::from_secs(10), || engine.registry().build_of(&key).map(|b| b.id) != Some(first.id)),
        "edit never reloaded"
    );
    engine.execute_all(&ctx);
    assert_eq!(ctx.with(|world| world.take_logs()), vec!["two"]);

    fs::remove_file(&path).expect("delete script");
    assert!(wait_until(Duration::from_secs(10), || engine.registry().is_empty()), "deleted script stayed loaded");
}

#[test]
fn watcher_coalesces_rapid_writes() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("Rapid.script.rhai");
    fs::write(&path, "fn execute(world) { world.log(\"0\"); }").expect("write script");
    let Some(engine) = watched_engine(dir.path()) else { return };
    let key = UnitKey::new(normalize_path(&path), "Rapid");
    let events = engine.subscribe();

    for i in 1..=5 {
        fs::write(&path, format!("fn execute(world) {{ world.log(\"{i}\"); }}")).expect("rewrite");
        thread::sleep(Duration::from_millis(10));
    }
    let ctx = GameContext::new(GameWorld::with_seed(2));
    assert!(wait_until(Duration::from_secs(10), || {
        engine.execute_all(&ctx);
        ctx.with(|world| world.take_logs()) == vec!["5".to_string()]
    }));
    thread::sleep(Duration::from_millis(500));
    let loads = events.try_iter().filter(|event| event.path() == key.path && !event.is_error()).count();
    assert!(loads >= 1 && loads < 5, "five writes inside one window should not cause five reloads ({loads})");
}

#[test]
fn typo_fix_arrives_through_the_debounced_path() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("Typo.script.rhai");
    fs::write(&path, "fn execute(world) { world.log(\"oops\" }").expect("write script");
    let path = normalize_path(&path);

    let config = ScriptConfig { watch: false, debounce_ms: 50, ..ScriptConfig::default() };
    let mut engine: ScriptEngine<GameContext> = ScriptEngine::new(config).expect("engine");
    let summary = engine.load_all(dir.path());
    assert_eq!(summary.failed.len(), 1);
    assert!(engine.registry().is_empty());
    let events = engine.subscribe();

    fs::write(&path, "fn execute(world) { world.log(\"fixed\"); }").expect("fix script");
    engine.queue_event(ScriptFileEvent::Changed(path.clone()));
    engine.queue_event(ScriptFileEvent::Changed(path.clone()));
    assert!(wait_until(Duration::from_secs(5), || !engine.registry().is_empty()), "fix never loaded");
    thread::sleep(Duration::from_millis(200));

    let seen: Vec<ScriptEvent> = events.try_iter().collect();
    assert_eq!(seen.len(), 1, "{seen:?}");
    assert!(matches!(&seen[0], ScriptEvent::Loaded { units, .. } if units == &vec!["Typo".to_string()]));
    assert_eq!(engine.stats().reload_passes, 1);

    let ctx = GameContext::new(GameWorld::with_seed(2));
    engine.execute_all(&ctx);
    assert_eq!(ctx.with(|world| world.take_logs()), vec!["fixed"]);
}
