use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::loader::UnitOutcome;
use super::unit::{BuildInfo, ScriptUnit, UnitKey};
use crate::error::{ScriptError, Stage};

struct Slot<C> {
    unit: Box<dyn ScriptUnit<C>>,
    build: BuildInfo,
    generation: u64,
}

/// What a per-file swap changed.
#[derive(Debug, Default)]
pub struct SwapReport {
    pub installed: Vec<UnitKey>,
    pub rejected: Vec<(UnitKey, ScriptError)>,
    pub retired: Vec<UnitKey>,
}

/// Outcome of one `execute_all` pass.
#[derive(Debug, Default)]
pub struct FrameReport {
    pub invoked: usize,
    pub failures: Vec<(UnitKey, ScriptError)>,
}

impl FrameReport {
    pub fn succeeded(&self) -> usize {
        self.invoked - self.failures.len()
    }
}

/// Live units keyed by file and unit name.
///
/// Mutation and iteration share one lock, so `execute_all` never sees a half-swapped file.
/// Initialization always happens before the lock is taken.
pub struct ScriptRegistry<C> {
    slots: Mutex<BTreeMap<UnitKey, Slot<C>>>,
    next_generation: AtomicU64,
}

impl<C> Default for ScriptRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> ScriptRegistry<C> {
    pub fn new() -> Self {
        Self { slots: Mutex::new(BTreeMap::new()), next_generation: AtomicU64::new(1) }
    }

    /// Initializes `unit` and installs it under `key`, replacing any previous instance.
    ///
    /// A unit whose initializer fails is not installed; the previous instance stays live.
    pub fn upsert(&self, key: UnitKey, mut unit: Box<dyn ScriptUnit<C>>, build: BuildInfo) -> Result<u64, ScriptError> {
        initialize_unit(&key, unit.as_mut())?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = self.slots.lock().insert(key, Slot { unit, build, generation });
        drop(previous);
        Ok(generation)
    }

    /// Publishes the units of one freshly compiled file in a single step.
    ///
    /// Units missing from the new compile are retired. Units that failed to instantiate or
    /// initialize keep their previous instance, if there was one.
    pub fn replace_source(&self, path: &Path, build: BuildInfo, units: Vec<(String, UnitOutcome<C>)>) -> SwapReport {
        let mut report = SwapReport::default();
        let mut declared = BTreeSet::new();
        let mut ready = Vec::new();
        for (name, outcome) in units {
            let key = UnitKey::new(path, name.as_str());
            declared.insert(name);
            let initialized = outcome.and_then(|mut unit| initialize_unit(&key, unit.as_mut()).map(|()| unit));
            match initialized {
                Ok(unit) => ready.push((key, unit)),
                Err(err) => report.rejected.push((key, err)),
            }
        }

        let mut dropped = Vec::new();
        {
            let mut slots = self.slots.lock();
            let stale: Vec<UnitKey> =
                slots.keys().filter(|key| key.belongs_to(path) && !declared.contains(&key.unit)).cloned().collect();
            for key in stale {
                if let Some(slot) = slots.remove(&key) {
                    dropped.push(slot);
                    report.retired.push(key);
                }
            }
            for (key, unit) in ready {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                if let Some(previous) = slots.insert(key.clone(), Slot { unit, build, generation }) {
                    dropped.push(previous);
                }
                report.installed.push(key);
            }
        }
        drop(dropped);
        report
    }

    pub fn remove(&self, key: &UnitKey) -> bool {
        let removed = self.slots.lock().remove(key);
        removed.is_some()
    }

    /// Drops every unit loaded from `path`. Unknown paths are a no-op.
    pub fn remove_source(&self, path: &Path) -> Vec<UnitKey> {
        let mut dropped = Vec::new();
        let mut keys = Vec::new();
        {
            let mut slots = self.slots.lock();
            let matching: Vec<UnitKey> = slots.keys().filter(|key| key.belongs_to(path)).cloned().collect();
            for key in matching {
                if let Some(slot) = slots.remove(&key) {
                    dropped.push(slot);
                    keys.push(key);
                }
            }
        }
        drop(dropped);
        keys
    }

    /// Runs `execute` on every live unit. Failures are logged and collected; they never stop
    /// the pass.
    pub fn execute_all(&self, ctx: &C) -> FrameReport {
        let mut report = FrameReport::default();
        let mut slots = self.slots.lock();
        for (key, slot) in slots.iter_mut() {
            report.invoked += 1;
            let unit = slot.unit.as_mut();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| unit.execute(ctx)))
                .unwrap_or_else(|payload| Err(ScriptError::runtime(unit.name(), Stage::Execute, panic_message(payload))));
            if let Err(err) = outcome {
                log::error!(target: "scripts", "{} ({key}): {err}", slot.unit.name());
                report.failures.push((key.clone(), err));
            }
        }
        report
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<UnitKey> {
        self.slots.lock().keys().cloned().collect()
    }

    pub fn units_for(&self, path: &Path) -> Vec<UnitKey> {
        self.slots.lock().keys().filter(|key| key.belongs_to(path)).cloned().collect()
    }

    pub fn contains(&self, key: &UnitKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    pub fn build_of(&self, key: &UnitKey) -> Option<BuildInfo> {
        self.slots.lock().get(key).map(|slot| slot.build)
    }

    /// Monotonic install counter of the live instance under `key`.
    pub fn generation_of(&self, key: &UnitKey) -> Option<u64> {
        self.slots.lock().get(key).map(|slot| slot.generation)
    }
}

fn initialize_unit<C>(key: &UnitKey, unit: &mut dyn ScriptUnit<C>) -> Result<(), ScriptError> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| unit.initialize()))
        .unwrap_or_else(|payload| Err(ScriptError::runtime(unit.name(), Stage::Initialize, panic_message(payload))));
    if let Err(err) = &outcome {
        log::error!(target: "scripts", "{} ({key}) not installed: {err}", unit.name());
    }
    outcome
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}
