use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::watch::ScriptFileEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Reload,
    Remove,
}

#[derive(Debug, Clone, Copy)]
struct PendingChange {
    action: PendingAction,
    deadline: Instant,
    events: u32,
}

/// Per-path trailing-edge debounce. Every event pushes the path's deadline out by the
/// window; the latest action for a path wins.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, PendingChange>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, pending: HashMap::new() }
    }

    pub fn push(&mut self, event: ScriptFileEvent, now: Instant) {
        match event {
            ScriptFileEvent::Created(path) | ScriptFileEvent::Changed(path) => {
                self.schedule(path, PendingAction::Reload, now)
            }
            ScriptFileEvent::Deleted(path) => self.schedule(path, PendingAction::Remove, now),
            ScriptFileEvent::Renamed { from, to } => {
                self.schedule(from, PendingAction::Remove, now);
                self.schedule(to, PendingAction::Reload, now);
            }
        }
    }

    fn schedule(&mut self, path: PathBuf, action: PendingAction, now: Instant) {
        let deadline = now + self.window;
        let entry = self.pending.entry(path).or_insert(PendingChange { action, deadline, events: 0 });
        entry.action = action;
        entry.deadline = deadline;
        entry.events += 1;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|change| change.deadline).min()
    }

    /// Removes and returns every change whose window has elapsed, ordered by path.
    pub fn drain_ready(&mut self, now: Instant) -> Vec<(PathBuf, PendingAction)> {
        let ready: Vec<PathBuf> =
            self.pending.iter().filter(|(_, change)| change.deadline <= now).map(|(path, _)| path.clone()).collect();
        let mut drained: Vec<(PathBuf, PendingAction)> = ready
            .into_iter()
            .filter_map(|path| {
                let change = self.pending.remove(&path)?;
                if change.events > 1 {
                    log::debug!(
                        target: "scripts::watch",
                        "coalesced {} events for {}",
                        change.events,
                        path.display()
                    );
                }
                Some((path, change.action))
            })
            .collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
