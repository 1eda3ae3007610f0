use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::debounce::{Debouncer, PendingAction};
use super::loader::ScriptLoader;
use super::registry::{FrameReport, ScriptRegistry, SwapReport};
use super::unit::{HostContext, UnitKey};
use super::watch::{normalize_path, ScriptFileEvent, ScriptWatcher};
use crate::config::ScriptConfig;
use crate::error::ScriptError;
use crate::events::{EventBus, ScriptEvent};

/// Upper bound on how long the reload worker sleeps before rechecking for shutdown.
const WORKER_IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadStats {
    /// Debounced reload passes run by the worker (bulk loads and manual reloads excluded).
    pub reload_passes: u64,
    pub removals: u64,
    pub compile_failures: u64,
    pub read_failures: u64,
}

#[derive(Default)]
struct StatCounters {
    reload_passes: AtomicU64,
    removals: AtomicU64,
    compile_failures: AtomicU64,
    read_failures: AtomicU64,
}

impl StatCounters {
    fn snapshot(&self) -> ReloadStats {
        ReloadStats {
            reload_passes: self.reload_passes.load(Ordering::Acquire),
            removals: self.removals.load(Ordering::Acquire),
            compile_failures: self.compile_failures.load(Ordering::Acquire),
            read_failures: self.read_failures.load(Ordering::Acquire),
        }
    }
}

/// Result of a bulk directory load.
#[derive(Debug, Default)]
pub struct LoadSummary {
    pub directory: PathBuf,
    pub loaded: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, ScriptError)>,
    /// Units dropped because their file is no longer part of the scanned directory.
    pub removed: Vec<UnitKey>,
    pub units: usize,
    pub watching: bool,
}

struct EngineShared<C> {
    loader: ScriptLoader<C>,
    registry: ScriptRegistry<C>,
    events: EventBus,
    stats: StatCounters,
}

impl<C: HostContext> EngineShared<C> {
    fn load_file(&self, path: &Path) -> Result<SwapReport, ScriptError> {
        let path = normalize_path(path);
        let loaded = match self.loader.load(&path) {
            Ok(loaded) => loaded,
            Err(ScriptError::Compile(error)) => {
                self.stats.compile_failures.fetch_add(1, Ordering::AcqRel);
                log::error!(target: "scripts", "compile failed: {error}");
                self.events.emit(ScriptEvent::CompileFailed { path: path.clone(), error: error.clone() });
                return Err(ScriptError::Compile(error));
            }
            Err(err @ ScriptError::Read { .. }) => {
                self.stats.read_failures.fetch_add(1, Ordering::AcqRel);
                log::warn!(target: "scripts", "{err}; will retry on the next change");
                self.events.emit(ScriptEvent::ReadFailed { path: path.clone(), reason: err.to_string() });
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let build = loaded.build;
        let report = self.registry.replace_source(&path, build, loaded.units);
        for (key, err) in &report.rejected {
            self.events.emit(ScriptEvent::UnitRejected { key: key.clone(), reason: err.to_string() });
        }
        for key in &report.retired {
            log::info!(target: "scripts", "retired {key}");
        }
        let units: Vec<String> = report.installed.iter().map(|key| key.unit.clone()).collect();
        log::info!(
            target: "scripts",
            "loaded {} build {} [{}]",
            path.display(),
            build.short_id(),
            units.join(", ")
        );
        self.events.emit(ScriptEvent::Loaded { path, build, units });
        Ok(report)
    }

    fn remove_file(&self, path: &Path) -> Vec<UnitKey> {
        let path = normalize_path(path);
        let removed = self.registry.remove_source(&path);
        if !removed.is_empty() {
            self.stats.removals.fetch_add(1, Ordering::AcqRel);
            log::info!(target: "scripts", "removed {} ({} units)", path.display(), removed.len());
            let units = removed.iter().map(|key| key.unit.clone()).collect();
            self.events.emit(ScriptEvent::Removed { path, units });
        }
        removed
    }

    fn apply(&self, path: &Path, action: PendingAction) {
        match action {
            PendingAction::Reload => {
                self.stats.reload_passes.fetch_add(1, Ordering::AcqRel);
                // Failures are already logged and published.
                let _ = self.load_file(path);
            }
            PendingAction::Remove => {
                self.remove_file(path);
            }
        }
    }
}

/// Loads a script directory, runs every unit once per frame and hot-swaps units as their
/// files change on disk.
///
/// Compilation and file I/O for hot reload happen on a dedicated worker thread; the frame
/// thread only ever takes the registry lock inside [`ScriptEngine::execute_all`].
pub struct ScriptEngine<C: HostContext> {
    shared: Arc<EngineShared<C>>,
    config: ScriptConfig,
    sender: Option<Sender<ScriptFileEvent>>,
    watcher: Option<ScriptWatcher>,
    worker: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    directory: Option<PathBuf>,
}

impl<C: HostContext> ScriptEngine<C> {
    pub fn new(config: ScriptConfig) -> Result<Self, ScriptError> {
        let loader = ScriptLoader::new(&config)?;
        let shared = Arc::new(EngineShared {
            loader,
            registry: ScriptRegistry::new(),
            events: EventBus::new(),
            stats: StatCounters::default(),
        });
        let (sender, receiver) = channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = spawn_reload_worker(shared.clone(), receiver, config.debounce(), shutdown.clone())
            .map_err(ScriptError::Worker)?;
        Ok(Self {
            shared,
            config,
            sender: Some(sender),
            watcher: None,
            worker: Some(worker),
            shutdown,
            directory: None,
        })
    }

    /// Loads every script in `directory` and, when enabled, starts watching it.
    ///
    /// Per-file failures are isolated. A missing directory or a watcher that cannot attach
    /// is logged and leaves the engine without hot reload; it is never fatal.
    pub fn load_all(&mut self, directory: impl AsRef<Path>) -> LoadSummary {
        self.watcher = None;
        let directory = normalize_path(directory.as_ref());
        let mut summary = LoadSummary { directory: directory.clone(), ..LoadSummary::default() };

        let paths = discover_scripts(&directory, &self.config).unwrap_or_else(|err| {
            log::warn!(target: "scripts", "cannot scan script directory {}: {err}", directory.display());
            Vec::new()
        });
        summary.removed = self.remove_unlisted(&paths);
        for path in paths {
            match self.shared.load_file(&path) {
                Ok(report) => {
                    summary.units += report.installed.len();
                    summary.loaded.push(path);
                }
                Err(err) => summary.failed.push((path, err)),
            }
        }

        if self.config.watch {
            if let Some(sender) = &self.sender {
                match ScriptWatcher::attach(&directory, &self.config.suffix, sender.clone()) {
                    Ok(watcher) => self.watcher = Some(watcher),
                    Err(err) => {
                        log::warn!(target: "scripts", "hot reload disabled for {}: {err:#}", directory.display());
                        self.shared.events.emit(ScriptEvent::WatchUnavailable {
                            directory: directory.clone(),
                            reason: format!("{err:#}"),
                        });
                    }
                }
            }
        }
        summary.watching = self.watcher.is_some();
        log::info!(
            target: "scripts",
            "loaded {} of {} scripts from {} ({} units, hot reload {})",
            summary.loaded.len(),
            summary.loaded.len() + summary.failed.len(),
            directory.display(),
            summary.units,
            if summary.watching { "on" } else { "off" }
        );
        self.directory = Some(directory);
        summary
    }

    /// Removes units whose source file is not among `paths`, such as leftovers from a
    /// previously loaded directory.
    fn remove_unlisted(&self, paths: &[PathBuf]) -> Vec<UnitKey> {
        let listed: BTreeSet<PathBuf> = paths.iter().map(|path| normalize_path(path)).collect();
        let stale: BTreeSet<PathBuf> = self
            .shared
            .registry
            .keys()
            .into_iter()
            .map(|key| key.path)
            .filter(|path| !listed.contains(path))
            .collect();
        stale.iter().flat_map(|path| self.shared.remove_file(path)).collect()
    }

    /// Runs one frame: `execute(ctx)` on every live unit.
    pub fn execute_all(&self, ctx: &C) -> FrameReport {
        self.shared.registry.execute_all(ctx)
    }

    /// Recompiles `path` right away on the calling thread.
    pub fn reload_path(&self, path: impl AsRef<Path>) -> Result<SwapReport, ScriptError> {
        self.shared.load_file(path.as_ref())
    }

    pub fn remove_path(&self, path: impl AsRef<Path>) -> Vec<UnitKey> {
        self.shared.remove_file(path.as_ref())
    }

    /// Feeds an event into the debounce pipeline as if the watcher had reported it.
    pub fn queue_event(&self, event: ScriptFileEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }

    pub fn subscribe(&self) -> Receiver<ScriptEvent> {
        self.shared.events.subscribe()
    }

    pub fn registry(&self) -> &ScriptRegistry<C> {
        &self.shared.registry
    }

    pub fn loader(&self) -> &ScriptLoader<C> {
        &self.shared.loader
    }

    pub fn config(&self) -> &ScriptConfig {
        &self.config
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    pub fn stats(&self) -> ReloadStats {
        self.shared.stats.snapshot()
    }
}

impl<C: HostContext> Drop for ScriptEngine<C> {
    fn drop(&mut self) {
        self.watcher.take();
        self.sender.take();
        self.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!(target: "scripts", "reload worker panicked");
            }
        }
    }
}

fn discover_scripts(directory: &Path, config: &ScriptConfig) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if path.is_file() && config.is_script_path(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn spawn_reload_worker<C: HostContext>(
    shared: Arc<EngineShared<C>>,
    receiver: Receiver<ScriptFileEvent>,
    window: Duration,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new().name("script-reload".into()).spawn(move || {
        let mut debouncer = Debouncer::new(window);
        while !shutdown.load(Ordering::Acquire) {
            let wait = debouncer
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or(WORKER_IDLE_POLL)
                .min(WORKER_IDLE_POLL);
            match receiver.recv_timeout(wait) {
                Ok(event) => debouncer.push(event, Instant::now()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            // Events that arrive while these reloads run queue up in the channel and get
            // their own pass afterwards.
            for (path, action) in debouncer.drain_ready(Instant::now()) {
                shared.apply(&path, action);
            }
        }
        if !debouncer.is_empty() {
            log::debug!(target: "scripts", "dropping {} pending script changes on shutdown", debouncer.pending());
        }
    })
}
