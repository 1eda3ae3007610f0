use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::time::Duration;

/// A filesystem change to a script file, already filtered by suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptFileEvent {
    Created(PathBuf),
    Changed(PathBuf),
    Deleted(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

/// Decides which paths inside the watched directory are scripts.
#[derive(Debug, Clone)]
pub struct ScriptFilter {
    root: PathBuf,
    suffix: String,
}

impl ScriptFilter {
    pub fn new(root: impl AsRef<Path>, suffix: impl Into<String>) -> Self {
        Self { root: normalize_path(root.as_ref()), suffix: suffix.into() }
    }

    pub fn matches(&self, path: &Path) -> bool {
        let named_like_script = path
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| name.len() > self.suffix.len() && name.ends_with(&self.suffix));
        named_like_script && path.parent().map_or(false, |parent| normalize_path(parent) == self.root)
    }
}

/// Maps a raw notify event onto script events. Renames are split when only one side is a
/// script: moving a script away reads as a delete, moving one in reads as a create.
pub fn normalize_event(event: &Event, filter: &ScriptFilter) -> Vec<ScriptFileEvent> {
    let scripts = || event.paths.iter().filter(|path| filter.matches(path)).cloned();
    match &event.kind {
        EventKind::Create(_) => scripts().map(ScriptFileEvent::Created).collect(),
        EventKind::Remove(_) => scripts().map(ScriptFileEvent::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() >= 2 => {
            let (from, to) = (&event.paths[0], &event.paths[1]);
            match (filter.matches(from), filter.matches(to)) {
                (true, true) => vec![ScriptFileEvent::Renamed { from: from.clone(), to: to.clone() }],
                (true, false) => vec![ScriptFileEvent::Deleted(from.clone())],
                (false, true) => vec![ScriptFileEvent::Created(to.clone())],
                (false, false) => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => scripts().map(ScriptFileEvent::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => scripts().map(ScriptFileEvent::Created).collect(),
        EventKind::Modify(ModifyKind::Name(_)) => scripts()
            .map(|path| if path.exists() { ScriptFileEvent::Created(path) } else { ScriptFileEvent::Deleted(path) })
            .collect(),
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            scripts().map(ScriptFileEvent::Changed).collect()
        }
        _ => Vec::new(),
    }
}

/// Non-recursive watch over one script directory, forwarding normalized events to `sink`.
pub struct ScriptWatcher {
    _watcher: RecommendedWatcher,
}

impl ScriptWatcher {
    pub fn attach(root: impl AsRef<Path>, suffix: &str, sink: Sender<ScriptFileEvent>) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            anyhow::bail!("script directory '{}' does not exist", root.display());
        }
        let root = normalize_path(root);
        let filter = ScriptFilter::new(&root, suffix);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in normalize_event(&event, &filter) {
                    log::trace!(target: "scripts::watch", "{change:?}");
                    let _ = sink.send(change);
                }
            }
            Err(err) => log::warn!(target: "scripts::watch", "script watcher error: {err}"),
        })
        .context("create script watcher")?;
        watcher
            .configure(
                NotifyConfig::default()
                    .with_compare_contents(false)
                    .with_poll_interval(Duration::from_millis(300)),
            )
            .context("configure script watcher")?;
        watcher
            .watch(&root, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch {}", root.display()))?;
        log::debug!(target: "scripts::watch", "watching {}", root.display());
        Ok(Self { _watcher: watcher })
    }
}

/// Absolute, canonical form of `path`. For paths that no longer exist the parent is
/// canonicalized instead, so deleted files still compare equal to their registry keys.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else if let Ok(cwd) = env::current_dir() {
        cwd.join(path)
    } else {
        path.to_path_buf()
    };
    match fs::canonicalize(&absolute) {
        Ok(canonical) => canonical,
        Err(_) => {
            if let Some(parent) = absolute.parent() {
                if let Ok(parent_canon) = fs::canonicalize(parent) {
                    if let Some(name) = absolute.file_name() {
                        return parent_canon.join(name);
                    }
                    return parent_canon;
                }
            }
            absolute
        }
    }
}
