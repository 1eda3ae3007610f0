use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ScriptError;

pub const DEFAULT_SCRIPT_SUFFIX: &str = ".script.rhai";

/// Rhai package groups a script may be compiled against. `core` is always present.
pub const KNOWN_PACKAGES: &[&str] = &["core", "logic", "math", "string", "string_more", "array", "map", "time"];

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptLimits {
    #[serde(default = "ScriptLimits::default_max_operations")]
    pub max_operations: u64,
    #[serde(default = "ScriptLimits::default_max_call_levels")]
    pub max_call_levels: usize,
    #[serde(default = "ScriptLimits::default_max_expr_depth")]
    pub max_expr_depth: usize,
    #[serde(default = "ScriptLimits::default_max_string_size")]
    pub max_string_size: usize,
    #[serde(default = "ScriptLimits::default_max_array_size")]
    pub max_array_size: usize,
    #[serde(default = "ScriptLimits::default_max_map_size")]
    pub max_map_size: usize,
}

impl ScriptLimits {
    const fn default_max_operations() -> u64 {
        100_000
    }

    const fn default_max_call_levels() -> usize {
        64
    }

    const fn default_max_expr_depth() -> usize {
        64
    }

    const fn default_max_string_size() -> usize {
        10_000
    }

    const fn default_max_array_size() -> usize {
        1_000
    }

    const fn default_max_map_size() -> usize {
        500
    }
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: Self::default_max_operations(),
            max_call_levels: Self::default_max_call_levels(),
            max_expr_depth: Self::default_max_expr_depth(),
            max_string_size: Self::default_max_string_size(),
            max_array_size: Self::default_max_array_size(),
            max_map_size: Self::default_max_map_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptConfig {
    #[serde(default = "ScriptConfig::default_suffix")]
    pub suffix: String,
    #[serde(default = "ScriptConfig::default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "ScriptConfig::default_read_retry_delay_ms")]
    pub read_retry_delay_ms: u64,
    #[serde(default = "ScriptConfig::default_watch")]
    pub watch: bool,
    #[serde(default = "ScriptConfig::default_packages")]
    pub packages: Vec<String>,
    #[serde(default)]
    pub limits: ScriptLimits,
    #[serde(default = "ScriptConfig::default_ast_cache_limit")]
    pub ast_cache_limit: usize,
}

impl ScriptConfig {
    fn default_suffix() -> String {
        DEFAULT_SCRIPT_SUFFIX.to_string()
    }

    const fn default_debounce_ms() -> u64 {
        100
    }

    const fn default_read_retry_delay_ms() -> u64 {
        50
    }

    const fn default_watch() -> bool {
        true
    }

    fn default_packages() -> Vec<String> {
        ["core", "logic", "math", "string", "array", "map"].iter().map(|name| name.to_string()).collect()
    }

    const fn default_ast_cache_limit() -> usize {
        64
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }

    /// True when `path` names a script file under this configuration's suffix.
    pub fn is_script_path(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| name.len() > self.suffix.len() && name.ends_with(&self.suffix))
    }

    /// The file name with the script suffix stripped, e.g. `Spawner` for `Spawner.script.rhai`.
    pub fn script_stem<'a>(&self, path: &'a Path) -> Option<&'a str> {
        let name = path.file_name()?.to_str()?;
        name.strip_suffix(self.suffix.as_str()).filter(|stem| !stem.is_empty())
    }

    pub fn validate(&self) -> Result<(), ScriptError> {
        if self.suffix.is_empty() {
            return Err(ScriptError::Config("script suffix must not be empty".into()));
        }
        for package in &self.packages {
            if !KNOWN_PACKAGES.contains(&package.as_str()) {
                return Err(ScriptError::Config(format!(
                    "unknown package '{package}' (known: {})",
                    KNOWN_PACKAGES.join(", ")
                )));
            }
        }
        Ok(())
    }
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            suffix: Self::default_suffix(),
            debounce_ms: Self::default_debounce_ms(),
            read_retry_delay_ms: Self::default_read_retry_delay_ms(),
            watch: Self::default_watch(),
            packages: Self::default_packages(),
            limits: ScriptLimits::default(),
            ast_cache_limit: Self::default_ast_cache_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "RunnerConfig::default_scripts_dir")]
    pub scripts_dir: PathBuf,
    #[serde(default = "RunnerConfig::default_frame_ms")]
    pub frame_ms: u64,
    /// Number of frames to run before exiting; `None` runs until interrupted.
    #[serde(default)]
    pub frames: Option<u64>,
    #[serde(default)]
    pub player: [f32; 2],
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "RunnerConfig::default_summary_every")]
    pub summary_every: u64,
}

impl RunnerConfig {
    fn default_scripts_dir() -> PathBuf {
        PathBuf::from("assets/scripts")
    }

    const fn default_frame_ms() -> u64 {
        16
    }

    const fn default_summary_every() -> u64 {
        60
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_ms.max(1))
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            scripts_dir: Self::default_scripts_dir(),
            frame_ms: Self::default_frame_ms(),
            frames: None,
            player: [0.0, 0.0],
            seed: None,
            summary_every: Self::default_summary_every(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub scripts: ScriptConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppConfigOverrides {
    pub scripts_dir: Option<PathBuf>,
    pub frames: Option<u64>,
    pub frame_ms: Option<u64>,
    pub watch: Option<bool>,
    pub seed: Option<u64>,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg: AppConfig = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        cfg.scripts.validate().with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &AppConfigOverrides) {
        if let Some(dir) = &overrides.scripts_dir {
            self.runner.scripts_dir = dir.clone();
        }
        if let Some(frames) = overrides.frames {
            self.runner.frames = Some(frames);
        }
        if let Some(frame_ms) = overrides.frame_ms {
            self.runner.frame_ms = frame_ms;
        }
        if let Some(watch) = overrides.watch {
            self.scripts.watch = watch;
        }
        if let Some(seed) = overrides.seed {
            self.runner.seed = Some(seed);
        }
    }
}

impl AppConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.applied_fields().is_empty()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.scripts_dir.is_some() {
            fields.push("scripts_dir");
        }
        if self.frames.is_some() {
            fields.push("frames");
        }
        if self.frame_ms.is_some() {
            fields.push("frame_ms");
        }
        if self.watch.is_some() {
            fields.push("watch");
        }
        if self.seed.is_some() {
            fields.push("seed");
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(cfg.scripts.suffix, DEFAULT_SCRIPT_SUFFIX);
        assert_eq!(cfg.scripts.debounce(), Duration::from_millis(100));
        assert_eq!(cfg.scripts.limits.max_operations, 100_000);
        assert_eq!(cfg.runner.frame_ms, 16);
        assert!(cfg.scripts.watch);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{ "scripts": { "debounce_ms": 250, "limits": { "max_call_levels": 8 } } }"#)
                .expect("parse");
        assert_eq!(cfg.scripts.debounce_ms, 250);
        assert_eq!(cfg.scripts.limits.max_call_levels, 8);
        assert_eq!(cfg.scripts.limits.max_map_size, 500);
        assert_eq!(cfg.scripts.read_retry_delay_ms, 50);
    }

    #[test]
    fn unknown_package_is_rejected() {
        let cfg = ScriptConfig { packages: vec!["core".into(), "filesystem".into()], ..ScriptConfig::default() };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("filesystem"));
    }

    #[test]
    fn suffix_matching_requires_a_stem() {
        let cfg = ScriptConfig::default();
        assert!(cfg.is_script_path(Path::new("/tmp/scripts/Spawner.script.rhai")));
        assert!(!cfg.is_script_path(Path::new("/tmp/scripts/Spawner.rhai")));
        assert!(!cfg.is_script_path(Path::new("/tmp/scripts/.script.rhai")));
        assert_eq!(cfg.script_stem(Path::new("a/Spawner.script.rhai")), Some("Spawner"));
        assert_eq!(cfg.script_stem(Path::new("a/notes.txt")), None);
    }

    #[test]
    fn overrides_apply_to_runner_and_scripts() {
        let mut cfg = AppConfig::default();
        let overrides = AppConfigOverrides {
            scripts_dir: Some(PathBuf::from("mods")),
            frames: Some(10),
            watch: Some(false),
            ..AppConfigOverrides::default()
        };
        cfg.apply_overrides(&overrides);
        assert_eq!(cfg.runner.scripts_dir, PathBuf::from("mods"));
        assert_eq!(cfg.runner.frames, Some(10));
        assert!(!cfg.scripts.watch);
        assert_eq!(overrides.applied_fields(), vec!["scripts_dir", "frames", "watch"]);
    }
}
