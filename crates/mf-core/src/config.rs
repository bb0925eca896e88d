//! Application configuration types.
//!
//! The top-level [`Config`] is read from JSON or TOML (chosen by file
//! extension). Every section defaults sensibly so an empty document is
//! valid.
//!
//! [`Config::load_layered`] merges up to three files, lowest precedence
//! first: the user file (`<config dir>/mp3forge/config.{toml,json}`), the
//! project file (`./.mp3forge.{toml,json}`) and an explicit `--config`
//! path. Later layers override individual keys of earlier ones. A broken
//! user or project file is skipped with a warning; a broken explicit file
//! is an error. Command-line flags are applied on top by the binary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::Result;
use crate::model::EncodingOptions;
use crate::Error;

/// Upper bound accepted for an explicit worker count.
pub const MAX_WORKERS: usize = 32;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Directory under the platform config dir holding the user file.
pub const APP_DIR: &str = "mp3forge";

const USER_FILES: [&str; 2] = ["config.toml", "config.json"];
const PROJECT_FILES: [&str; 2] = [".mp3forge.toml", ".mp3forge.json"];

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub encoding: EncodingOptions,
    pub scheduler: SchedulerConfig,
    pub batch: BatchConfig,
    pub tools: ToolsConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Read and parse a config file; `.toml` files are parsed as TOML,
    /// everything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&contents),
            _ => Self::from_json(&contents),
        }
    }

    /// Merge every layer found in `sources` over the defaults.
    pub fn load_layered(sources: &ConfigSources) -> Result<LayeredConfig> {
        let mut merged = Value::Object(Map::new());
        let mut loaded = Vec::new();
        let mut warnings = Vec::new();

        for path in sources.implicit_files() {
            match read_layer(&path) {
                Ok(layer) => {
                    merge_values(&mut merged, layer);
                    loaded.push(path);
                }
                Err(e) => warnings.push(format!("ignoring config {}: {e}", path.display())),
            }
        }
        if let Some(path) = &sources.explicit {
            merge_values(&mut merged, read_layer(path)?);
            loaded.push(path.clone());
        }

        let config = serde_json::from_value(merged)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))?;
        Ok(LayeredConfig {
            config,
            loaded,
            warnings,
        })
    }

    /// Check every value that would make a run impossible.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.encoding.validate() {
            errors.push(e.to_string());
        }
        if self.scheduler.max_concurrent_items == 0 {
            errors.push("scheduler.max_concurrent_items must be at least 1".into());
        }
        if self.scheduler.subscriber_buffer == 0 {
            errors.push("scheduler.subscriber_buffer must be at least 1".into());
        }
        if self.scheduler.keepalive_secs == 0 {
            errors.push("scheduler.keepalive_secs must be at least 1".into());
        }
        if self.batch.item_timeout_secs == 0 {
            errors.push("batch.item_timeout_secs must be at least 1".into());
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(format!(
                "logging.level must be one of {LOG_LEVELS:?}, got {}",
                self.logging.level
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors.join("; ")))
        }
    }

    /// Return a list of non-fatal issues.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.batch.sequential && matches!(self.batch.workers, WorkerCount::Fixed(n) if n > 1) {
            warnings.push(format!(
                "batch.sequential is set; batch.workers = {} is ignored",
                self.batch.workers
            ));
        }
        for (name, path) in [
            ("tools.ffmpeg_path", &self.tools.ffmpeg_path),
            ("tools.ffprobe_path", &self.tools.ffprobe_path),
        ] {
            if let Some(p) = path {
                if !p.exists() {
                    warnings.push(format!("{name} does not exist: {}", p.display()));
                }
            }
        }
        if let Some(file) = &self.logging.file {
            if let Some(parent) = file.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    warnings.push(format!(
                        "logging.file directory does not exist: {}",
                        parent.display()
                    ));
                }
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Layering
// ---------------------------------------------------------------------------

/// Directories and files searched by [`Config::load_layered`].
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub user_dir: Option<PathBuf>,
    pub project_dir: Option<PathBuf>,
    pub explicit: Option<PathBuf>,
}

impl ConfigSources {
    /// The platform user config dir and the current directory.
    pub fn discover(explicit: Option<PathBuf>) -> Self {
        Self {
            user_dir: dirs::config_dir().map(|p| p.join(APP_DIR)),
            project_dir: std::env::current_dir().ok(),
            explicit,
        }
    }

    /// Existing user and project files, lowest precedence first.
    fn implicit_files(&self) -> Vec<PathBuf> {
        [
            (&self.user_dir, USER_FILES),
            (&self.project_dir, PROJECT_FILES),
        ]
        .into_iter()
        .filter_map(|(dir, names)| {
            let dir = dir.as_ref()?;
            names.iter().map(|n| dir.join(n)).find(|p| p.is_file())
        })
        .collect()
    }
}

/// Result of [`Config::load_layered`].
#[derive(Debug, Clone)]
pub struct LayeredConfig {
    pub config: Config,
    /// Files that contributed, lowest precedence first.
    pub loaded: Vec<PathBuf>,
    /// Layers that were skipped, with the reason.
    pub warnings: Vec<String>,
}

/// Parse one file into a generic tree, rejecting it unless it would also
/// load as a [`Config`] on its own.
fn read_layer(path: &Path) -> Result<Value> {
    let contents = std::fs::read_to_string(path)?;
    let value: Value = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&contents)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))?,
        _ => serde_json::from_str(&contents)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))?,
    };
    serde_json::from_value::<Config>(value.clone())
        .map_err(|e| Error::Validation(format!("config parse error: {e}")))?;
    Ok(value)
}

/// Tables merge key by key; anything else in `layer` replaces `base`.
fn merge_values(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Settings for request-scoped batch runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Items encoding at once within one batch.
    pub max_concurrent_items: usize,
    /// Queue depth per event subscriber.
    pub subscriber_buffer: usize,
    /// Seconds of silence before a keepalive frame.
    pub keepalive_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_items: 3,
            subscriber_buffer: 64,
            keepalive_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Batch (offline / CLI)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub workers: WorkerCount,
    pub fail_fast: bool,
    pub sequential: bool,
    pub item_timeout_secs: u64,
    pub progress: ProgressMode,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: WorkerCount::Auto,
            fail_fast: false,
            sequential: false,
            item_timeout_secs: 3600,
            progress: ProgressMode::Rich,
        }
    }
}

/// Requested worker count: `auto` or an explicit number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "WorkerCountRepr", into = "WorkerCountRepr")]
pub enum WorkerCount {
    #[default]
    Auto,
    Fixed(usize),
}

impl FromStr for WorkerCount {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(WorkerCount::Auto);
        }
        let n: usize = s
            .parse()
            .map_err(|_| Error::Validation(format!("workers must be 'auto' or a number, got {s}")))?;
        WorkerCount::fixed(n)
    }
}

impl WorkerCount {
    pub fn fixed(n: usize) -> Result<Self> {
        if (1..=MAX_WORKERS).contains(&n) {
            Ok(WorkerCount::Fixed(n))
        } else {
            Err(Error::Validation(format!(
                "workers must be between 1 and {MAX_WORKERS}, got {n}"
            )))
        }
    }
}

impl fmt::Display for WorkerCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerCount::Auto => f.write_str("auto"),
            WorkerCount::Fixed(n) => write!(f, "{n}"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WorkerCountRepr {
    Number(usize),
    Text(String),
}

impl TryFrom<WorkerCountRepr> for WorkerCount {
    type Error = Error;

    fn try_from(repr: WorkerCountRepr) -> Result<Self> {
        match repr {
            WorkerCountRepr::Number(n) => WorkerCount::fixed(n),
            WorkerCountRepr::Text(s) => s.parse(),
        }
    }
}

impl From<WorkerCount> for WorkerCountRepr {
    fn from(count: WorkerCount) -> Self {
        match count {
            WorkerCount::Auto => WorkerCountRepr::Text("auto".into()),
            WorkerCount::Fixed(n) => WorkerCountRepr::Number(n),
        }
    }
}

/// How the CLI renders batch progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    #[default]
    Rich,
    Plain,
    None,
}

impl FromStr for ProgressMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rich" => Ok(ProgressMode::Rich),
            "plain" => Ok(ProgressMode::Plain),
            "none" => Ok(ProgressMode::None),
            other => Err(Error::Validation(format!("unknown progress mode: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tools / logging
// ---------------------------------------------------------------------------

/// Explicit tool locations; unset entries are looked up on `PATH`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
        }
    }
}
