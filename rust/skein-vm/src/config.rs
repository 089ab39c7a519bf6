//! Runtime configuration from `skein.toml`.
//!
//! Searches the current directory then its ancestors, falling back to
//! `~/.config/skein/skein.toml`. Every section is optional.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE: &str = "skein.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read '{path}': {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("invalid toml in '{path}': {source}")]
    Parse { path: PathBuf, source: toml::de::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Local,
    Distributed,
}

impl std::str::FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(ExecutorKind::Local),
            "distributed" => Ok(ExecutorKind::Distributed),
            other => Err(format!("unknown executor '{}' (expected local or distributed)", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default)]
    pub kind: ExecutorKind,
    /// Invocation worker threads for the distributed executor. Defaults to
    /// the number of CPUs.
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinuationSection {
    /// Directory for continuation files; in-memory when unset.
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub compress: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Where JSONL exports go; no export when unset.
    pub dir: Option<PathBuf>,
}

impl Default for TraceSection {
    fn default() -> Self {
        TraceSection { enabled: true, dir: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default = "default_entry")]
    pub entry: String,
    /// 0 waits forever.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RunSection {
    fn default() -> Self {
        RunSection { entry: default_entry(), timeout_ms: default_timeout_ms() }
    }
}

fn default_true() -> bool {
    true
}

fn default_entry() -> String {
    "main".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub continuations: ContinuationSection,
    #[serde(default)]
    pub trace: TraceSection,
    #[serde(default)]
    pub run: RunSection,
}

impl RuntimeConfig {
    /// Load the nearest `skein.toml`, or defaults when there is none.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Path of the config file [`RuntimeConfig::load`] would read.
    pub fn find() -> Option<PathBuf> {
        let start = std::env::current_dir().ok()?;
        Self::find_from(&start)
    }

    fn find_from(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_FILE);
            if candidate.exists() {
                return Some(candidate);
            }
            if !dir.pop() {
                break;
            }
        }
        // Try global config
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;
        let global = home.join(".config").join("skein").join(CONFIG_FILE);
        global.exists().then_some(global)
    }

    /// `None` when runs wait forever.
    pub fn timeout(&self) -> Option<Duration> {
        (self.run.timeout_ms > 0).then(|| Duration::from_millis(self.run.timeout_ms))
    }

    pub fn workers(&self) -> usize {
        self.executor.workers.filter(|n| *n > 0).unwrap_or_else(num_cpus::get)
    }
}
