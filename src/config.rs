//! Ambient project configuration — `vigil.toml` (SPEC_FULL.md §3.3).
//!
//! Mirrors the teacher's `.imacs_root`/`LocalConfig`/`MergedConfig`
//! layering (`project.rs`/`config.rs`): a single optional config file is
//! discovered by walking up from the current directory, and a run's
//! effective settings are the file's defaults overridden by whatever the
//! CLI passed explicitly.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `[defaults]` — request-level defaults applied unless a Test overrides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub timeout_ms: u64,
    pub follow_redirects: bool,
    pub user_agent: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            follow_redirects: true,
            user_agent: format!("vigil/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DefaultsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// `[latency]` — defaults for the Latency check (spec §4.7) when a Test
/// leaves `N`/`Concurrent` unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub concurrent: usize,
    pub samples: usize,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            concurrent: 2,
            samples: 50,
        }
    }
}

/// Report output format selected by `--json` or `[report] format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

/// `[report]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub format: ReportFormat,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            format: ReportFormat::default(),
        }
    }
}

/// The full contents of a `vigil.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    pub defaults: DefaultsConfig,
    pub latency: LatencyConfig,
    pub report: ReportConfig,
}

/// Walk up from `start_dir` looking for `vigil.toml`, the same
/// parent-walking discovery the teacher's `find_root` uses for
/// `.imacs_root` (`project.rs`).
pub fn find_config(start_dir: &Path) -> Result<Option<PathBuf>> {
    let mut current = start_dir.canonicalize().map_err(Error::Io)?;
    loop {
        let candidate = current.join("vigil.toml");
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return Ok(None),
        }
    }
}

/// Load the effective configuration: `vigil.toml` discovered from
/// `start_dir`, falling back to hardcoded defaults when absent.
pub fn load_config(start_dir: &Path) -> Result<VigilConfig> {
    match find_config(start_dir)? {
        Some(path) => {
            let text = std::fs::read_to_string(&path).map_err(Error::Io)?;
            toml::from_str(&text).map_err(Error::Toml)
        }
        None => Ok(VigilConfig::default()),
    }
}
