//! Configuration for the spider

use crate::error::{Result, SpiderError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Spider configuration, fixed for the lifetime of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpiderConfig {
    /// Path to the SQLite catalog
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Where per-share baseline listings are kept
    #[serde(default = "default_save_dir")]
    pub save_dir: PathBuf,

    /// Directory holding the low-level scanner binaries
    #[serde(default = "default_scanners_dir")]
    pub scanners_dir: PathBuf,

    /// Maximum scanner processes running at once
    #[serde(default = "default_max_scanners")]
    pub max_scanners: usize,

    /// Shares selected per free scanner slot
    #[serde(default = "default_select_multiplier")]
    pub select_multiplier: f64,

    /// Idle wait between scheduler polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// A patch with more than `patch_fallback` lines per listing line is
    /// ignored and the listing is applied instead
    #[serde(default = "default_patch_fallback")]
    pub patch_fallback: f64,

    /// Scanner output beyond this many lines fails the scan
    #[serde(default = "default_max_lines")]
    pub max_lines_from_scanner: u64,

    /// Backoff after a successful (or claimed) scan
    #[serde(default = "default_wait_until_next_scan")]
    pub wait_until_next_scan_secs: u64,

    /// Backoff after a failed scan
    #[serde(default = "default_wait_until_next_scan_failed")]
    pub wait_until_next_scan_failed_secs: u64,

    /// Wall-clock limit for one scanner process
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,

    /// Tree locks older than this are considered abandoned
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// Forward scanner stderr to the log
    #[serde(default = "default_scanners_logging")]
    pub scanners_logging: bool,
}

fn default_database_path() -> PathBuf {
    uguu_logging::uguu_home().join("uguu.sqlite3")
}

fn default_save_dir() -> PathBuf {
    uguu_logging::uguu_home().join("save")
}

fn default_scanners_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_max_scanners() -> usize {
    2
}

fn default_select_multiplier() -> f64 {
    1.0
}

fn default_poll_interval() -> u64 {
    10
}

fn default_patch_fallback() -> f64 {
    0.8
}

fn default_max_lines() -> u64 {
    4_000_000
}

fn default_wait_until_next_scan() -> u64 {
    12 * 3600
}

fn default_wait_until_next_scan_failed() -> u64 {
    2 * 3600
}

fn default_scan_timeout() -> u64 {
    4 * 3600
}

fn default_lock_ttl() -> u64 {
    24 * 3600
}

fn default_scanners_logging() -> bool {
    true
}

impl Default for SpiderConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            save_dir: default_save_dir(),
            scanners_dir: default_scanners_dir(),
            max_scanners: default_max_scanners(),
            select_multiplier: default_select_multiplier(),
            poll_interval_secs: default_poll_interval(),
            patch_fallback: default_patch_fallback(),
            max_lines_from_scanner: default_max_lines(),
            wait_until_next_scan_secs: default_wait_until_next_scan(),
            wait_until_next_scan_failed_secs: default_wait_until_next_scan_failed(),
            scan_timeout_secs: default_scan_timeout(),
            lock_ttl_secs: default_lock_ttl(),
            scanners_logging: default_scanners_logging(),
        }
    }
}

impl SpiderConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SpiderConfig =
            toml::from_str(&content).map_err(|e| SpiderError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| SpiderError::config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the scheduler cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_scanners == 0 {
            return Err(SpiderError::config("max_scanners must be at least 1"));
        }
        if !(self.select_multiplier >= 1.0) {
            return Err(SpiderError::config("select_multiplier must be >= 1.0"));
        }
        if !(self.patch_fallback > 0.0) {
            return Err(SpiderError::config("patch_fallback must be positive"));
        }
        if self.max_lines_from_scanner == 0 {
            return Err(SpiderError::config("max_lines_from_scanner must be positive"));
        }
        Ok(())
    }

    /// Create the save directory if needed; a regular file in its place is
    /// an error.
    pub fn ensure_save_dir(&self) -> Result<()> {
        if self.save_dir.is_dir() {
            return Ok(());
        }
        if self.save_dir.exists() {
            return Err(SpiderError::config(format!(
                "{} should be a directory, not a file",
                self.save_dir.display()
            )));
        }
        tracing::info!(dir = %self.save_dir.display(), "Save directory doesn't exist, creating");
        std::fs::create_dir_all(&self.save_dir)?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    /// Success backoff in milliseconds
    pub fn success_backoff_millis(&self) -> i64 {
        secs_to_millis(self.wait_until_next_scan_secs)
    }

    /// Failure backoff in milliseconds
    pub fn failure_backoff_millis(&self) -> i64 {
        secs_to_millis(self.wait_until_next_scan_failed_secs)
    }

    pub fn lock_ttl_millis(&self) -> i64 {
        secs_to_millis(self.lock_ttl_secs)
    }

    /// How many shares to select for `free` empty scanner slots
    pub fn select_limit(&self, free: usize) -> usize {
        ((self.select_multiplier * free as f64) as usize).max(free)
    }
}

fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}
