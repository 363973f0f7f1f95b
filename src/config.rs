//! Configuration for roster-sync

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, RosterError};

/// Default location of the sled cache database
pub fn default_cache_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("roster-sync")
        .join("cache.sled")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Path to sled database
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,

    /// Snapshots older than this are refreshed synchronously on read
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,

    /// sled page cache size in bytes
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Maximum documents per batched write
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Maximum values in a single `in` filter
    #[serde(default = "default_in_filter_limit")]
    pub in_filter_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Times a roster view re-subscribes after its live query fails
    #[serde(default = "default_resubscribe_attempts")]
    pub resubscribe_attempts: u32,
}

fn default_max_age_secs() -> u64 {
    300
}

fn default_capacity_bytes() -> u64 {
    64 * 1024 * 1024 // 64MB
}

fn default_batch_limit() -> usize {
    500
}

fn default_in_filter_limit() -> usize {
    10
}

fn default_resubscribe_attempts() -> u32 {
    1
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            max_age_secs: default_max_age_secs(),
            capacity_bytes: default_capacity_bytes(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            batch_limit: default_batch_limit(),
            in_filter_limit: default_in_filter_limit(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            resubscribe_attempts: default_resubscribe_attempts(),
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| RosterError::Config(e.to_string()))
    }

    /// Save config to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RosterError::Config(e.to_string()))
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("ROSTER_CACHE_DIR") {
            self.cache.path = PathBuf::from(dir).join("cache.sled");
        }

        if let Ok(val) = std::env::var("ROSTER_CACHE_MAX_AGE_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.cache.max_age_secs = secs;
            }
        }

        if let Ok(val) = std::env::var("ROSTER_BATCH_LIMIT") {
            if let Ok(limit) = val.parse::<usize>() {
                self.remote.batch_limit = limit;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote.batch_limit == 0 {
            return Err(RosterError::Config("remote.batch_limit must be > 0".into()));
        }
        // A numeric cadet id is matched in both its string and number forms.
        if self.remote.in_filter_limit < 2 {
            return Err(RosterError::Config("remote.in_filter_limit must be >= 2".into()));
        }
        Ok(())
    }
}
