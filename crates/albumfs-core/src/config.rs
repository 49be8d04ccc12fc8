//! Configuration
//!
//! TOML configuration with sensible defaults, loaded from the platform
//! config directory (or an explicit path) and overridable from the CLI.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{DEFAULT_SNAPSHOT_INTERVAL_SECS, DEFAULT_UPDATE_INTERVAL_SECS};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Account settings
    pub account: AccountConfig,
    /// Cache settings
    pub cache: CacheConfig,
    /// Synchronization settings
    pub sync: SyncConfig,
}

/// Remote account configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Authenticated user name; empty means anonymous browsing only
    pub user: String,
    /// Password; usually supplied via the CLI/env instead of the file
    pub password: Option<String>,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root directory (uses the system cache dir if None)
    pub root: Option<PathBuf>,
    /// Seconds of worker activity between periodic snapshots
    pub snapshot_interval_secs: u64,
    /// Number of lines retained by the rolling control log
    pub log_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            snapshot_interval_secs: DEFAULT_SNAPSHOT_INTERVAL_SECS,
            log_capacity: 1000,
        }
    }
}

/// Synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Staleness window: a cached entry younger than this is not re-pulled
    pub update_interval_secs: u64,
    /// Pixel budget applied to images before upload (0 disables resizing)
    pub max_pixels: u64,
    /// Start with networking suspended
    pub offline: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: DEFAULT_UPDATE_INTERVAL_SECS,
            max_pixels: 0,
            offline: false,
        }
    }
}

impl Config {
    /// Load configuration from the given path, or the default location when
    /// `None`. Missing files yield the defaults; unreadable files are
    /// reported and also yield the defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_config_path() {
                Some(p) => p,
                None => return Self::default(),
            },
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(cfg) => {
                    debug!("loaded configuration from {:?}", path);
                    cfg
                }
                Err(e) => {
                    warn!("ignoring malformed config {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Platform config file location, e.g. `~/.config/albumfs/config.toml`
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "albumfs").map(|d| d.config_dir().join("config.toml"))
    }

    /// Resolved cache root: the configured one, the platform cache dir, or
    /// a last-resort path under /tmp.
    pub fn cache_root(&self) -> PathBuf {
        if let Some(root) = &self.cache.root {
            return root.clone();
        }
        ProjectDirs::from("", "", "albumfs")
            .map(|d| d.cache_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/tmp/.albumfs"))
    }
}
