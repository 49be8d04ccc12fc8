//! albumfs core - shared types used across all albumfs components
//!
//! This crate contains the foundational pieces the engine is built on:
//! typed path locators, the error taxonomy, and configuration. It has no
//! dependencies on networking or filesystem code.

pub mod config;
pub mod error;
pub mod locator;

pub use config::{AccountConfig, CacheConfig, Config, SyncConfig};
pub use error::{CacheError, CacheResult};
pub use locator::{Kind, Locator};

/// Maximum path depth below the root (user/album/image)
pub const MAX_DEPTH: usize = 3;

/// Name of the virtual control directory under the filesystem root
pub const CONTROL_DIR: &str = ".control";

/// Query suffix carrying an unlisted album's capability token
pub const AUTH_KEY_MARKER: &str = "?authkey=";

/// Default interval between metadata refreshes of a cached entry (seconds)
pub const DEFAULT_UPDATE_INTERVAL_SECS: u64 = 600;

/// Default interval between cache snapshots written by the workers (seconds)
pub const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 300;
