//! Configuration schema for Stevedore
//!
//! Configuration is stored at `~/.config/stevedore/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Stages storage settings
    pub storage: StorageConfig,

    /// Stages storage cache settings
    pub cache: CacheConfig,

    /// Parallel execution settings
    pub parallel: ParallelConfig,

    /// Lock settings
    pub lock: LockConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
        }
    }
}

/// Stages storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `:local` for the local image runtime, otherwise a registry repository
    pub address: String,

    /// Docker-compatible CLI used to talk to the local image runtime
    pub runtime: String,

    /// Talk plain HTTP to the registry
    pub insecure_registry: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            address: ":local".to_string(),
            runtime: "docker".to_string(),
            insecure_registry: false,
        }
    }
}

/// Stages storage cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Backend: "file", "memory" or "http". "memory" keeps the cache objects
    /// in this process, share it through `stevedore serve`
    pub backend: String,

    /// Cache directory of the file backend (default: state dir)
    pub dir: Option<PathBuf>,

    /// Directory of the previous file cache layout, purged on first use
    pub legacy_dir: Option<PathBuf>,

    /// Namespace holding the per-project cache objects of the memory backend
    pub namespace: String,

    /// Cache object name prefix, objects are named `<prefix>-<project>`
    pub config_map_prefix: String,

    /// Synchronization server URL of the http backend
    pub url: Option<String>,

    /// Request timeout of the http backend in seconds
    pub timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            dir: None,
            legacy_dir: None,
            namespace: "stevedore-synchronization".to_string(),
            config_map_prefix: "stevedore".to_string(),
            url: None,
            timeout_secs: 30,
        }
    }
}

/// Parallel execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Maximum concurrent workers (0 = one per task)
    pub max_workers: usize,

    /// Stream the first worker's output live
    pub live_output: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            live_output: false,
        }
    }
}

/// Lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Backend: "file" (shared by every process on the host) or "memory"
    pub backend: String,

    /// Lock file directory of the file backend (default: state dir)
    pub dir: Option<PathBuf>,

    /// Give up waiting for a lock after N seconds (0 = wait forever)
    pub timeout_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            dir: None,
            timeout_secs: 0,
        }
    }
}
