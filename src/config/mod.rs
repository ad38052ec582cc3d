//! Configuration management for Stevedore

pub mod schema;

pub use schema::Config;

use crate::error::{StevedoreError, StevedoreResult};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stevedore")
            .join("config.toml")
    }

    /// Get the state directory path
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stevedore")
    }

    /// Default directory of the file stages storage cache
    pub fn stages_storage_cache_dir() -> PathBuf {
        Self::state_dir().join("stages_storage_cache")
    }

    /// Default directory of the previous file cache layout
    pub fn legacy_stages_storage_cache_dir() -> PathBuf {
        Self::state_dir().join("stages_storage_01")
    }

    /// Default directory of host lock files
    pub fn locks_dir() -> PathBuf {
        Self::state_dir().join("locks")
    }

    /// Load configuration, creating default if not exists
    pub async fn load(&self) -> StevedoreResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> StevedoreResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| StevedoreError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| StevedoreError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> StevedoreResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            StevedoreError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> StevedoreResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StevedoreError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Ensure the state directory exists
    pub async fn ensure_state_dirs() -> StevedoreResult<()> {
        let dir = Self::state_dir();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StevedoreError::io(format!("creating directory {}", dir.display()), e))
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// File cache directory, falling back to the state dir
    pub fn cache_dir(&self) -> PathBuf {
        self.cache
            .dir
            .clone()
            .unwrap_or_else(ConfigManager::stages_storage_cache_dir)
    }

    /// Legacy file cache directory, falling back to the state dir
    pub fn legacy_cache_dir(&self) -> PathBuf {
        self.cache
            .legacy_dir
            .clone()
            .unwrap_or_else(ConfigManager::legacy_stages_storage_cache_dir)
    }

    /// Host lock directory, falling back to the state dir
    pub fn lock_dir(&self) -> PathBuf {
        self.lock.dir.clone().unwrap_or_else(ConfigManager::locks_dir)
    }

    /// Lock acquisition timeout, `None` waits forever
    pub fn lock_timeout(&self) -> Option<Duration> {
        match self.lock.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
