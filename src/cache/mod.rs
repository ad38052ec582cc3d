//! Stages storage cache
//!
//! Best-effort index `project -> digest -> [StageId]` that answers which stage
//! artifacts exist for a digest without enumerating the stages storage.
//! Entries are derived data: they may be stale or missing, and callers must
//! fall back to the storage on a miss.
//!
//! # Lookup results
//!
//! | Result | Meaning |
//! |--------|---------|
//! | `Ok(None)` | Not cached, ask the storage |
//! | `Ok(Some(vec![]))` | Cached, no stages exist |
//! | `Ok(Some(ids))` | Cached stages |
//!
//! Unreadable or undecodable entries are reported as `Ok(None)` with an error
//! log rather than failing the caller.

pub mod file;
pub mod kubernetes;
pub mod remote;

pub use file::FileStagesStorageCache;
pub use kubernetes::{
    ConfigMapObject, ConfigMapStore, InMemoryConfigMapStore, KubernetesStagesStorageCache,
};
pub use remote::HttpStagesStorageCache;

use crate::config::Config;
use crate::error::{StevedoreError, StevedoreResult};
use crate::lock::Locker;
use crate::stage::StageId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Index of stage ids by dependencies digest
#[async_trait]
pub trait StagesStorageCache: Send + Sync + fmt::Display {
    /// Every cached stage of the project, `None` when nothing is cached
    async fn get_all_stages(&self, project: &str) -> StevedoreResult<Option<Vec<StageId>>>;

    async fn delete_all_stages(&self, project: &str) -> StevedoreResult<()>;

    async fn get_stages_by_digest(
        &self,
        project: &str,
        digest: &str,
    ) -> StevedoreResult<Option<Vec<StageId>>>;

    /// Replace the entry for `digest`
    async fn store_stages_by_digest(
        &self,
        project: &str,
        digest: &str,
        stages: &[StageId],
    ) -> StevedoreResult<()>;

    async fn delete_stages_by_digest(&self, project: &str, digest: &str) -> StevedoreResult<()>;
}

/// On-disk record of one digest entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagesStorageCacheRecord {
    pub stages: Vec<StageId>,
}

/// Build the cache backend selected by `config.cache.backend`.
///
/// The file backend serializes its mutations through `host_locker`.
/// The `memory` backend runs the config-object cache over an object store
/// that lives in this process only, so it is shared with other hosts just
/// when this process serves it over `stevedore serve`. No cluster-backed
/// object store is wired in, so `kubernetes` is not a selectable backend.
pub fn create_stages_storage_cache(
    config: &Config,
    host_locker: Arc<dyn Locker>,
) -> StevedoreResult<Arc<dyn StagesStorageCache>> {
    match config.cache.backend.as_str() {
        "file" => Ok(Arc::new(
            FileStagesStorageCache::new(config.cache_dir(), host_locker)
                .with_legacy_dir(config.legacy_cache_dir()),
        )),
        "memory" => {
            let prefix = config.cache.config_map_prefix.clone();
            Ok(Arc::new(
                KubernetesStagesStorageCache::new(
                    config.cache.namespace.clone(),
                    Arc::new(InMemoryConfigMapStore::new()),
                )
                .with_config_map_name(move |project| format!("{}-{}", prefix, project)),
            ))
        }
        "http" => {
            let url = config.cache.url.clone().ok_or_else(|| {
                StevedoreError::User("cache.url is required for the http cache backend".to_string())
            })?;
            Ok(Arc::new(
                HttpStagesStorageCache::new(url)
                    .with_timeout(Duration::from_secs(config.cache.timeout_secs)),
            ))
        }
        other => Err(StevedoreError::UnsupportedBackend {
            kind: "cache".to_string(),
            name: other.to_string(),
        }),
    }
}
