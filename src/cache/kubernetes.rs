//! Stages storage cache in a cluster-hosted shared object
//!
//! Each project has one config object in a namespace. The key
//! `stagesStorageCache` holds `{"stagesByDependenciesDigest": {...}}`.
//! Writers race through optimistic concurrency: every mutation reads the
//! object, changes it and writes it back with the resource version it read,
//! restarting from the read when another writer got there first.

use crate::cache::StagesStorageCache;
use crate::error::{StevedoreError, StevedoreResult};
use crate::stage::StageId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error};

/// Key holding the cache data
pub const STAGES_STORAGE_CACHE_KEY: &str = "stagesStorageCache";

/// Keys written by earlier cache layouts, dropped before the object is served
/// or changed
pub const LEGACY_CACHE_KEYS: &[&str] = &["stagesStorageCache.v1", "signaturesCache"];

/// A config object as seen by one reader
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigMapObject {
    pub namespace: String,
    pub name: String,
    /// Version the object had when it was read
    pub resource_version: u64,
    pub data: BTreeMap<String, String>,
}

/// Namespaced store of config objects with optimistic concurrency
#[async_trait]
pub trait ConfigMapStore: Send + Sync {
    /// Read the object, creating an empty one (and the namespace) if needed
    async fn get_or_create(&self, namespace: &str, name: &str) -> StevedoreResult<ConfigMapObject>;

    /// Write the object back. Fails with [`StevedoreError::Conflict`] when
    /// the stored version differs from `object.resource_version`.
    async fn update(&self, object: &ConfigMapObject) -> StevedoreResult<ConfigMapObject>;
}

/// In-process config object store
#[derive(Default)]
pub struct InMemoryConfigMapStore {
    objects: Mutex<HashMap<(String, String), ConfigMapObject>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryConfigMapStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stored copy of an object
    pub fn get(&self, namespace: &str, name: &str) -> Option<ConfigMapObject> {
        lock(&self.objects)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Overwrite the stored object regardless of its version
    pub fn put(&self, mut object: ConfigMapObject) {
        let mut objects = lock(&self.objects);
        let key = (object.namespace.clone(), object.name.clone());
        object.resource_version = objects
            .get(&key)
            .map(|o| o.resource_version + 1)
            .unwrap_or(1);
        objects.insert(key, object);
    }
}

#[async_trait]
impl ConfigMapStore for InMemoryConfigMapStore {
    async fn get_or_create(&self, namespace: &str, name: &str) -> StevedoreResult<ConfigMapObject> {
        let mut objects = lock(&self.objects);
        let object = objects
            .entry((namespace.to_string(), name.to_string()))
            .or_insert_with(|| {
                debug!("Creating cm/{} in ns/{}", name, namespace);
                ConfigMapObject {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    resource_version: 1,
                    data: BTreeMap::new(),
                }
            });
        Ok(object.clone())
    }

    async fn update(&self, object: &ConfigMapObject) -> StevedoreResult<ConfigMapObject> {
        let mut objects = lock(&self.objects);
        let key = (object.namespace.clone(), object.name.clone());
        let stored = objects.get(&key).map(|o| o.resource_version);
        if stored != Some(object.resource_version) {
            return Err(StevedoreError::Conflict(format!("cm/{}", object.name)));
        }

        let mut updated = object.clone();
        updated.resource_version += 1;
        objects.insert(key, updated.clone());
        Ok(updated)
    }
}

/// Value stored under [`STAGES_STORAGE_CACHE_KEY`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubernetesStagesStorageCacheData {
    #[serde(rename = "stagesByDependenciesDigest", default)]
    pub stages_by_digest: BTreeMap<String, Vec<StageId>>,
}

type ConfigMapNameFn = dyn Fn(&str) -> String + Send + Sync;

pub struct KubernetesStagesStorageCache {
    namespace: String,
    store: Arc<dyn ConfigMapStore>,
    config_map_name: Box<ConfigMapNameFn>,
}

impl KubernetesStagesStorageCache {
    pub fn new(namespace: impl Into<String>, store: Arc<dyn ConfigMapStore>) -> Self {
        Self {
            namespace: namespace.into(),
            store,
            config_map_name: Box::new(|project| format!("stevedore-{}", project)),
        }
    }

    /// Override the object name of a project (default `stevedore-<project>`)
    pub fn with_config_map_name(
        mut self,
        name: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.config_map_name = Box::new(name);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get_object(&self, project: &str) -> StevedoreResult<ConfigMapObject> {
        self.store
            .get_or_create(&self.namespace, &(self.config_map_name)(project))
            .await
    }

    /// Read the object for serving a lookup, purging legacy keys first
    async fn read_object(&self, project: &str) -> StevedoreResult<ConfigMapObject> {
        let obj = self.get_object(project).await?;
        if !LEGACY_CACHE_KEYS.iter().any(|key| obj.data.contains_key(*key)) {
            return Ok(obj);
        }

        debug!("Dropping legacy cache keys of cm/{}", obj.name);
        self.change_cache_data(project, |_, _| Ok(())).await?;
        self.get_object(project).await
    }

    fn extract_cache_data(obj: &ConfigMapObject) -> Option<KubernetesStagesStorageCacheData> {
        let raw = obj.data.get(STAGES_STORAGE_CACHE_KEY)?;
        match serde_json::from_str(raw) {
            Ok(data) => Some(data),
            Err(e) => {
                error!(
                    "Error unmarshalling stages storage cache json in cm/{} by key {:?}: {}: will ignore cache",
                    obj.name, STAGES_STORAGE_CACHE_KEY, e
                );
                None
            }
        }
    }

    fn set_cache_data(
        obj: &mut ConfigMapObject,
        data: &KubernetesStagesStorageCacheData,
    ) -> StevedoreResult<()> {
        obj.data
            .insert(STAGES_STORAGE_CACHE_KEY.to_string(), serde_json::to_string(data)?);
        Ok(())
    }

    /// Read-modify-write cycle, restarted from the read on every conflict
    async fn change_cache_data<F>(&self, project: &str, change: F) -> StevedoreResult<()>
    where
        F: Fn(&mut ConfigMapObject, Option<KubernetesStagesStorageCacheData>) -> StevedoreResult<()>
            + Send
            + Sync,
    {
        loop {
            let mut obj = self.get_object(project).await?;
            let data = Self::extract_cache_data(&obj);
            change(&mut obj, data)?;

            for key in LEGACY_CACHE_KEYS {
                obj.data.remove(*key);
            }

            match self.store.update(&obj).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => {
                    debug!("Conflict updating cm/{}, retrying", obj.name);
                    tokio::task::yield_now().await;
                }
                Err(e) => {
                    return Err(StevedoreError::Internal(format!(
                        "update cm/{} error: {}",
                        obj.name, e
                    )))
                }
            }
        }
    }
}

impl fmt::Display for KubernetesStagesStorageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kubernetes ns/{}", self.namespace)
    }
}

#[async_trait]
impl StagesStorageCache for KubernetesStagesStorageCache {
    async fn get_all_stages(&self, project: &str) -> StevedoreResult<Option<Vec<StageId>>> {
        let obj = self.read_object(project).await?;
        Ok(Self::extract_cache_data(&obj)
            .map(|data| data.stages_by_digest.into_values().flatten().collect()))
    }

    async fn delete_all_stages(&self, project: &str) -> StevedoreResult<()> {
        self.change_cache_data(project, |obj, _| {
            obj.data.remove(STAGES_STORAGE_CACHE_KEY);
            Ok(())
        })
        .await
    }

    async fn get_stages_by_digest(
        &self,
        project: &str,
        digest: &str,
    ) -> StevedoreResult<Option<Vec<StageId>>> {
        let obj = self.read_object(project).await?;
        Ok(Self::extract_cache_data(&obj)
            .and_then(|mut data| data.stages_by_digest.remove(digest)))
    }

    async fn store_stages_by_digest(
        &self,
        project: &str,
        digest: &str,
        stages: &[StageId],
    ) -> StevedoreResult<()> {
        self.change_cache_data(project, |obj, data| {
            let mut data = data.unwrap_or_default();
            data.stages_by_digest
                .insert(digest.to_string(), stages.to_vec());
            Self::set_cache_data(obj, &data)
        })
        .await
    }

    async fn delete_stages_by_digest(&self, project: &str, digest: &str) -> StevedoreResult<()> {
        self.change_cache_data(project, |obj, data| match data {
            Some(mut data) => {
                data.stages_by_digest.remove(digest);
                Self::set_cache_data(obj, &data)
            }
            None => Ok(()),
        })
        .await
    }
}
