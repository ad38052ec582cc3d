//! Stages storage manager
//!
//! Combines a stages storage with its cache. Reads go to the cache first and
//! fall back to the storage; writes update the storage and then bring the
//! cache entry of the affected digest up to date, each under its lock.

use crate::cache::StagesStorageCache;
use crate::error::StevedoreResult;
use crate::lock::{LockHandle, LockManager};
use crate::parallel::{do_tasks, DoTasksOptions, OutputSink};
use crate::stage::{StageDescription, StageId};
use crate::storage::{ContainerImage, DeleteImageOptions, StagesStorage};
use futures_util::future::try_join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct StagesStorageManager {
    project: String,
    storage: Arc<dyn StagesStorage>,
    cache: Arc<dyn StagesStorageCache>,
    lock_manager: Arc<LockManager>,
    parallel: DoTasksOptions,
}

/// Release `handle` after the guarded work. A failed release is logged by
/// `unlock` and never replaces the outcome of the work.
async fn release<T>(
    lock_manager: &LockManager,
    handle: LockHandle,
    result: StevedoreResult<T>,
) -> StevedoreResult<T> {
    let _ = lock_manager.unlock(handle).await;
    result
}

impl StagesStorageManager {
    pub fn new(
        project: impl Into<String>,
        storage: Arc<dyn StagesStorage>,
        cache: Arc<dyn StagesStorageCache>,
        lock_manager: Arc<LockManager>,
    ) -> Self {
        Self {
            project: project.into(),
            storage,
            cache,
            lock_manager,
            parallel: DoTasksOptions::default(),
        }
    }

    pub fn with_parallel(mut self, options: DoTasksOptions) -> Self {
        self.parallel = options;
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn storage(&self) -> &Arc<dyn StagesStorage> {
        &self.storage
    }

    pub fn cache(&self) -> &Arc<dyn StagesStorageCache> {
        &self.cache
    }

    /// Stage ids of `digest`, from the cache when possible
    pub async fn get_stages_by_digest(&self, digest: &str) -> StevedoreResult<Vec<StageId>> {
        match self.cache.get_stages_by_digest(&self.project, digest).await {
            Ok(Some(stages)) => {
                debug!(
                    "Got {} stages of {} from cache {}",
                    stages.len(),
                    digest,
                    self.cache
                );
                return Ok(stages);
            }
            Ok(None) => {}
            Err(e) => warn!("Unable to read stages of {} from cache: {}", digest, e),
        }

        let handle = self
            .lock_manager
            .lock_stage_cache(&self.project, digest)
            .await?;
        let result = self.refresh_cache_entry(digest).await;
        release(&self.lock_manager, handle, result).await
    }

    /// Stage ids of every digest, looked up in parallel
    pub async fn get_stages_by_digests(
        &self,
        digests: &[String],
        sink: OutputSink,
    ) -> StevedoreResult<HashMap<String, Vec<StageId>>> {
        let digests: Arc<Vec<String>> = Arc::new(digests.to_vec());
        let found = Arc::new(Mutex::new(HashMap::with_capacity(digests.len())));

        let manager = self.clone();
        let task_digests = digests.clone();
        let task_found = found.clone();
        do_tasks(digests.len(), self.parallel.clone(), sink, move |output, task_id| {
            let manager = manager.clone();
            let digests = task_digests.clone();
            let found = task_found.clone();
            async move {
                let digest = &digests[task_id];
                let stages = manager.get_stages_by_digest(digest).await?;
                output.line(format!("{}: {} stages", digest, stages.len()));
                found
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .insert(digest.clone(), stages);
                Ok(())
            }
        })
        .await?;

        let mut found = found.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(std::mem::take(&mut *found))
    }

    /// Descriptions of every stage of `digest` that still exists in storage
    pub async fn get_stage_descriptions_by_digest(
        &self,
        digest: &str,
    ) -> StevedoreResult<Vec<StageDescription>> {
        let stages = self.get_stages_by_digest(digest).await?;
        let descriptions = try_join_all(stages.iter().map(|id| {
            self.storage
                .get_stage_description(&self.project, &id.digest, id.unique_id)
        }))
        .await?;
        Ok(descriptions.into_iter().flatten().collect())
    }

    /// Store a freshly built stage image and return its id
    pub async fn store_stage(
        &self,
        digest: &str,
        image: &ContainerImage,
    ) -> StevedoreResult<StageId> {
        let handle = self.lock_manager.lock_stage(&self.project, digest).await?;
        let result = self.store_stage_locked(digest, image).await;
        release(&self.lock_manager, handle, result).await
    }

    async fn store_stage_locked(
        &self,
        digest: &str,
        image: &ContainerImage,
    ) -> StevedoreResult<StageId> {
        let stage_id = StageId::new(digest, StageId::new_unique_id());
        let name =
            self.storage
                .construct_stage_image_name(&self.project, digest, stage_id.unique_id);

        let target = ContainerImage {
            name,
            built_id: image.built_id.clone(),
        };
        self.storage.store_image(&target).await?;
        debug!("Stored stage {} as {}", stage_id, target.name);

        let handle = self
            .lock_manager
            .lock_stage_cache(&self.project, digest)
            .await?;
        let result = self.refresh_cache_entry(digest).await;
        release(&self.lock_manager, handle, result).await?;

        Ok(stage_id)
    }

    /// Delete a stage from storage and drop the cache entry of its digest
    pub async fn delete_stage(
        &self,
        description: &StageDescription,
        options: &DeleteImageOptions,
    ) -> StevedoreResult<()> {
        self.storage.delete_stage(description, options).await?;

        let digest = &description.stage_id.digest;
        if let Err(e) = self
            .cache
            .delete_stages_by_digest(&self.project, digest)
            .await
        {
            error!("Unable to invalidate cache entry of {}: {}", digest, e);
            return Err(e);
        }
        Ok(())
    }

    /// Enumerate storage and store the result in the cache. Must be called
    /// with the stage-cache lock held.
    async fn refresh_cache_entry(&self, digest: &str) -> StevedoreResult<Vec<StageId>> {
        let stages = self
            .storage
            .get_stages_ids_by_digest(&self.project, digest)
            .await?;

        if let Err(e) = self
            .cache
            .store_stages_by_digest(&self.project, digest, &stages)
            .await
        {
            error!(
                "Unable to store stages of {} in cache {}: {}",
                digest, self.cache, e
            );
        }
        Ok(stages)
    }
}
