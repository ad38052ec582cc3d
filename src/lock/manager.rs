//! Project-scoped lock naming over a pluggable locker

use crate::error::StevedoreResult;
use crate::lock::{AcquireOptions, Locker, LockerHandle};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Handle of a lock returned by [`LockManager`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub locker_handle: LockerHandle,
    pub project: String,
}

impl LockHandle {
    pub fn lock_name(&self) -> &str {
        &self.locker_handle.lock_name
    }
}

/// Options for [`LockManager::lock_stages_and_images`]
#[derive(Debug, Clone, Default)]
pub struct LockStagesAndImagesOptions {
    /// Caller only gets or creates images, so it may share the lock with
    /// other such callers
    pub get_or_create_images_only: bool,
}

/// Deterministic lock names for the resources of a project
pub struct LockManager {
    locker: Arc<dyn Locker>,
    timeout: Option<Duration>,
}

impl LockManager {
    /// Single locker for all projects
    pub fn new(locker: Arc<dyn Locker>) -> Self {
        Self {
            locker,
            timeout: None,
        }
    }

    /// Fail acquisitions that wait longer than `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn acquire(&self, project: &str, name: String, shared: bool) -> StevedoreResult<LockHandle> {
        let options = AcquireOptions {
            shared,
            timeout: self.timeout,
        };
        let locker_handle = self.locker.acquire(&name, options).await?;
        Ok(LockHandle {
            locker_handle,
            project: project.to_string(),
        })
    }

    /// Serializes building of stages with one digest
    pub async fn lock_stage(&self, project: &str, digest: &str) -> StevedoreResult<LockHandle> {
        self.acquire(project, stage_lock_name(project, digest), false)
            .await
    }

    /// Serializes cache updates for one digest
    pub async fn lock_stage_cache(&self, project: &str, digest: &str) -> StevedoreResult<LockHandle> {
        self.acquire(project, stage_cache_lock_name(project, digest), false)
            .await
    }

    pub async fn lock_image(&self, project: &str, image_name: &str) -> StevedoreResult<LockHandle> {
        self.acquire(project, image_lock_name(image_name), false)
            .await
    }

    /// Project-wide lock over stages and images, shared for callers that only
    /// get or create images
    pub async fn lock_stages_and_images(
        &self,
        project: &str,
        options: LockStagesAndImagesOptions,
    ) -> StevedoreResult<LockHandle> {
        self.acquire(
            project,
            stages_and_images_lock_name(project),
            options.get_or_create_images_only,
        )
        .await
    }

    /// Release a lock. A failure is logged and returned but callers unwinding
    /// from another error are free to ignore it.
    pub async fn unlock(&self, handle: LockHandle) -> StevedoreResult<()> {
        let result = self.locker.release(&handle.locker_handle).await;
        if let Err(e) = &result {
            error!("Unable to release lock for {:?}: {}", handle.lock_name(), e);
        }
        result
    }
}

pub(crate) fn stage_lock_name(project: &str, digest: &str) -> String {
    format!("{}.{}", project, digest)
}

pub(crate) fn stage_cache_lock_name(project: &str, digest: &str) -> String {
    format!("{}.{}.cache", project, digest)
}

pub(crate) fn image_lock_name(image_name: &str) -> String {
    format!("{}.image", image_name)
}

pub(crate) fn stages_and_images_lock_name(project: &str) -> String {
    format!("{}.stages_and_images", project)
}
