//! Stages storage cache in a local directory
//!
//! Layout: `<dir>/<project>/<digest>` holding `{"stages":[...]}\n`.
//! Mutations are serialized per cache directory through a host lock named
//! after the directory.

use crate::cache::{StagesStorageCache, StagesStorageCacheRecord};
use crate::error::{StevedoreError, StevedoreResult};
use crate::lock::{AcquireOptions, Locker, LockerHandle};
use crate::stage::StageId;
use async_trait::async_trait;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{error, info};

pub struct FileStagesStorageCache {
    dir: PathBuf,
    legacy_dir: Option<PathBuf>,
    locker: Arc<dyn Locker>,
}

impl FileStagesStorageCache {
    pub fn new(dir: impl Into<PathBuf>, locker: Arc<dyn Locker>) -> Self {
        Self {
            dir: dir.into(),
            legacy_dir: None,
            locker,
        }
    }

    /// Purge projects that still have entries in the previous cache layout
    pub fn with_legacy_dir(mut self, legacy_dir: impl Into<PathBuf>) -> Self {
        self.legacy_dir = Some(legacy_dir.into());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn project_dir(&self, project: &str) -> PathBuf {
        self.dir.join(project)
    }

    async fn lock_dir(&self, dir: &Path) -> StevedoreResult<LockerHandle> {
        self.locker
            .acquire(&dir.to_string_lossy(), AcquireOptions::default())
            .await
    }

    async fn unlock(&self, handle: LockerHandle) {
        if let Err(e) = self.locker.release(&handle).await {
            error!("Unable to release cache lock {}: {}", handle.lock_name, e);
        }
    }

    /// Drop both the legacy and the current entries of a project when the
    /// legacy layout still has it
    async fn invalidate_if_legacy_cache_exists(&self, project: &str) -> StevedoreResult<()> {
        let Some(legacy_dir) = &self.legacy_dir else {
            return Ok(());
        };

        let handle = self.lock_dir(&self.dir).await?;
        let result = match self.lock_dir(legacy_dir).await {
            Ok(legacy_handle) => {
                let result = self.purge_legacy_project(legacy_dir, project).await;
                self.unlock(legacy_handle).await;
                result
            }
            Err(e) => Err(e),
        };
        self.unlock(handle).await;
        result
    }

    async fn purge_legacy_project(&self, legacy_dir: &Path, project: &str) -> StevedoreResult<()> {
        let legacy_project_dir = legacy_dir.join(project);
        match fs::metadata(&legacy_project_dir).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StevedoreError::io(
                    format!("accessing {}", legacy_project_dir.display()),
                    e,
                ))
            }
        }

        let current_project_dir = self.project_dir(project);
        info!(
            "Removing current stages storage project cache dir: {}",
            current_project_dir.display()
        );
        remove_dir_if_exists(&current_project_dir).await?;

        info!(
            "Removing old stages storage project cache dir: {}",
            legacy_project_dir.display()
        );
        remove_dir_if_exists(&legacy_project_dir).await
    }

    async fn read_record(&self, project: &str, digest: &str) -> Option<Vec<StageId>> {
        let path = self.project_dir(project).join(digest);

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                error!("Error reading file {}: {}: will ignore cache", path.display(), e);
                return None;
            }
        };

        match serde_json::from_slice::<StagesStorageCacheRecord>(&data) {
            Ok(record) => Some(record.stages),
            Err(e) => {
                error!(
                    "Error unmarshalling json from {}: {}: will ignore cache",
                    path.display(),
                    e
                );
                None
            }
        }
    }

    async fn write_record(&self, project: &str, digest: &str, stages: &[StageId]) -> StevedoreResult<()> {
        let project_dir = self.project_dir(project);
        fs::create_dir_all(&project_dir)
            .await
            .map_err(|e| StevedoreError::io(format!("creating dir {}", project_dir.display()), e))?;

        let record = StagesStorageCacheRecord {
            stages: stages.to_vec(),
        };
        let mut data = serde_json::to_vec(&record)?;
        data.push(b'\n');

        let path = project_dir.join(digest);
        fs::write(&path, data)
            .await
            .map_err(|e| StevedoreError::io(format!("writing file {}", path.display()), e))
    }

    async fn remove_record(&self, project: &str, digest: &str) -> StevedoreResult<()> {
        let path = self.project_dir(project).join(digest);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StevedoreError::io(format!("removing {}", path.display()), e)),
        }
    }
}

async fn remove_dir_if_exists(dir: &Path) -> StevedoreResult<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StevedoreError::io(format!("removing {}", dir.display()), e)),
    }
}

impl fmt::Display for FileStagesStorageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir.display())
    }
}

#[async_trait]
impl StagesStorageCache for FileStagesStorageCache {
    async fn get_all_stages(&self, project: &str) -> StevedoreResult<Option<Vec<StageId>>> {
        self.invalidate_if_legacy_cache_exists(project).await?;

        let project_dir = self.project_dir(project);
        let mut entries = match fs::read_dir(&project_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StevedoreError::io(
                    format!("reading directory {}", project_dir.display()),
                    e,
                ))
            }
        };

        let mut stages = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|e| {
                StevedoreError::io(format!("reading directory {}", project_dir.display()), e)
            })?;
            let Some(entry) = entry else { break };

            let digest = entry.file_name().to_string_lossy().into_owned();
            if let Some(ids) = self.read_record(project, &digest).await {
                stages.extend(ids);
            }
        }

        Ok(Some(stages))
    }

    async fn delete_all_stages(&self, project: &str) -> StevedoreResult<()> {
        remove_dir_if_exists(&self.project_dir(project)).await
    }

    async fn get_stages_by_digest(
        &self,
        project: &str,
        digest: &str,
    ) -> StevedoreResult<Option<Vec<StageId>>> {
        self.invalidate_if_legacy_cache_exists(project).await?;
        Ok(self.read_record(project, digest).await)
    }

    async fn store_stages_by_digest(
        &self,
        project: &str,
        digest: &str,
        stages: &[StageId],
    ) -> StevedoreResult<()> {
        self.invalidate_if_legacy_cache_exists(project).await?;

        let handle = self.lock_dir(&self.dir).await?;
        let result = self.write_record(project, digest, stages).await;
        self.unlock(handle).await;
        result
    }

    async fn delete_stages_by_digest(&self, project: &str, digest: &str) -> StevedoreResult<()> {
        self.invalidate_if_legacy_cache_exists(project).await?;

        let handle = self.lock_dir(&self.dir).await?;
        let result = self.remove_record(project, digest).await;
        self.unlock(handle).await;
        result
    }
}
