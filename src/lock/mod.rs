//! Named locks
//!
//! A [`Locker`] provides named exclusive or shared locks. The
//! [`LockManager`] maps the logical resources of a project onto deterministic
//! lock names so that every process contending for a resource agrees on the
//! name.

mod file;
mod manager;
mod memory;

pub use file::HostFileLocker;
pub use manager::{LockHandle, LockManager, LockStagesAndImagesOptions};
pub use memory::InMemoryLocker;

use crate::config::Config;
use crate::error::{StevedoreError, StevedoreResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How a lock is acquired
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// Take the lock in shared mode, compatible with other shared holders
    pub shared: bool,
    /// Give up after this long, wait forever when unset
    pub timeout: Option<Duration>,
}

/// Backend-level handle of an acquired lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockerHandle {
    pub id: Uuid,
    pub lock_name: String,
}

impl LockerHandle {
    pub(crate) fn new(lock_name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            lock_name: lock_name.to_string(),
        }
    }
}

/// Pluggable named-lock backend
#[async_trait]
pub trait Locker: Send + Sync {
    /// Block until the named lock is acquired
    async fn acquire(&self, lock_name: &str, options: AcquireOptions)
        -> StevedoreResult<LockerHandle>;

    /// Release a previously acquired lock
    async fn release(&self, handle: &LockerHandle) -> StevedoreResult<()>;

    /// Human-readable backend name
    fn name(&self) -> &'static str;
}

/// Build the locker selected by `config.lock.backend`
pub fn create_locker(config: &Config) -> StevedoreResult<Arc<dyn Locker>> {
    match config.lock.backend.as_str() {
        "file" => Ok(Arc::new(HostFileLocker::new(config.lock_dir()))),
        "memory" => Ok(Arc::new(InMemoryLocker::new())),
        other => Err(StevedoreError::UnsupportedBackend {
            kind: "lock".to_string(),
            name: other.to_string(),
        }),
    }
}
