//! Host-scoped locker backed by advisory file locks
//!
//! Each lock name maps to one file in the lock directory. Locks taken through
//! separate file descriptors exclude each other, also within one process.

use crate::error::{StevedoreError, StevedoreResult};
use crate::lock::{AcquireOptions, Locker, LockerHandle};
use async_trait::async_trait;
use fs4::fs_std::FileExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Locker shared by every process on this host
pub struct HostFileLocker {
    dir: PathBuf,
    held: Mutex<HashMap<Uuid, File>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Attempt a non-blocking flock, `Ok(false)` when another holder has it
fn try_flock(file: &File, shared: bool) -> std::io::Result<bool> {
    let attempt = if shared {
        FileExt::try_lock_shared(file)
    } else {
        FileExt::try_lock_exclusive(file)
    };
    match attempt {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}

impl HostFileLocker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Lock names may be paths, so the file name is a readable prefix plus a
    /// hash of the full name.
    fn lock_file_path(&self, lock_name: &str) -> PathBuf {
        let readable: String = lock_name
            .chars()
            .rev()
            .take(48)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        let hash = Sha256::digest(lock_name.as_bytes());
        self.dir
            .join(format!("{}.{}.lock", readable, hex::encode(&hash[..8])))
    }
}

#[async_trait]
impl Locker for HostFileLocker {
    async fn acquire(
        &self,
        lock_name: &str,
        options: AcquireOptions,
    ) -> StevedoreResult<LockerHandle> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            StevedoreError::io(format!("creating lock directory {}", self.dir.display()), e)
        })?;

        let path = self.lock_file_path(lock_name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| StevedoreError::io(format!("opening lock file {}", path.display()), e))?;

        let deadline = options.timeout.map(|t| Instant::now() + t);
        loop {
            match try_flock(&file, options.shared) {
                Ok(true) => break,
                Ok(false) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(StevedoreError::LockTimeout(lock_name.to_string()));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Err(e) => {
                    return Err(StevedoreError::Lock {
                        name: lock_name.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }

        let handle = LockerHandle::new(lock_name);
        lock(&self.held).insert(handle.id, file);
        debug!("Acquired host lock {} at {}", lock_name, path.display());
        Ok(handle)
    }

    async fn release(&self, handle: &LockerHandle) -> StevedoreResult<()> {
        let file = lock(&self.held)
            .remove(&handle.id)
            .ok_or_else(|| StevedoreError::LockNotHeld(handle.lock_name.clone()))?;

        FileExt::unlock(&file).map_err(|e| StevedoreError::Lock {
            name: handle.lock_name.clone(),
            reason: format!("release failed: {}", e),
        })?;
        debug!("Released host lock {}", handle.lock_name);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
