//! Process-local locker

use crate::error::{StevedoreError, StevedoreResult};
use crate::lock::{AcquireOptions, Locker, LockerHandle};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;
use uuid::Uuid;

enum HeldGuard {
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
}

/// Locker for builds running inside one process
#[derive(Default)]
pub struct InMemoryLocker {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    held: Mutex<HashMap<Uuid, HeldGuard>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    fn named(&self, lock_name: &str) -> Arc<RwLock<()>> {
        lock(&self.locks)
            .entry(lock_name.to_string())
            .or_default()
            .clone()
    }

    async fn wait<T>(
        lock_name: &str,
        options: &AcquireOptions,
        fut: impl Future<Output = T>,
    ) -> StevedoreResult<T> {
        match options.timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut)
                .await
                .map_err(|_| StevedoreError::LockTimeout(lock_name.to_string())),
            None => Ok(fut.await),
        }
    }
}

#[async_trait]
impl Locker for InMemoryLocker {
    async fn acquire(
        &self,
        lock_name: &str,
        options: AcquireOptions,
    ) -> StevedoreResult<LockerHandle> {
        let named = self.named(lock_name);
        let guard = if options.shared {
            HeldGuard::Shared(Self::wait(lock_name, &options, named.read_owned()).await?)
        } else {
            HeldGuard::Exclusive(Self::wait(lock_name, &options, named.write_owned()).await?)
        };

        let handle = LockerHandle::new(lock_name);
        lock(&self.held).insert(handle.id, guard);
        debug!("Acquired lock {} (shared: {})", lock_name, options.shared);
        Ok(handle)
    }

    async fn release(&self, handle: &LockerHandle) -> StevedoreResult<()> {
        match lock(&self.held).remove(&handle.id) {
            Some(_guard) => {
                debug!("Released lock {}", handle.lock_name);
                Ok(())
            }
            None => Err(StevedoreError::LockNotHeld(handle.lock_name.clone())),
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
