//! Stages storage manager over local storage and a file cache

use crate::common::{BrokenCache, FakeRuntime};
use async_trait::async_trait;
use std::sync::Arc;
use stevedore::cache::{FileStagesStorageCache, StagesStorageCache};
use stevedore::error::{StevedoreError, StevedoreResult};
use stevedore::lock::{AcquireOptions, InMemoryLocker, LockManager, Locker, LockerHandle};
use stevedore::manager::StagesStorageManager;
use stevedore::parallel::{CapturedOutput, DoTasksOptions};
use stevedore::stage::StageId;
use stevedore::storage::{ContainerImage, DeleteImageOptions, LocalStagesStorage};
use tempfile::TempDir;

const PROJECT: &str = "demo";

fn stage_labels(digest: &str) -> Vec<(&str, &str)> {
    vec![
        ("stevedore", PROJECT),
        ("stevedore-cache-version", "1.2"),
        ("stevedore-stage-digest", digest),
    ]
}

fn add_stage(runtime: &FakeRuntime, digest: &str, unique_id: i64) {
    runtime.add_image(
        &format!("stevedore-stages-storage/{}:{}-{}", PROJECT, digest, unique_id),
        &stage_labels(digest),
    );
}

struct Fixture {
    _temp: TempDir,
    runtime: Arc<FakeRuntime>,
    cache: Arc<FileStagesStorageCache>,
    manager: StagesStorageManager,
}

fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    let locker = Arc::new(InMemoryLocker::new());
    let cache = Arc::new(FileStagesStorageCache::new(
        temp.path().join("cache"),
        locker.clone(),
    ));
    let manager = StagesStorageManager::new(
        PROJECT,
        Arc::new(LocalStagesStorage::new(runtime.clone())),
        cache.clone(),
        Arc::new(LockManager::new(locker)),
    )
    .with_parallel(DoTasksOptions {
        max_number_of_workers: 2,
        is_live_output_on: false,
    });

    Fixture {
        _temp: temp,
        runtime,
        cache,
        manager,
    }
}

#[tokio::test]
async fn miss_populates_cache_and_hit_skips_storage() {
    let f = fixture();
    add_stage(&f.runtime, "abc", 100);

    let stages = f.manager.get_stages_by_digest("abc").await.unwrap();
    assert_eq!(stages, vec![StageId::new("abc", 100)]);
    assert_eq!(
        f.cache.get_stages_by_digest(PROJECT, "abc").await.unwrap(),
        Some(vec![StageId::new("abc", 100)])
    );

    // The cache entry is trusted until invalidated
    add_stage(&f.runtime, "abc", 200);
    let stages = f.manager.get_stages_by_digest("abc").await.unwrap();
    assert_eq!(stages, vec![StageId::new("abc", 100)]);
}

#[tokio::test]
async fn empty_result_is_cached() {
    let f = fixture();
    assert!(f.manager.get_stages_by_digest("abc").await.unwrap().is_empty());
    assert_eq!(
        f.cache.get_stages_by_digest(PROJECT, "abc").await.unwrap(),
        Some(vec![])
    );
}

#[tokio::test]
async fn store_stage_refreshes_cache() {
    let f = fixture();
    add_stage(&f.runtime, "abc", 100);
    f.manager.get_stages_by_digest("abc").await.unwrap();

    let built = f.runtime.add_image("tmp:build", &stage_labels("abc"));
    let stage_id = f
        .manager
        .store_stage("abc", &ContainerImage::new("unused").with_built_id(built))
        .await
        .unwrap();
    assert_eq!(stage_id.digest, "abc");

    let cached = f
        .cache
        .get_stages_by_digest(PROJECT, "abc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.len(), 2);
    assert!(cached.contains(&stage_id));

    let descriptions = f.manager.get_stage_descriptions_by_digest("abc").await.unwrap();
    assert_eq!(descriptions.len(), 2);
}

#[tokio::test]
async fn delete_stage_invalidates_cache_entry() {
    let f = fixture();
    add_stage(&f.runtime, "abc", 100);
    add_stage(&f.runtime, "abc", 200);

    let descriptions = f.manager.get_stage_descriptions_by_digest("abc").await.unwrap();
    assert_eq!(descriptions.len(), 2);

    f.manager
        .delete_stage(&descriptions[0], &DeleteImageOptions::default())
        .await
        .unwrap();
    assert_eq!(f.cache.get_stages_by_digest(PROJECT, "abc").await.unwrap(), None);

    let stages = f.manager.get_stages_by_digest("abc").await.unwrap();
    assert_eq!(stages, vec![descriptions[1].stage_id.clone()]);
}

#[tokio::test]
async fn many_digests_in_parallel() {
    let f = fixture();
    add_stage(&f.runtime, "a", 1);
    add_stage(&f.runtime, "b", 2);
    add_stage(&f.runtime, "b", 3);

    let digests = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let captured = CapturedOutput::new();
    let found = f
        .manager
        .get_stages_by_digests(&digests, captured.sink())
        .await
        .unwrap();

    assert_eq!(found["a"].len(), 1);
    assert_eq!(found["b"].len(), 2);
    assert!(found["c"].is_empty());
    assert!(captured.contents().contains("b: 2 stages"));
}

#[tokio::test]
async fn broken_cache_falls_back_to_storage() {
    let runtime = Arc::new(FakeRuntime::new());
    add_stage(&runtime, "abc", 100);
    let manager = StagesStorageManager::new(
        PROJECT,
        Arc::new(LocalStagesStorage::new(runtime)),
        Arc::new(BrokenCache),
        Arc::new(LockManager::new(Arc::new(InMemoryLocker::new()))),
    );

    let stages = manager.get_stages_by_digest("abc").await.unwrap();
    assert_eq!(stages, vec![StageId::new("abc", 100)]);
}

/// Releases the lock but reports the release as failed
struct FlakyReleaseLocker {
    inner: InMemoryLocker,
}

#[async_trait]
impl Locker for FlakyReleaseLocker {
    async fn acquire(
        &self,
        lock_name: &str,
        options: AcquireOptions,
    ) -> StevedoreResult<LockerHandle> {
        self.inner.acquire(lock_name, options).await
    }

    async fn release(&self, handle: &LockerHandle) -> StevedoreResult<()> {
        self.inner.release(handle).await?;
        Err(StevedoreError::Lock {
            name: handle.lock_name.clone(),
            reason: "backend gone".to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

#[tokio::test]
async fn failed_release_does_not_fail_completed_work() {
    let temp = TempDir::new().unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    let locker = Arc::new(FlakyReleaseLocker {
        inner: InMemoryLocker::new(),
    });
    let cache = Arc::new(FileStagesStorageCache::new(
        temp.path().join("cache"),
        Arc::new(InMemoryLocker::new()),
    ));
    let manager = StagesStorageManager::new(
        PROJECT,
        Arc::new(LocalStagesStorage::new(runtime.clone())),
        cache.clone(),
        Arc::new(LockManager::new(locker)),
    );

    add_stage(&runtime, "abc", 100);
    let stages = manager.get_stages_by_digest("abc").await.unwrap();
    assert_eq!(stages, vec![StageId::new("abc", 100)]);

    let built = runtime.add_image("tmp:build", &stage_labels("abc"));
    let stage_id = manager
        .store_stage("abc", &ContainerImage::new("unused").with_built_id(built))
        .await
        .unwrap();

    let cached = cache
        .get_stages_by_digest(PROJECT, "abc")
        .await
        .unwrap()
        .unwrap();
    assert!(cached.contains(&stage_id));
}
