//! Cache backends under concurrent writers

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stevedore::cache::{
    ConfigMapObject, ConfigMapStore, FileStagesStorageCache, InMemoryConfigMapStore,
    KubernetesStagesStorageCache, StagesStorageCache,
};
use stevedore::error::StevedoreResult;
use stevedore::lock::InMemoryLocker;
use stevedore::stage::StageId;
use tempfile::TempDir;

/// Store that lets another writer slip in before the first update
struct RacingStore {
    inner: Arc<InMemoryConfigMapStore>,
    raced: AtomicBool,
}

#[async_trait]
impl ConfigMapStore for RacingStore {
    async fn get_or_create(&self, namespace: &str, name: &str) -> StevedoreResult<ConfigMapObject> {
        self.inner.get_or_create(namespace, name).await
    }

    async fn update(&self, object: &ConfigMapObject) -> StevedoreResult<ConfigMapObject> {
        if !self.raced.swap(true, Ordering::SeqCst) {
            let rival = KubernetesStagesStorageCache::new(&object.namespace, self.inner.clone());
            rival
                .store_stages_by_digest("demo", "rival", &[StageId::new("rival", 1)])
                .await?;
        }
        self.inner.update(object).await
    }
}

#[tokio::test]
async fn kubernetes_update_conflict_is_retried() {
    let inner = Arc::new(InMemoryConfigMapStore::new());
    let cache = KubernetesStagesStorageCache::new(
        "ns",
        Arc::new(RacingStore {
            inner: inner.clone(),
            raced: AtomicBool::new(false),
        }),
    );

    cache
        .store_stages_by_digest("demo", "abc", &[StageId::new("abc", 2)])
        .await
        .unwrap();

    assert_eq!(
        cache.get_stages_by_digest("demo", "abc").await.unwrap(),
        Some(vec![StageId::new("abc", 2)])
    );
    assert_eq!(
        cache.get_stages_by_digest("demo", "rival").await.unwrap(),
        Some(vec![StageId::new("rival", 1)])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn kubernetes_concurrent_writers_keep_every_digest() {
    let store = Arc::new(InMemoryConfigMapStore::new());
    let cache = Arc::new(KubernetesStagesStorageCache::new("ns", store));

    let mut handles = Vec::new();
    for i in 0..16 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            let digest = format!("d{}", i);
            cache
                .store_stages_by_digest("demo", &digest, &[StageId::new(digest.clone(), i)])
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let all = cache.get_all_stages("demo").await.unwrap().unwrap();
    assert_eq!(all.len(), 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_cache_concurrent_writers_keep_every_digest() {
    let temp = TempDir::new().unwrap();
    let cache = Arc::new(FileStagesStorageCache::new(
        temp.path(),
        Arc::new(InMemoryLocker::new()),
    ));

    let mut handles = Vec::new();
    for i in 0..8 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            let digest = format!("d{}", i);
            cache
                .store_stages_by_digest("demo", &digest, &[StageId::new(digest.clone(), i)])
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut all = cache.get_all_stages("demo").await.unwrap().unwrap();
    all.sort();
    assert_eq!(all.len(), 8);
    assert_eq!(all[0], StageId::new("d0", 0));
}
