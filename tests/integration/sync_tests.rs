//! Synchronization server and HTTP client end to end

use crate::common::BrokenCache;
use std::sync::Arc;
use stevedore::cache::{
    HttpStagesStorageCache, InMemoryConfigMapStore, KubernetesStagesStorageCache,
    StagesStorageCache,
};
use stevedore::error::StevedoreError;
use stevedore::stage::StageId;
use stevedore::sync::serve_listener;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Server {
    client: HttpStagesStorageCache,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<stevedore::StevedoreResult<()>>,
}

async fn start(cache: Arc<dyn StagesStorageCache>) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();

    let handle = tokio::spawn(serve_listener(listener, cache, async move {
        let _ = stopped.await;
    }));

    Server {
        client: HttpStagesStorageCache::new(format!("http://{}", addr)),
        stop,
        handle,
    }
}

impl Server {
    async fn shutdown(self) {
        let _ = self.stop.send(());
        self.handle.await.unwrap().unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_round_trips_through_server() {
    let backend = Arc::new(KubernetesStagesStorageCache::new(
        "ns",
        Arc::new(InMemoryConfigMapStore::new()),
    ));
    let server = start(backend.clone()).await;
    let client = &server.client;

    assert_eq!(client.get_stages_by_digest("demo", "abc").await.unwrap(), None);
    assert_eq!(client.get_all_stages("demo").await.unwrap(), None);

    client
        .store_stages_by_digest("demo", "abc", &[StageId::new("abc", 1)])
        .await
        .unwrap();
    client.store_stages_by_digest("demo", "def", &[]).await.unwrap();

    assert_eq!(
        client.get_stages_by_digest("demo", "abc").await.unwrap(),
        Some(vec![StageId::new("abc", 1)])
    );
    assert_eq!(
        client.get_stages_by_digest("demo", "def").await.unwrap(),
        Some(vec![])
    );
    assert_eq!(
        backend.get_stages_by_digest("demo", "abc").await.unwrap(),
        Some(vec![StageId::new("abc", 1)])
    );

    client.delete_stages_by_digest("demo", "abc").await.unwrap();
    assert_eq!(client.get_stages_by_digest("demo", "abc").await.unwrap(), None);

    client.delete_all_stages("demo").await.unwrap();
    assert_eq!(client.get_all_stages("demo").await.unwrap(), None);

    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_errors_reach_the_client() {
    let server = start(Arc::new(BrokenCache)).await;

    let err = server
        .client
        .get_stages_by_digest("demo", "abc")
        .await
        .unwrap_err();
    assert!(matches!(err, StevedoreError::Remote(ref m) if m.contains("down")));

    let err = server
        .client
        .store_stages_by_digest("demo", "abc", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, StevedoreError::Remote(_)));

    server.shutdown().await;
}
