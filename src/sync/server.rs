//! HTTP handlers serving a stages storage cache

use crate::cache::StagesStorageCache;
use crate::error::{StevedoreError, StevedoreResult};
use crate::sync::{
    DigestRequest, ErrResponse, ProjectRequest, StagesResponse, StoreStagesRequest,
    DELETE_ALL_STAGES_PATH, DELETE_STAGES_BY_DIGEST_PATH, GET_ALL_STAGES_PATH,
    GET_STAGES_BY_DIGEST_PATH, STORE_STAGES_BY_DIGEST_PATH,
};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

type SharedCache = Arc<dyn StagesStorageCache>;

/// Router exposing every cache operation of `cache`
pub fn router(cache: SharedCache) -> Router {
    Router::new()
        .route(GET_ALL_STAGES_PATH, post(get_all_stages))
        .route(DELETE_ALL_STAGES_PATH, post(delete_all_stages))
        .route(GET_STAGES_BY_DIGEST_PATH, post(get_stages_by_digest))
        .route(STORE_STAGES_BY_DIGEST_PATH, post(store_stages_by_digest))
        .route(DELETE_STAGES_BY_DIGEST_PATH, post(delete_stages_by_digest))
        .with_state(cache)
}

/// Serve `cache` on `addr` until interrupted
pub async fn serve(addr: SocketAddr, cache: SharedCache) -> StevedoreResult<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| StevedoreError::io(format!("binding {}", addr), e))?;
    serve_listener(listener, cache, shutdown_signal()).await
}

/// Serve `cache` on an already bound listener until `shutdown` resolves
pub async fn serve_listener(
    listener: TcpListener,
    cache: SharedCache,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> StevedoreResult<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| StevedoreError::io("reading listener address", e))?;
    info!("Serving stages storage cache {} on http://{}", cache, addr);

    axum::serve(listener, router(cache))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| StevedoreError::io("serving synchronization requests", e))
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutting down synchronization server");
    }
}

async fn get_all_stages(
    State(cache): State<SharedCache>,
    Json(request): Json<ProjectRequest>,
) -> Json<StagesResponse> {
    debug!("GetAllStages request {:?}", request);
    let response = StagesResponse::from_result(cache.get_all_stages(&request.project_name).await);
    debug!("GetAllStages response {:?}", response);
    Json(response)
}

async fn delete_all_stages(
    State(cache): State<SharedCache>,
    Json(request): Json<ProjectRequest>,
) -> Json<ErrResponse> {
    debug!("DeleteAllStages request {:?}", request);
    Json(ErrResponse::from_result(
        cache.delete_all_stages(&request.project_name).await,
    ))
}

async fn get_stages_by_digest(
    State(cache): State<SharedCache>,
    Json(request): Json<DigestRequest>,
) -> Json<StagesResponse> {
    debug!("GetStagesByDigest request {:?}", request);
    let response = StagesResponse::from_result(
        cache
            .get_stages_by_digest(&request.project_name, &request.dependencies_digest)
            .await,
    );
    debug!("GetStagesByDigest response {:?}", response);
    Json(response)
}

async fn store_stages_by_digest(
    State(cache): State<SharedCache>,
    Json(request): Json<StoreStagesRequest>,
) -> Json<ErrResponse> {
    debug!("StoreStagesByDigest request {:?}", request);
    Json(ErrResponse::from_result(
        cache
            .store_stages_by_digest(
                &request.project_name,
                &request.dependencies_digest,
                &request.stages,
            )
            .await,
    ))
}

async fn delete_stages_by_digest(
    State(cache): State<SharedCache>,
    Json(request): Json<DigestRequest>,
) -> Json<ErrResponse> {
    debug!("DeleteStagesByDigest request {:?}", request);
    Json(ErrResponse::from_result(
        cache
            .delete_stages_by_digest(&request.project_name, &request.dependencies_digest)
            .await,
    ))
}
