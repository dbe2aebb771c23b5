// HTTP Server Module
// Axum routes for streaming, download status/trigger and cache administration.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use parking_lot::Mutex;
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::config::CacheConfig;
use crate::database::Database;
use crate::downloader::{DownloadOrchestrator, MediaStatus};
use crate::error::CacheError;
use crate::extractor::ExtractionClient;
use crate::media_id::MediaId;
use crate::quota::DiskQuota;
use crate::streaming::{plain, StreamingResponder};
use crate::url_cache::UrlCache;

#[derive(Clone)]
pub struct AppState {
    pub downloads: DownloadOrchestrator,
    pub quota: DiskQuota,
    pub urls: UrlCache,
    pub responder: StreamingResponder,
}

impl AppState {
    pub fn new(
        db: Arc<Mutex<Database>>,
        extractor: Arc<dyn ExtractionClient>,
        config: Arc<CacheConfig>,
        http: Client,
    ) -> Self {
        let downloads = DownloadOrchestrator::new(db.clone(), extractor.clone(), config.clone());
        let quota = DiskQuota::new(db.clone(), config.clone());
        let urls = UrlCache::new(db);
        let responder = StreamingResponder::new(
            downloads.clone(),
            quota.clone(),
            urls.clone(),
            extractor,
            http,
            config,
        );
        Self {
            downloads,
            quota,
            urls,
            responder,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/stream/{id}", get(stream_handler))
        .route("/status/{id}", get(status_handler))
        .route("/download/{id}", post(download_handler))
        .route("/cache/usage", get(usage_handler))
        .route("/cache/evict", post(evict_handler))
        .route("/cache/{id}", delete(remove_handler))
        .with_state(state)
}

pub struct ApiServer {
    addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl ApiServer {
    /// Bind `addr` and serve in the background, returning a handle.
    pub async fn start(addr: SocketAddr, state: AppState) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let app = router(state);

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                log::error!("http server stopped: {}", e);
            }
        });

        log::info!("listening on http://{}", addr);
        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn error_response(err: CacheError) -> Response {
    let status = match &err {
        CacheError::Validation(_) => StatusCode::BAD_REQUEST,
        CacheError::InProgress(_) => StatusCode::CONFLICT,
        CacheError::QuotaExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
        CacheError::Extraction(_) => StatusCode::BAD_GATEWAY,
        CacheError::Database(_) | CacheError::Io(_) => {
            log::error!("request failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    plain(status, &err.public_message())
}

/// GET /stream/{id}
async fn stream_handler(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let id = match MediaId::parse(&raw_id) {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    state.responder.respond(&id, range).await
}

/// GET /status/{id}
async fn status_handler(State(state): State<AppState>, Path(raw_id): Path<String>) -> Response {
    let id = match MediaId::parse(&raw_id) {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };
    match state.downloads.status(&id).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /download/{id}
async fn download_handler(State(state): State<AppState>, Path(raw_id): Path<String>) -> Response {
    let id = match MediaId::parse(&raw_id) {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };

    let current = match state.downloads.status(&id).await {
        Ok(report) => report,
        Err(e) => return error_response(e),
    };
    match current.status {
        MediaStatus::Ready | MediaStatus::Downloading => {
            return (StatusCode::ACCEPTED, Json(current)).into_response();
        }
        MediaStatus::None | MediaStatus::Pending | MediaStatus::Error => {}
    }

    if let Err(e) = state.quota.check_admission() {
        log::warn!("download of {} refused: {}", id, e);
        return error_response(e);
    }

    match state.downloads.trigger(&id).await {
        Ok(report) => (StatusCode::ACCEPTED, Json(report)).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /cache/usage
async fn usage_handler(State(state): State<AppState>) -> Response {
    match state.quota.usage() {
        Ok(usage) => Json(usage).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /cache/evict
async fn evict_handler(State(state): State<AppState>) -> Response {
    let quota = state.quota.clone();
    match tokio::task::spawn_blocking(move || quota.evict_stale()).await {
        Ok(Ok(report)) => Json(report).into_response(),
        Ok(Err(e)) => error_response(e),
        Err(e) => {
            log::error!("eviction task panicked: {}", e);
            plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// DELETE /cache/{id}
async fn remove_handler(State(state): State<AppState>, Path(raw_id): Path<String>) -> Response {
    let id = match MediaId::parse(&raw_id) {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };
    match state.quota.remove(&id) {
        Ok(true) => {
            log::info!("removed cached audio for {}", id);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => plain(StatusCode::NOT_FOUND, "not cached"),
        Err(e) => error_response(e),
    }
}
