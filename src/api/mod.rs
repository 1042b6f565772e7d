//! HTTP + SSE gateway
//!
//! Thin translation layer: requests map onto the engine's components and
//! their events marshal into the wire format. Bearer auth applies to every
//! route whenever the `api_key` setting is non-empty.

mod handlers;
mod openai_compat;
mod stream;

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::chat::ChatOrchestrator;
use crate::embedding::RemoteEmbedder;
use crate::error::LifeQueryError;
use crate::ingest::{IngestPipeline, SourceConnector};
use crate::retrieval::RetrievalEngine;
use crate::storage::{settings, Storage};
use crate::tasks::TaskManager;
use crate::vector::VectorStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub vectors: VectorStore,
    pub embedder: Arc<RemoteEmbedder>,
    pub pipeline: Arc<IngestPipeline>,
    pub retrieval: Arc<RetrievalEngine>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub tasks: TaskManager,
    pub connector: Arc<dyn SourceConnector>,
}

/// JSON error body with the taxonomy's HTTP mapping
pub struct ApiError(pub LifeQueryError);

impl From<LifeQueryError> for ApiError {
    fn from(err: LifeQueryError) -> Self {
        Self(err)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        Self(LifeQueryError::Serialization(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Reject requests without the configured bearer key
async fn require_auth(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let api_key = state
        .storage
        .with_connection(|conn| settings::read_raw(conn, "api_key"))
        .unwrap_or_default();

    if api_key.is_empty() {
        return next.run(request).await;
    }

    let authorized = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == api_key)
        .unwrap_or(false);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid or missing API key" })),
        )
            .into_response();
    }

    next.run(request).await
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/settings", get(handlers::get_settings).post(handlers::update_settings))
        .route("/providers", get(handlers::get_providers))
        .route("/models", get(handlers::get_models))
        .route("/telegram/status", get(handlers::telegram_status))
        .route("/telegram/auth/start", post(handlers::telegram_auth_start))
        .route("/telegram/auth/verify", post(handlers::telegram_auth_verify))
        .route("/telegram/disconnect", post(handlers::telegram_disconnect))
        .route("/stats", get(handlers::get_stats))
        .route("/pending-stats", get(handlers::get_pending_stats))
        .route("/sync", post(stream::start_sync))
        .route("/sync/cancel", post(handlers::cancel_sync))
        .route("/sync/logs", get(handlers::get_sync_logs))
        .route("/import", post(stream::start_import))
        .route("/import/path", post(stream::start_import_path))
        .route("/reindex", post(stream::start_reindex))
        .route("/process", post(stream::start_process))
        .route("/chats", get(handlers::get_chats))
        .route("/chats/sync", post(handlers::sync_chats))
        .route(
            "/chats/:id",
            put(handlers::update_chat).delete(handlers::delete_chat),
        )
        .route("/chat", post(stream::chat))
        .route("/v1/chat/completions", post(openai_compat::chat_completions))
        .route("/health", get(handlers::health))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until shutdown
pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> std::io::Result<()> {
    let app = router(state);
    tracing::info!("gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
