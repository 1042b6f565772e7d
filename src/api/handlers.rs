//! Unary JSON handlers

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ApiError, ApiResult, AppState};
use crate::embedding::EmbedderConfig;
use crate::error::LifeQueryError;
use crate::llm::{self, normalize_base_url};
use crate::storage::{queries, settings, sync_log, Settings};
use crate::types::OperationKind;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": crate::VERSION }))
}

pub async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let map = state
        .storage
        .with_connection(|conn| settings::read_all_masked(conn))?;
    Ok(Json(Value::Object(map)))
}

/// Partial update; unknown keys are rejected, sentinel writes are ignored
pub async fn update_settings(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let Value::Object(entries) = body else {
        return Err(ApiError(LifeQueryError::InvalidInput(
            "expected a JSON object".into(),
        )));
    };

    let updated = state.storage.with_transaction(|conn| {
        for (key, value) in &entries {
            settings::write_setting(conn, key, value)?;
        }
        settings::read_all_masked(conn)
    })?;

    // Reconfigure the embedder whenever its endpoint may have changed
    if entries.keys().any(|k| k.starts_with("embedding_")) {
        let snapshot = state.storage.with_connection(Settings::load)?;
        state.embedder.reset(EmbedderConfig {
            base_url: snapshot.embedding_base_url,
            api_key: snapshot.embedding_api_key,
            model: snapshot.embedding_model,
        });
    }

    Ok(Json(Value::Object(updated)))
}

pub async fn get_providers() -> Json<Value> {
    Json(json!({ "providers": llm::providers() }))
}

#[derive(Deserialize)]
pub struct ModelsQuery {
    provider: Option<String>,
    url: Option<String>,
    api_key: Option<String>,
}

pub async fn get_models(
    State(state): State<AppState>,
    Query(query): Query<ModelsQuery>,
) -> ApiResult<Json<Value>> {
    let base_url = match (&query.url, &query.provider) {
        (Some(url), _) if !url.is_empty() => normalize_base_url(url),
        (_, Some(provider)) => llm::providers()
            .iter()
            .find(|p| p.id == provider.as_str())
            .map(|p| p.default_base_url.to_string())
            .ok_or_else(|| {
                ApiError(LifeQueryError::InvalidInput(format!(
                    "unknown provider: {}",
                    provider
                )))
            })?,
        _ => {
            return Err(ApiError(LifeQueryError::InvalidInput(
                "provider or url is required".into(),
            )))
        }
    };

    let api_key = match query.api_key {
        Some(key) if !key.is_empty() => key,
        _ => state
            .storage
            .with_connection(|conn| settings::read_raw(conn, "llm_api_key"))?,
    };

    let models = llm::list_models(&base_url, &api_key).await?;
    Ok(Json(json!({ "models": models })))
}

pub async fn telegram_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let status = state.connector.status().await?;
    Ok(Json(serde_json::to_value(status)?))
}

pub async fn telegram_auth_start(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.connector.auth_start(payload).await?))
}

pub async fn telegram_auth_verify(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.connector.auth_verify(payload).await?))
}

pub async fn telegram_disconnect(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.connector.disconnect().await?;
    Ok(Json(json!({ "disconnected": true })))
}

pub async fn get_stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let stats = state.storage.with_connection(|conn| queries::stats(conn))?;
    Ok(Json(serde_json::to_value(stats)?))
}

pub async fn get_pending_stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let pending = state
        .storage
        .with_connection(|conn| queries::pending_stats(conn))?;
    Ok(Json(serde_json::to_value(pending)?))
}

pub async fn cancel_sync(State(state): State<AppState>) -> Json<Value> {
    let cancelled = state.tasks.cancel(OperationKind::Sync);
    Json(json!({ "cancelled": cancelled }))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    limit: Option<usize>,
}

pub async fn get_sync_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.unwrap_or(20).min(500);
    let entries = state
        .storage
        .with_connection(|conn| sync_log::tail_log(conn, limit))?;
    Ok(Json(json!({ "logs": entries })))
}

pub async fn get_chats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let chats = state
        .storage
        .with_connection(|conn| queries::list_chats(conn))?;
    Ok(Json(json!({ "chats": chats })))
}

#[derive(Deserialize)]
pub struct ChatUpdate {
    included: Option<bool>,
    title: Option<String>,
}

pub async fn update_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    Json(update): Json<ChatUpdate>,
) -> ApiResult<Json<Value>> {
    let chat = state.storage.with_transaction(|conn| {
        if let Some(included) = update.included {
            queries::set_included(conn, &chat_id, included)?;
        }
        if let Some(title) = update.title.as_deref() {
            queries::upsert_chat(conn, &chat_id, Some(title), None)?;
        }
        queries::get_chat(conn, &chat_id)
    })?;

    match chat {
        Some(chat) => Ok(Json(serde_json::to_value(chat)?)),
        None => Err(ApiError(LifeQueryError::NotFound(format!(
            "chat {}",
            chat_id
        )))),
    }
}

/// Delete a chat and evict its vectors
pub async fn delete_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let result = state
        .storage
        .with_transaction(|conn| queries::delete_chat(conn, &chat_id))?;
    state.vectors.delete(&result.chunk_ids)?;
    Ok(Json(serde_json::to_value(result)?))
}

/// Refresh chat metadata from the external provider
pub async fn sync_chats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let chats = state.connector.list_chats().await?;
    let count = chats.len();
    state.storage.with_transaction(|conn| {
        for (chat_id, title, chat_type) in &chats {
            queries::upsert_chat(conn, chat_id, Some(title.as_str()), Some(*chat_type))?;
        }
        Ok(())
    })?;
    Ok(Json(json!({ "updated": count })))
}
