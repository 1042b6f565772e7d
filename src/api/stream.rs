//! SSE endpoints: background operations and chat
//!
//! Every event line is `data: <json>\r\n\r\n` and every stream ends with
//! `data: [DONE]\r\n\r\n`. The buffering-disable header keeps reverse
//! proxies from batching the stream.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Response, StatusCode};
use axum::Json;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{ApiError, ApiResult, AppState};
use crate::ingest::{JsonFileSource, PipelineReport};
use crate::ingest::reindex::run_reindex;
use crate::storage::Settings;
use crate::types::{OperationKind, PromptMessage};

const SSE_DONE: &str = "data: [DONE]\r\n\r\n";

fn sse_line<T: Serialize>(value: &T) -> String {
    match serde_json::to_string(value) {
        Ok(json) => format!("data: {}\r\n\r\n", json),
        Err(_) => String::new(),
    }
}

/// Wrap an event receiver in an SSE response, appending the `[DONE]`
/// terminator once the channel closes. The guard token, when given, is
/// cancelled when the client goes away.
fn sse_response<T: Serialize + Send + 'static>(
    rx: tokio::sync::mpsc::Receiver<T>,
    guard: Option<CancellationToken>,
) -> Response<Body> {
    let guard = guard.map(|token| token.drop_guard());
    let events = ReceiverStream::new(rx)
        .map(move |event| {
            let _hold = &guard;
            Ok::<_, std::convert::Infallible>(sse_line(&event))
        })
        .chain(futures::stream::once(async {
            Ok(SSE_DONE.to_string())
        }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(events))
        .expect("static response parts")
}

/// `POST /sync` — pull from the live message source
pub async fn start_sync(State(state): State<AppState>) -> ApiResult<Response<Body>> {
    let connector = state.connector.clone();
    let pipeline = state.pipeline.clone();
    let storage = state.storage.clone();

    let rx = state.tasks.start(OperationKind::Sync, move |cancel, tx| async move {
        let settings = match storage.with_connection(Settings::load) {
            Ok(settings) => settings,
            Err(e) => return PipelineReport::failed(&e),
        };
        let mut source = match connector.open_source().await {
            Ok(source) => source,
            Err(e) => return PipelineReport::failed(&e),
        };
        pipeline.run(source.as_mut(), &settings, &cancel, &tx).await
    })?;

    Ok(sse_response(rx, None))
}

/// `POST /import` — body is the JSON export itself, validated up front
pub async fn start_import(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Response<Body>> {
    let source = JsonFileSource::from_value(body)?;
    start_import_source(state, source)
}

#[derive(Deserialize)]
pub struct ImportPathBody {
    path: String,
}

/// `POST /import/path` — import a JSON export already on disk
pub async fn start_import_path(
    State(state): State<AppState>,
    Json(body): Json<ImportPathBody>,
) -> ApiResult<Response<Body>> {
    let source = JsonFileSource::open(std::path::Path::new(&body.path))?;
    start_import_source(state, source)
}

fn start_import_source(state: AppState, mut source: JsonFileSource) -> ApiResult<Response<Body>> {
    let pipeline = state.pipeline.clone();
    let storage = state.storage.clone();

    let rx = state
        .tasks
        .start(OperationKind::Import, move |cancel, tx| async move {
            let settings = match storage.with_connection(Settings::load) {
                Ok(settings) => settings,
                Err(e) => return PipelineReport::failed(&e),
            };
            pipeline.run(&mut source, &settings, &cancel, &tx).await
        })?;

    Ok(sse_response(rx, None))
}

/// `POST /reindex` — re-embed everything into a fresh collection
pub async fn start_reindex(State(state): State<AppState>) -> ApiResult<Response<Body>> {
    let storage = state.storage.clone();
    let vectors = state.vectors.clone();
    let embedder = state.embedder.clone();

    let rx = state
        .tasks
        .start(OperationKind::Reindex, move |cancel, tx| async move {
            run_reindex(&storage, &vectors, embedder, &cancel, &tx).await
        })?;

    Ok(sse_response(rx, None))
}

/// `POST /process` — chunk and embed whatever is pending
pub async fn start_process(State(state): State<AppState>) -> ApiResult<Response<Body>> {
    let pipeline = state.pipeline.clone();
    let storage = state.storage.clone();

    let rx = state
        .tasks
        .start(OperationKind::Process, move |cancel, tx| async move {
            let settings = match storage.with_connection(Settings::load) {
                Ok(settings) => settings,
                Err(e) => return PipelineReport::failed(&e),
            };
            pipeline.run_process(&settings, &cancel, &tx).await
        })?;

    Ok(sse_response(rx, None))
}

#[derive(Deserialize)]
pub struct ChatBody {
    pub messages: Vec<PromptMessage>,
}

/// `POST /chat` — stream debug/token/reasoning/citations events
pub async fn chat(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> ApiResult<Response<Body>> {
    let cancel = CancellationToken::new();
    let rx = state
        .orchestrator
        .chat(body.messages, cancel.clone())
        .await
        .map_err(ApiError)?;

    Ok(sse_response(rx, Some(cancel)))
}
