//! OpenAI-compatible chat surface
//!
//! `POST /v1/chat/completions` rides the same orchestrator path as
//! `/chat`, translating between the chat-completions schema and the
//! internal event stream. Streaming responses emit token-delta chunks;
//! non-streaming responses carry the citations in an `x_citations` side
//! field.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Response, StatusCode};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{ApiError, ApiResult, AppState};
use crate::error::LifeQueryError;
use crate::types::{ChatEvent, ChatRole, PromptMessage};

#[derive(Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

fn to_history(messages: &[WireMessage]) -> Result<Vec<PromptMessage>, LifeQueryError> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role.as_str() {
                "system" => ChatRole::System,
                "user" => ChatRole::User,
                "assistant" => ChatRole::Assistant,
                other => {
                    return Err(LifeQueryError::InvalidInput(format!(
                        "unsupported role: {}",
                        other
                    )))
                }
            };
            Ok(PromptMessage {
                role,
                content: m.content.clone(),
            })
        })
        .collect()
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn chunk(id: &str, created: u64, model: &str, delta: Value, finish_reason: Option<&str>) -> Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    })
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(request): Json<ChatCompletionRequest>,
) -> ApiResult<Response<Body>> {
    let history = to_history(&request.messages).map_err(ApiError)?;
    let model = request.model.unwrap_or_else(|| "lifequery".to_string());

    let cancel = CancellationToken::new();
    let mut events = state
        .orchestrator
        .chat(history, cancel.clone())
        .await
        .map_err(ApiError)?;

    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
    let created = now_secs();

    if request.stream {
        let (tx, rx) = tokio::sync::mpsc::channel::<String>(100);
        tokio::spawn(async move {
            let _ = tx
                .send(format!(
                    "data: {}\r\n\r\n",
                    chunk(&id, created, &model, json!({ "role": "assistant" }), None)
                ))
                .await;

            while let Some(event) = events.recv().await {
                let delta = match event {
                    ChatEvent::Token { content } => json!({ "content": content }),
                    ChatEvent::Reasoning { content } => json!({ "reasoning_content": content }),
                    ChatEvent::Done => {
                        let _ = tx
                            .send(format!(
                                "data: {}\r\n\r\n",
                                chunk(&id, created, &model, json!({}), Some("stop"))
                            ))
                            .await;
                        break;
                    }
                    // Debug and citations have no chat-completions shape
                    _ => continue,
                };
                let line =
                    format!("data: {}\r\n\r\n", chunk(&id, created, &model, delta, None));
                if tx.send(line).await.is_err() {
                    cancel.cancel();
                    return;
                }
            }
            let _ = tx.send("data: [DONE]\r\n\r\n".to_string()).await;
        });

        let body = Body::from_stream(
            tokio_stream::wrappers::ReceiverStream::new(rx)
                .map(Ok::<_, std::convert::Infallible>),
        );
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header("X-Accel-Buffering", "no")
            .body(body)
            .expect("static response parts"));
    }

    // Non-streaming: collect the whole answer, citations ride along
    let mut content = String::new();
    let mut citations = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            ChatEvent::Token { content: token } => content.push_str(&token),
            ChatEvent::Citations { citations: c } => citations = c,
            ChatEvent::Done => break,
            _ => {}
        }
    }

    let body = json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop",
        }],
        "x_citations": citations,
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("static response parts"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_history_roles() {
        let messages = vec![
            WireMessage { role: "system".into(), content: "s".into() },
            WireMessage { role: "user".into(), content: "u".into() },
            WireMessage { role: "assistant".into(), content: "a".into() },
        ];
        let history = to_history(&messages).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].role, ChatRole::User);

        let bad = vec![WireMessage { role: "tool".into(), content: "x".into() }];
        assert!(to_history(&bad).is_err());
    }

    #[test]
    fn test_chunk_shape() {
        let value = chunk("chatcmpl-1", 7, "m", json!({ "content": "hi" }), None);
        assert_eq!(value["object"], "chat.completion.chunk");
        assert_eq!(value["choices"][0]["delta"]["content"], "hi");
        assert!(value["choices"][0]["finish_reason"].is_null());
    }
}
