//! OpenAI-compatible adapter
//!
//! Covers every provider that speaks the chat-completions protocol,
//! parametric on base URL and API key. Reasoning, where a provider
//! interleaves it, arrives inline in `content` and is passed through
//! untouched.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::sse::{SseDecoder, DONE_PAYLOAD};
use super::{wire_messages, ChatChunk, LlmClient, LlmEvent, StreamRequest, STREAM_IDLE_TIMEOUT};
use crate::error::{classify_http_error, classify_status, LifeQueryError, Result};

pub struct OpenAiCompatClient {
    name: &'static str,
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatClient {
    pub fn new(name: &'static str, base_url: String, api_key: String) -> Self {
        Self {
            name,
            client: Client::new(),
            base_url,
            api_key,
        }
    }

    async fn pump(response: reqwest::Response, tx: mpsc::Sender<LlmEvent>, request: StreamRequest) {
        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::new();

        loop {
            let next = tokio::select! {
                _ = request.cancel.cancelled() => break,
                next = tokio::time::timeout(STREAM_IDLE_TIMEOUT, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    let _ = tx.send(LlmEvent::Error("stream idle timeout".into())).await;
                    return;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    let _ = tx.send(LlmEvent::Error(e.to_string())).await;
                    return;
                }
                Ok(Some(Ok(bytes))) => bytes,
            };

            for payload in decoder.push(&chunk) {
                if payload == DONE_PAYLOAD {
                    let _ = tx.send(LlmEvent::Done).await;
                    return;
                }
                let Ok(parsed) = serde_json::from_str::<ChatChunk>(&payload) else {
                    continue;
                };
                for choice in parsed.choices {
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() && tx.send(LlmEvent::Token(content)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }

        let _ = tx.send(LlmEvent::Done).await;
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn stream_chat(&self, request: StreamRequest) -> Result<mpsc::Receiver<LlmEvent>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": request.model,
            "messages": wire_messages(&request.messages),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": true,
        });

        let (tx, rx) = mpsc::channel(100);

        let mut builder = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        match builder.send().await {
            Err(e) => {
                let _ = tx.send(LlmEvent::Error(e.to_string())).await;
            }
            Ok(response) if !response.status().is_success() => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                let _ = tx
                    .send(LlmEvent::Error(format!("HTTP {}: {}", status, text)))
                    .await;
            }
            Ok(response) => {
                tokio::spawn(Self::pump(response, tx, request));
            }
        }

        Ok(rx)
    }
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// List the models a provider advertises at `GET {base}/models`
pub async fn list_models(base_url: &str, api_key: &str) -> Result<Vec<String>> {
    if base_url.is_empty() {
        return Err(LifeQueryError::Config("base URL is required".into()));
    }
    let url = format!("{}/models", base_url.trim_end_matches('/'));

    let client = Client::new();
    let mut builder = client.get(&url);
    if !api_key.is_empty() {
        builder = builder.bearer_auth(api_key);
    }

    let response = builder.send().await.map_err(|e| classify_http_error(&e))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status.as_u16(), &body));
    }

    let parsed: ModelsResponse = response
        .json()
        .await
        .map_err(|e| LifeQueryError::Upstream(format!("models response: {}", e)))?;

    let mut models: Vec<String> = parsed.data.into_iter().map(|m| m.id).collect();
    models.sort();
    Ok(models)
}
