//! Native DeepSeek adapter
//!
//! Speaks the chat-completions protocol directly so the
//! `reasoning_content` delta field survives; the generic SDK shape drops
//! it. Reasoning deltas surface as [`LlmEvent::Reasoning`].

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;

use super::sse::{SseDecoder, DONE_PAYLOAD};
use super::{wire_messages, ChatChunk, LlmClient, LlmEvent, StreamRequest, STREAM_IDLE_TIMEOUT};
use crate::error::Result;

pub struct DeepSeekClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl DeepSeekClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
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
                    if let Some(reasoning) = choice.delta.reasoning_content {
                        if !reasoning.is_empty()
                            && tx.send(LlmEvent::Reasoning(reasoning)).await.is_err()
                        {
                            return;
                        }
                    }
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
impl LlmClient for DeepSeekClient {
    fn name(&self) -> &'static str {
        "deepseek"
    }

    async fn stream_chat(&self, request: StreamRequest) -> Result<mpsc::Receiver<LlmEvent>> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": wire_messages(&request.messages),
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": true,
        });
        // Back-end-specific switch the generic chat-completions schema
        // does not carry.
        if request.enable_thinking {
            body["enable_thinking"] = serde_json::json!(true);
        }

        let (tx, rx) = mpsc::channel(100);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await;

        match response {
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
