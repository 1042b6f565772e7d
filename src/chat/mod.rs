//! Streaming chat orchestration
//!
//! Composes system prompt + retrieved context + history, fans out to the
//! configured LLM back-end and emits a heterogeneous event stream: one
//! debug event up front, interleaved token/reasoning events, citations
//! after the last token, and a terminal done marker. An LLM failure
//! becomes a single `[Error: …]` token; the stream always terminates
//! cleanly.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{LifeQueryError, Result};
use crate::llm::{client_from_settings, LlmEvent, StreamRequest};
use crate::retrieval::RetrievalEngine;
use crate::storage::{Settings, Storage};
use crate::types::{ChatEvent, ChatRole, PromptMessage, RetrievedContext};

pub struct ChatOrchestrator {
    storage: Storage,
    retrieval: Arc<RetrievalEngine>,
}

/// Fill the system prompt template
fn render_system_prompt(settings: &Settings, context_text: &str, current_date: &str) -> String {
    settings
        .system_prompt
        .replace("{context_text}", context_text)
        .replace("{user_name}", &settings.user_name)
        .replace("{current_date}", current_date)
}

impl ChatOrchestrator {
    pub fn new(storage: Storage, retrieval: Arc<RetrievalEngine>) -> Self {
        Self { storage, retrieval }
    }

    /// Run one chat turn. `history` is the ordered conversation including
    /// the latest user message.
    pub async fn chat(
        &self,
        history: Vec<PromptMessage>,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ChatEvent>> {
        let latest_user = history
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .ok_or_else(|| LifeQueryError::InvalidInput("history has no user message".into()))?
            .content
            .clone();

        let settings = self.storage.with_connection(Settings::load)?;

        let retrieved = if settings.rag_enabled {
            self.retrieval.retrieve(&latest_user, &settings).await
        } else {
            RetrievedContext::default()
        };

        let current_date = Utc::now().format("%Y-%m-%d").to_string();
        let system = render_system_prompt(&settings, &retrieved.context_text, &current_date);

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(PromptMessage::system(system));
        messages.extend(history);

        let variables = serde_json::json!({
            "user_name": settings.user_name,
            "current_date": current_date,
            "rag_enabled": settings.rag_enabled,
            "context_chunks": retrieved.citations.len(),
            "model": settings.llm_model,
            "provider": settings.llm_provider,
        });

        let (tx, rx) = mpsc::channel(100);
        let settings_for_task = settings.clone();
        let messages_for_task = messages.clone();

        tokio::spawn(async move {
            // Debug first, even when the back-end cannot be built: clients
            // always learn what would have been sent.
            let _ = tx
                .send(ChatEvent::Debug {
                    messages: messages_for_task.clone(),
                    variables,
                })
                .await;

            let client = match client_from_settings(&settings_for_task) {
                Ok(client) => client,
                Err(e) => {
                    let _ = tx.send(ChatEvent::Token {
                        content: format!("[Error: {}]", e),
                    })
                    .await;
                    let _ = tx.send(ChatEvent::Done).await;
                    return;
                }
            };

            let request = StreamRequest {
                messages: messages_for_task,
                model: settings_for_task.llm_model.clone(),
                temperature: settings_for_task.temperature,
                max_tokens: settings_for_task.max_tokens,
                enable_thinking: settings_for_task.enable_thinking,
                cancel: cancel.clone(),
            };

            debug!("chat: streaming via {} ({})", client.name(), request.model);

            let mut events = match client.stream_chat(request).await {
                Ok(events) => events,
                Err(e) => {
                    let _ = tx.send(ChatEvent::Token {
                        content: format!("[Error: {}]", e),
                    })
                    .await;
                    let _ = tx.send(ChatEvent::Done).await;
                    return;
                }
            };

            let mut failed = false;
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Some(LlmEvent::Token(content)) => {
                        if tx.send(ChatEvent::Token { content }).await.is_err() {
                            return;
                        }
                    }
                    Some(LlmEvent::Reasoning(content)) => {
                        if tx.send(ChatEvent::Reasoning { content }).await.is_err() {
                            return;
                        }
                    }
                    Some(LlmEvent::Error(message)) => {
                        failed = true;
                        let _ = tx.send(ChatEvent::Token {
                            content: format!("[Error: {}]", message),
                        })
                        .await;
                        break;
                    }
                    Some(LlmEvent::Done) | None => break,
                }
            }

            // No citations after a failure; a clean run gets them even if
            // the list is empty.
            if !failed && !cancel.is_cancelled() {
                let _ = tx.send(ChatEvent::Citations {
                    citations: retrieved.citations,
                })
                .await;
            }
            let _ = tx.send(ChatEvent::Done).await;
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with_prompt(prompt: &str) -> Settings {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                crate::storage::settings::write_setting(
                    conn,
                    "system_prompt",
                    &serde_json::json!(prompt),
                )?;
                crate::storage::settings::write_setting(
                    conn,
                    "user_name",
                    &serde_json::json!("Ada"),
                )?;
                Settings::load(conn)
            })
            .unwrap()
    }

    #[test]
    fn test_render_system_prompt() {
        let settings =
            settings_with_prompt("Hello {user_name}, today is {current_date}.\n{context_text}");
        let rendered = render_system_prompt(&settings, "CONTEXT", "2024-05-01");
        assert_eq!(rendered, "Hello Ada, today is 2024-05-01.\nCONTEXT");
    }

    #[test]
    fn test_render_with_empty_context() {
        let settings = settings_with_prompt("{context_text}|{user_name}");
        let rendered = render_system_prompt(&settings, "", "2024-05-01");
        assert_eq!(rendered, "|Ada");
    }
}
