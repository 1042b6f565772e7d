//! LLM back-ends behind a single streaming contract
//!
//! Every adapter exposes `stream_chat`, which yields a channel of
//! [`LlmEvent`]s. The native DeepSeek adapter preserves the
//! `reasoning_content` delta channel the generic chat-completions shape
//! drops; every other provider goes through the OpenAI-compatible adapter
//! parametric on base URL and key.

mod deepseek;
mod openai;
pub mod sse;

pub use deepseek::DeepSeekClient;
pub use openai::{list_models, OpenAiCompatClient};

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{LifeQueryError, Result};
use crate::storage::Settings;
use crate::types::PromptMessage;

/// Idle timeout between stream reads
pub(crate) const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// One event from a streaming back-end
#[derive(Debug, Clone, PartialEq)]
pub enum LlmEvent {
    Token(String),
    Reasoning(String),
    Error(String),
    Done,
}

/// A streaming chat request
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub messages: Vec<PromptMessage>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: i64,
    pub enable_thinking: bool,
    pub cancel: CancellationToken,
}

/// Common contract over all chat back-ends
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start a streaming completion. Failures after the request is
    /// accepted arrive as a single [`LlmEvent::Error`] on the channel.
    async fn stream_chat(&self, request: StreamRequest) -> Result<mpsc::Receiver<LlmEvent>>;
}

/// A selectable LLM provider
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderInfo {
    pub id: &'static str,
    pub label: &'static str,
    pub default_base_url: &'static str,
    pub default_model: &'static str,
}

/// Known providers, native first
pub fn providers() -> &'static [ProviderInfo] {
    &[
        ProviderInfo {
            id: "deepseek",
            label: "DeepSeek",
            default_base_url: "https://api.deepseek.com/v1",
            default_model: "deepseek-chat",
        },
        ProviderInfo {
            id: "openai",
            label: "OpenAI",
            default_base_url: "https://api.openai.com/v1",
            default_model: "gpt-4o-mini",
        },
        ProviderInfo {
            id: "openrouter",
            label: "OpenRouter",
            default_base_url: "https://openrouter.ai/api/v1",
            default_model: "openai/gpt-4o-mini",
        },
        ProviderInfo {
            id: "groq",
            label: "Groq",
            default_base_url: "https://api.groq.com/openai/v1",
            default_model: "llama-3.3-70b-versatile",
        },
        ProviderInfo {
            id: "ollama",
            label: "Ollama (local)",
            default_base_url: "http://localhost:11434/v1",
            default_model: "llama3.1",
        },
        ProviderInfo {
            id: "custom",
            label: "Custom (OpenAI-compatible)",
            default_base_url: "",
            default_model: "",
        },
    ]
}

/// Append `/v1` when the URL carries no version segment
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return String::new();
    }
    let last_segment = trimmed.rsplit('/').next().unwrap_or("");
    let is_versioned = last_segment.len() >= 2
        && last_segment.starts_with('v')
        && last_segment[1..].chars().all(|c| c.is_ascii_digit());
    if is_versioned {
        trimmed.to_string()
    } else {
        format!("{}/v1", trimmed)
    }
}

/// Build the configured client from a settings snapshot
pub fn client_from_settings(settings: &Settings) -> Result<Arc<dyn LlmClient>> {
    let provider = providers()
        .iter()
        .find(|p| p.id == settings.llm_provider)
        .ok_or_else(|| {
            LifeQueryError::Config(format!("unknown llm_provider: {}", settings.llm_provider))
        })?;

    let base_url = if settings.llm_base_url.is_empty() {
        provider.default_base_url.to_string()
    } else {
        normalize_base_url(&settings.llm_base_url)
    };
    if base_url.is_empty() {
        return Err(LifeQueryError::Config(
            "llm_base_url is required for the custom provider".into(),
        ));
    }

    Ok(match provider.id {
        "deepseek" => Arc::new(DeepSeekClient::new(base_url, settings.llm_api_key.clone())),
        _ => Arc::new(OpenAiCompatClient::new(
            provider.id,
            base_url,
            settings.llm_api_key.clone(),
        )),
    })
}

/// Streaming chunk of a chat-completions response
#[derive(Debug, Deserialize)]
pub(crate) struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChunkChoice {
    pub delta: ChunkDelta,
    #[serde(default)]
    #[allow(dead_code)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    /// DeepSeek's structured reasoning channel
    #[serde(default)]
    pub reasoning_content: Option<String>,
}

/// Render request messages in the chat-completions wire shape
pub(crate) fn wire_messages(messages: &[PromptMessage]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content }))
        .collect()
}
