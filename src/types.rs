//! Core types for LifeQuery

use serde::{Deserialize, Serialize};

/// Chunk schema version.
///
/// Covers the tokenizer identity (cl100k_base) along with the chunking
/// rules; bump on any change that alters sealed chunk boundaries.
pub const CHUNK_VERSION: i32 = 1;

/// A single chat message. `(chat_id, message_id)` is the natural key and a
/// message is never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub chat_id: String,
    pub message_id: i64,
    /// Unix seconds
    pub ts: i64,
    pub sender: Option<String>,
    pub text: String,
}

/// A message as produced by an external message source, carrying enough
/// chat metadata to upsert the chat row alongside the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub chat_id: String,
    pub message_id: i64,
    pub ts: i64,
    #[serde(default)]
    pub sender: Option<String>,
    pub text: String,
    #[serde(default)]
    pub chat_title: Option<String>,
    #[serde(default)]
    pub chat_type: Option<ChatType>,
}

impl IncomingMessage {
    pub fn into_message(self) -> Message {
        Message {
            chat_id: self.chat_id,
            message_id: self.message_id,
            ts: self.ts,
            sender: self.sender,
            text: self.text,
        }
    }
}

/// Chat type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    #[default]
    OneToOne,
    Group,
    Channel,
}

impl std::fmt::Display for ChatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatType::OneToOne => write!(f, "one_to_one"),
            ChatType::Group => write!(f, "group"),
            ChatType::Channel => write!(f, "channel"),
        }
    }
}

impl std::str::FromStr for ChatType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "one_to_one" => Ok(ChatType::OneToOne),
            "group" => Ok(ChatType::Group),
            "channel" => Ok(ChatType::Channel),
            _ => Err(format!("Unknown chat type: {}", s)),
        }
    }
}

/// A chat (conversation) known to the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub chat_id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub chat_type: ChatType,
    pub message_count: i64,
    /// Chats with `included=false` are masked out of retrieval
    pub included: bool,
}

/// A time-window-grouped text block derived from messages; the unit of
/// embedding and retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable opaque identifier
    pub chunk_id: String,
    pub chat_id: String,
    pub text: String,
    /// SHA-256 of normalized text; unique across live chunks
    pub content_hash: String,
    pub chat_name: String,
    pub participants: Vec<String>,
    pub start_ts: i64,
    pub end_ts: i64,
    pub embedded: bool,
    pub version: i32,
}

/// A vector store record: embedding plus the chunk metadata projected to a
/// query-friendly form.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub embedding: Vec<f32>,
    pub chat_id: String,
    pub chat_name: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub participants: Vec<String>,
    /// Full chunk text, so retrieval never has to re-read the store
    pub excerpt: String,
}

impl VectorRecord {
    pub fn from_chunk(chunk: &Chunk, embedding: Vec<f32>) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            embedding,
            chat_id: chunk.chat_id.clone(),
            chat_name: chunk.chat_name.clone(),
            start_ts: chunk.start_ts,
            end_ts: chunk.end_ts,
            participants: chunk.participants.clone(),
            excerpt: chunk.text.clone(),
        }
    }
}

/// A vector query hit with its cosine similarity score
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub chunk_id: String,
    pub chat_id: String,
    pub chat_name: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub participants: Vec<String>,
    pub excerpt: String,
    pub score: f32,
}

/// Background operation kind; at most one of each runs at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Sync,
    Import,
    Reindex,
    Process,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Sync => write!(f, "sync"),
            OperationKind::Import => write!(f, "import"),
            OperationKind::Reindex => write!(f, "reindex"),
            OperationKind::Process => write!(f, "process"),
        }
    }
}

impl std::str::FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(OperationKind::Sync),
            "import" => Ok(OperationKind::Import),
            "reindex" => Ok(OperationKind::Reindex),
            "process" => Ok(OperationKind::Process),
            _ => Err(format!("Unknown operation: {}", s)),
        }
    }
}

/// Terminal or running status of a logged operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Running,
    Success,
    Error,
    Cancelled,
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Running => write!(f, "running"),
            OperationStatus::Success => write!(f, "success"),
            OperationStatus::Error => write!(f, "error"),
            OperationStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(OperationStatus::Running),
            "success" => Ok(OperationStatus::Success),
            "error" => Ok(OperationStatus::Error),
            "cancelled" => Ok(OperationStatus::Cancelled),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// One entry in the operation log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub id: i64,
    pub operation: OperationKind,
    pub status: OperationStatus,
    pub started_at: String,
    pub finished_at: Option<String>,
    #[serde(flatten)]
    pub counters: OperationCounters,
    pub detail: Option<String>,
}

/// Counters accumulated by an ingest-family operation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OperationCounters {
    pub messages_added: i64,
    pub duplicates_skipped: i64,
    pub chunks_added: i64,
    pub chunks_embedded: i64,
    pub noise_dropped: i64,
}

/// Pipeline stage, for progress reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Persist,
    Chunk,
    Embed,
    Swap,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Fetch => write!(f, "fetch"),
            Stage::Persist => write!(f, "persist"),
            Stage::Chunk => write!(f, "chunk"),
            Stage::Embed => write!(f, "embed"),
            Stage::Swap => write!(f, "swap"),
        }
    }
}

/// Progress stream events emitted by background operations
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    Progress {
        stage: Stage,
        message: String,
    },
    Done {
        #[serde(flatten)]
        counters: OperationCounters,
    },
    Cancelled {
        #[serde(flatten)]
        counters: OperationCounters,
    },
    Error {
        message: String,
    },
}

impl ProgressEvent {
    pub fn progress(stage: Stage, message: impl Into<String>) -> Self {
        ProgressEvent::Progress {
            stage,
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressEvent::Progress { .. })
    }
}

/// Role of a prompt message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// One message in an LLM conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: ChatRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A source citation for an answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    pub chat_id: String,
    pub chat_name: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub excerpt: String,
}

/// Retrieval output: a rendered context block plus the citations that
/// produced it, in display order.
#[derive(Debug, Clone, Default)]
pub struct RetrievedContext {
    pub context_text: String,
    pub citations: Vec<Citation>,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.citations.is_empty()
    }
}

/// Events emitted by the chat orchestrator
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatEvent {
    Debug {
        messages: Vec<PromptMessage>,
        variables: serde_json::Value,
    },
    Token {
        content: String,
    },
    Reasoning {
        content: String,
    },
    Citations {
        citations: Vec<Citation>,
    },
    Done,
}

/// Corpus statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub message_count: i64,
    pub chunk_count: i64,
    pub embedded_count: i64,
    pub chat_count: i64,
    pub included_chat_count: i64,
    pub last_sync: Option<String>,
}

/// Work waiting for the next process/sync run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingStats {
    pub pending_chunks: i64,
    pub chats_with_new_messages: i64,
}

/// Outcome of an insert against a uniqueness constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Result of deleting a chat; `chunk_ids` lets the caller evict vectors
#[derive(Debug, Clone, Serialize)]
pub struct DeleteChatResult {
    pub messages_deleted: i64,
    pub chunks_deleted: i64,
    #[serde(skip)]
    pub chunk_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_kind_round_trip() {
        for kind in [
            OperationKind::Sync,
            OperationKind::Import,
            OperationKind::Reindex,
            OperationKind::Process,
        ] {
            let s = kind.to_string();
            assert_eq!(s.parse::<OperationKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_progress_event_serialization() {
        let event = ProgressEvent::progress(Stage::Embed, "batch 3/10");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["stage"], "embed");

        let done = ProgressEvent::Done {
            counters: OperationCounters {
                messages_added: 5,
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["messages_added"], 5);
    }

    #[test]
    fn test_chat_event_tagging() {
        let event = ChatEvent::Token {
            content: "hello".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "token");
        assert_eq!(json["content"], "hello");
    }
}
