//! Message sources
//!
//! The engine is agnostic about where messages come from: anything that
//! yields batches of `(chat_id, message_id, timestamp, sender, text)`
//! tuples can drive an ingest. Provider authentication and HTTP plumbing
//! live outside the process boundary, behind [`SourceConnector`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;

use crate::error::{LifeQueryError, Result};
use crate::types::IncomingMessage;

/// A stream of messages feeding the ingest pipeline
#[async_trait]
pub trait MessageSource: Send {
    /// Next batch of at most `batch_size` messages, or `None` when the
    /// source is exhausted.
    async fn next_batch(&mut self, batch_size: usize) -> Result<Option<Vec<IncomingMessage>>>;
}

/// Connection state reported by the external provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceStatus {
    pub connected: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

/// The external message source provider (e.g. a Telegram bridge).
///
/// Everything here is delegated: the gateway forwards auth calls verbatim
/// and never interprets the payloads.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn status(&self) -> Result<SourceStatus>;
    async fn auth_start(&self, payload: Value) -> Result<Value>;
    async fn auth_verify(&self, payload: Value) -> Result<Value>;
    async fn disconnect(&self) -> Result<()>;

    /// Open a live message stream for a sync run
    async fn open_source(&self) -> Result<Box<dyn MessageSource>>;

    /// Refresh the provider's chat list into `IncomingMessage`-free chat
    /// metadata; default is an empty list for providers that cannot.
    async fn list_chats(&self) -> Result<Vec<(String, String, crate::types::ChatType)>> {
        Ok(Vec::new())
    }
}

/// Default connector when no provider is wired in
pub struct UnconfiguredConnector;

#[async_trait]
impl SourceConnector for UnconfiguredConnector {
    async fn status(&self) -> Result<SourceStatus> {
        Ok(SourceStatus {
            connected: false,
            detail: Some("no message source configured".into()),
        })
    }

    async fn auth_start(&self, _payload: Value) -> Result<Value> {
        Err(LifeQueryError::Config("no message source configured".into()))
    }

    async fn auth_verify(&self, _payload: Value) -> Result<Value> {
        Err(LifeQueryError::Config("no message source configured".into()))
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn open_source(&self) -> Result<Box<dyn MessageSource>> {
        Err(LifeQueryError::Config("no message source configured".into()))
    }
}

/// Static source over a JSON export file.
///
/// Accepts either a bare array of messages or an object with a
/// `messages` array; anything else is rejected before ingest starts.
pub struct JsonFileSource {
    messages: VecDeque<IncomingMessage>,
}

#[derive(Deserialize)]
struct ExportFile {
    messages: Vec<IncomingMessage>,
}

impl JsonFileSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        Self::from_reader(reader)
    }

    pub fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        let value: Value = serde_json::from_reader(reader)
            .map_err(|e| LifeQueryError::InvalidInput(format!("malformed JSON: {}", e)))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let messages: Vec<IncomingMessage> = if value.is_array() {
            serde_json::from_value(value)
                .map_err(|e| LifeQueryError::InvalidInput(format!("invalid message list: {}", e)))?
        } else if value.is_object() {
            let export: ExportFile = serde_json::from_value(value)
                .map_err(|e| LifeQueryError::InvalidInput(format!("invalid export file: {}", e)))?;
            export.messages
        } else {
            return Err(LifeQueryError::InvalidInput(
                "expected a JSON array or an object with a \"messages\" array".into(),
            ));
        };

        Ok(Self {
            messages: messages.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl MessageSource for JsonFileSource {
    async fn next_batch(&mut self, batch_size: usize) -> Result<Option<Vec<IncomingMessage>>> {
        if self.messages.is_empty() {
            return Ok(None);
        }
        let take = batch_size.min(self.messages.len()).max(1);
        Ok(Some(self.messages.drain(..take).collect()))
    }
}

/// In-memory source, mostly for tests and the chats-sync path
pub struct VecSource {
    messages: VecDeque<IncomingMessage>,
}

impl VecSource {
    pub fn new(messages: Vec<IncomingMessage>) -> Self {
        Self {
            messages: messages.into(),
        }
    }
}

#[async_trait]
impl MessageSource for VecSource {
    async fn next_batch(&mut self, batch_size: usize) -> Result<Option<Vec<IncomingMessage>>> {
        if self.messages.is_empty() {
            return Ok(None);
        }
        let take = batch_size.min(self.messages.len()).max(1);
        Ok(Some(self.messages.drain(..take).collect()))
    }
}
