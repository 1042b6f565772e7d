//! Durable storage for LifeQuery
//!
//! A single SQLite database is the source of truth for messages, chunks,
//! chats, settings and the operation log. One writer at a time; everything
//! a logical operation writes goes through one transaction.

mod connection;
mod migrations;
pub mod queries;
pub mod settings;
pub mod sync_log;

pub use connection::Storage;
pub use migrations::SCHEMA_VERSION;
pub use settings::{SettingKind, Settings, SENSITIVE_SENTINEL};
