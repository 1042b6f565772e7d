//! Typed settings over the `config` table
//!
//! Every key is declared in a static schema with a kind, a default and a
//! sensitivity flag. Values are stored as strings and coerced on read;
//! sensitive values serialize to a sentinel on the wire and writes of the
//! sentinel are discarded. In-memory values are always plaintext.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};

use crate::error::{LifeQueryError, Result};

/// Wire placeholder for sensitive values
pub const SENSITIVE_SENTINEL: &str = "****";

/// Declared type of a setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    String,
    Int,
    Float,
    Bool,
}

/// One entry in the settings schema
pub struct SettingDef {
    pub key: &'static str,
    pub kind: SettingKind,
    pub default: &'static str,
    pub sensitive: bool,
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a personal memory assistant for {user_name}. \
Today's date is {current_date}. Answer questions using the conversation excerpts below \
when they are relevant, and say so when they are not.\n\n{context_text}";

/// The settings schema. Order is the wire order of `GET /settings`.
pub static SETTING_SCHEMA: &[SettingDef] = &[
    SettingDef { key: "user_name", kind: SettingKind::String, default: "", sensitive: false },
    SettingDef { key: "system_prompt", kind: SettingKind::String, default: DEFAULT_SYSTEM_PROMPT, sensitive: false },
    SettingDef { key: "llm_provider", kind: SettingKind::String, default: "deepseek", sensitive: false },
    SettingDef { key: "llm_base_url", kind: SettingKind::String, default: "", sensitive: false },
    SettingDef { key: "llm_api_key", kind: SettingKind::String, default: "", sensitive: true },
    SettingDef { key: "llm_model", kind: SettingKind::String, default: "deepseek-chat", sensitive: false },
    SettingDef { key: "temperature", kind: SettingKind::Float, default: "0.7", sensitive: false },
    SettingDef { key: "max_tokens", kind: SettingKind::Int, default: "2048", sensitive: false },
    SettingDef { key: "enable_thinking", kind: SettingKind::Bool, default: "false", sensitive: false },
    SettingDef { key: "embedding_base_url", kind: SettingKind::String, default: "https://api.openai.com/v1", sensitive: false },
    SettingDef { key: "embedding_api_key", kind: SettingKind::String, default: "", sensitive: true },
    SettingDef { key: "embedding_model", kind: SettingKind::String, default: "text-embedding-3-small", sensitive: false },
    SettingDef { key: "rag_enabled", kind: SettingKind::Bool, default: "true", sensitive: false },
    SettingDef { key: "top_k", kind: SettingKind::Int, default: "10", sensitive: false },
    SettingDef { key: "context_max_tokens", kind: SettingKind::Int, default: "4096", sensitive: false },
    SettingDef { key: "chunk_target_tokens", kind: SettingKind::Int, default: "200", sensitive: false },
    SettingDef { key: "chunk_max_tokens", kind: SettingKind::Int, default: "500", sensitive: false },
    SettingDef { key: "chunk_overlap_tokens", kind: SettingKind::Int, default: "50", sensitive: false },
    SettingDef { key: "noise_keywords", kind: SettingKind::String, default: "", sensitive: false },
    SettingDef { key: "sync_batch_size", kind: SettingKind::Int, default: "200", sensitive: false },
    SettingDef { key: "sync_batch_delay_ms", kind: SettingKind::Int, default: "0", sensitive: false },
    SettingDef { key: "auto_sync_interval_minutes", kind: SettingKind::Int, default: "0", sensitive: false },
    SettingDef { key: "api_key", kind: SettingKind::String, default: "", sensitive: true },
];

fn schema_for(key: &str) -> Option<&'static SettingDef> {
    SETTING_SCHEMA.iter().find(|def| def.key == key)
}

fn coerce_bool(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn coerce_int(raw: &str, default: &str) -> i64 {
    raw.trim()
        .parse()
        .unwrap_or_else(|_| default.parse().unwrap_or(0))
}

fn coerce_float(raw: &str, default: &str) -> f64 {
    raw.trim()
        .parse()
        .unwrap_or_else(|_| default.parse().unwrap_or(0.0))
}

/// Raw string value of a key, falling back to the schema default
pub fn read_raw(conn: &Connection, key: &str) -> Result<String> {
    let def = schema_for(key)
        .ok_or_else(|| LifeQueryError::InvalidInput(format!("unknown setting: {}", key)))?;
    let stored: Option<String> = conn
        .query_row("SELECT value FROM config WHERE key = ?", [key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(stored.unwrap_or_else(|| def.default.to_string()))
}

/// Coerced JSON value of a key, masked if sensitive
pub fn read_masked(conn: &Connection, key: &str) -> Result<Value> {
    let def = schema_for(key)
        .ok_or_else(|| LifeQueryError::InvalidInput(format!("unknown setting: {}", key)))?;
    let raw = read_raw(conn, key)?;

    if def.sensitive {
        return Ok(if raw.is_empty() {
            json!("")
        } else {
            json!(SENSITIVE_SENTINEL)
        });
    }

    Ok(match def.kind {
        SettingKind::String => json!(raw),
        SettingKind::Int => json!(coerce_int(&raw, def.default)),
        SettingKind::Float => json!(coerce_float(&raw, def.default)),
        SettingKind::Bool => json!(coerce_bool(&raw)),
    })
}

/// All settings as a masked JSON object, in schema order
pub fn read_all_masked(conn: &Connection) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for def in SETTING_SCHEMA {
        map.insert(def.key.to_string(), read_masked(conn, def.key)?);
    }
    Ok(map)
}

/// Write one setting. Unknown keys are rejected; the sentinel preserves
/// the existing sensitive value.
pub fn write_setting(conn: &Connection, key: &str, value: &Value) -> Result<()> {
    let def = schema_for(key)
        .ok_or_else(|| LifeQueryError::InvalidInput(format!("unknown setting: {}", key)))?;

    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => {
            return Err(LifeQueryError::InvalidInput(format!(
                "setting {} cannot be set to {}",
                key, other
            )))
        }
    };

    if def.sensitive && raw == SENSITIVE_SENTINEL {
        return Ok(());
    }

    conn.execute(
        "INSERT INTO config (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, raw],
    )?;
    Ok(())
}

/// Typed snapshot of every setting. Operations read one snapshot at start
/// and never observe mid-run changes.
#[derive(Debug, Clone)]
pub struct Settings {
    pub user_name: String,
    pub system_prompt: String,
    pub llm_provider: String,
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub temperature: f64,
    pub max_tokens: i64,
    pub enable_thinking: bool,
    pub embedding_base_url: String,
    pub embedding_api_key: String,
    pub embedding_model: String,
    pub rag_enabled: bool,
    pub top_k: i64,
    pub context_max_tokens: i64,
    pub chunk_target_tokens: i64,
    pub chunk_max_tokens: i64,
    pub chunk_overlap_tokens: i64,
    pub noise_keywords: Vec<String>,
    pub sync_batch_size: i64,
    pub sync_batch_delay_ms: i64,
    pub auto_sync_interval_minutes: i64,
    pub api_key: String,
}

impl Settings {
    /// Read a snapshot from the config table
    pub fn load(conn: &Connection) -> Result<Self> {
        let raw = |key: &str| read_raw(conn, key);
        let int = |key: &str| -> Result<i64> {
            let def = schema_for(key).expect("schema key");
            Ok(coerce_int(&read_raw(conn, key)?, def.default))
        };
        let float = |key: &str| -> Result<f64> {
            let def = schema_for(key).expect("schema key");
            Ok(coerce_float(&read_raw(conn, key)?, def.default))
        };
        let boolean = |key: &str| -> Result<bool> { Ok(coerce_bool(&read_raw(conn, key)?)) };

        let noise_keywords = raw("noise_keywords")?
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Settings {
            user_name: raw("user_name")?,
            system_prompt: raw("system_prompt")?,
            llm_provider: raw("llm_provider")?,
            llm_base_url: raw("llm_base_url")?,
            llm_api_key: raw("llm_api_key")?,
            llm_model: raw("llm_model")?,
            temperature: float("temperature")?,
            max_tokens: int("max_tokens")?,
            enable_thinking: boolean("enable_thinking")?,
            embedding_base_url: raw("embedding_base_url")?,
            embedding_api_key: raw("embedding_api_key")?,
            embedding_model: raw("embedding_model")?,
            rag_enabled: boolean("rag_enabled")?,
            top_k: int("top_k")?,
            context_max_tokens: int("context_max_tokens")?,
            chunk_target_tokens: int("chunk_target_tokens")?,
            chunk_max_tokens: int("chunk_max_tokens")?,
            chunk_overlap_tokens: int("chunk_overlap_tokens")?,
            noise_keywords,
            sync_batch_size: int("sync_batch_size")?,
            sync_batch_delay_ms: int("sync_batch_delay_ms")?,
            auto_sync_interval_minutes: int("auto_sync_interval_minutes")?,
            api_key: raw("api_key")?,
        })
    }
}
