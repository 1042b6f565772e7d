//! Time-window + size-budget chunking
//!
//! Groups chronologically ordered messages of one chat into text blocks:
//! long silences break a window, medium silences break it once the block
//! has reached its target size, and a hard token budget splits oversized
//! blocks with a token overlap carried into the successor. Sealed blocks
//! are deduplicated by a hash of their normalized text, which makes repeat
//! ingest idempotent.

use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashSet};
use tiktoken_rs::CoreBPE;

use crate::storage::Settings;
use crate::types::{Chunk, Message, CHUNK_VERSION};

/// A silence this long always starts a new window
pub const GAP_BREAK_SECS: i64 = 4 * 3600;

/// A silence this long starts a new window once the open chunk has
/// reached its target size
pub const GAP_JOIN_SECS: i64 = 20 * 60;

static TOKENIZER: Lazy<CoreBPE> =
    Lazy::new(|| tiktoken_rs::cl100k_base().expect("cl100k_base vocabulary"));

/// Deterministic token count (cl100k_base)
pub fn count_tokens(text: &str) -> usize {
    TOKENIZER.encode_with_special_tokens(text).len()
}

/// The trailing `n` tokens of `text`, decoded back to a string
fn token_tail(text: &str, n: usize) -> String {
    if n == 0 {
        return String::new();
    }
    let tokens = TOKENIZER.encode_with_special_tokens(text);
    if tokens.len() <= n {
        return text.to_string();
    }
    let tail = tokens[tokens.len() - n..].to_vec();
    match TOKENIZER.decode(tail) {
        Ok(decoded) => decoded,
        Err(_) => {
            let words: Vec<&str> = text.split_whitespace().collect();
            let keep = words.len().saturating_sub(n);
            words[keep..].join(" ")
        }
    }
}

/// Lowercase and collapse whitespace before hashing, so formatting-only
/// differences do not defeat dedup
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// SHA-256 of the normalized text, hex-encoded
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(text).as_bytes());
    hex::encode(hasher.finalize())
}

/// Chunking parameters, taken from the settings snapshot
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub target_tokens: usize,
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    /// Lowercased; matched against full message text
    pub noise_keywords: Vec<String>,
}

impl ChunkerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            target_tokens: settings.chunk_target_tokens.max(1) as usize,
            max_tokens: settings.chunk_max_tokens.max(1) as usize,
            overlap_tokens: settings.chunk_overlap_tokens.max(0) as usize,
            noise_keywords: settings.noise_keywords.clone(),
        }
    }
}

/// Output of one chunking pass
#[derive(Debug, Default)]
pub struct ChunkBatch {
    pub chunks: Vec<Chunk>,
    pub noise_dropped: i64,
    pub duplicates_skipped: i64,
}

/// Chunker for one chat's message stream
pub struct Chunker {
    config: ChunkerConfig,
    chat_id: String,
    chat_name: String,
}

struct OpenChunk {
    lines: Vec<String>,
    tokens: usize,
    start_ts: i64,
    end_ts: i64,
    participants: BTreeSet<String>,
}

impl OpenChunk {
    fn seeded(seed: String, ts: i64) -> Self {
        let tokens = if seed.is_empty() { 0 } else { count_tokens(&seed) };
        let lines = if seed.is_empty() { Vec::new() } else { vec![seed] };
        Self {
            lines,
            tokens,
            start_ts: ts,
            end_ts: ts,
            participants: BTreeSet::new(),
        }
    }

    fn text(&self) -> String {
        self.lines.join("\n")
    }
}

impl Chunker {
    pub fn new(config: ChunkerConfig, chat_id: impl Into<String>, chat_name: impl Into<String>) -> Self {
        Self {
            config,
            chat_id: chat_id.into(),
            chat_name: chat_name.into(),
        }
    }

    fn is_noise(&self, text: &str) -> bool {
        if self.config.noise_keywords.is_empty() {
            return false;
        }
        let lowered = text.to_lowercase();
        self.config.noise_keywords.iter().any(|kw| lowered.contains(kw))
    }

    fn render_line(message: &Message) -> String {
        match &message.sender {
            Some(sender) if !sender.is_empty() => format!("{}: {}", sender, message.text.trim()),
            _ => message.text.trim().to_string(),
        }
    }

    fn seal(&self, cur: OpenChunk, known_hashes: &mut HashSet<String>, batch: &mut ChunkBatch) {
        if cur.lines.is_empty() {
            return;
        }
        let text = cur.text();
        let hash = content_hash(&text);
        if !known_hashes.insert(hash.clone()) {
            batch.duplicates_skipped += 1;
            return;
        }
        batch.chunks.push(Chunk {
            chunk_id: uuid::Uuid::new_v4().to_string(),
            chat_id: self.chat_id.clone(),
            text,
            content_hash: hash,
            chat_name: self.chat_name.clone(),
            participants: cur.participants.iter().cloned().collect(),
            start_ts: cur.start_ts,
            end_ts: cur.end_ts,
            embedded: false,
            version: CHUNK_VERSION,
        });
    }

    /// Chunk an ordered message slice. `known_hashes` carries the hashes of
    /// chunks already live in the store; sealed duplicates are skipped and
    /// newly sealed hashes are added, so the same call is safe to repeat.
    ///
    /// Sealing is a pure function of the message sequence and the config:
    /// identical inputs produce the identical hash multiset.
    pub fn chunk_messages(
        &self,
        messages: &[Message],
        known_hashes: &mut HashSet<String>,
    ) -> ChunkBatch {
        let mut batch = ChunkBatch::default();
        let mut cur: Option<OpenChunk> = None;

        for message in messages {
            if message.text.trim().is_empty() {
                continue;
            }
            if self.is_noise(&message.text) {
                batch.noise_dropped += 1;
                continue;
            }

            let line = Self::render_line(message);
            let line_tokens = count_tokens(&line);

            if let Some(open) = cur.take() {
                let gap = message.ts - open.end_ts;
                if gap >= GAP_BREAK_SECS {
                    self.seal(open, known_hashes, &mut batch);
                } else if gap >= GAP_JOIN_SECS && open.tokens >= self.config.target_tokens {
                    self.seal(open, known_hashes, &mut batch);
                } else if open.tokens + line_tokens > self.config.max_tokens && !open.lines.is_empty()
                {
                    let seed = token_tail(&open.text(), self.config.overlap_tokens);
                    self.seal(open, known_hashes, &mut batch);
                    cur = Some(OpenChunk::seeded(seed, message.ts));
                } else {
                    cur = Some(open);
                }
            }

            let open = cur.get_or_insert_with(|| OpenChunk::seeded(String::new(), message.ts));
            open.lines.push(line);
            open.tokens += line_tokens;
            open.end_ts = message.ts;
            if let Some(sender) = &message.sender {
                if !sender.is_empty() {
                    open.participants.insert(sender.clone());
                }
            }
        }

        if let Some(open) = cur {
            self.seal(open, known_hashes, &mut batch);
        }

        batch
    }
}
