//! Retrieval and context assembly
//!
//! Turns a query into a bounded, date-ordered context block: similarity
//! decides which chunks get in, dates decide the order they are shown in.
//! Retrieval failures degrade to an empty context so chat stays available
//! through vector-store or embedder outages.

use chrono::DateTime;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use crate::chunker::count_tokens;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::storage::{queries, Settings, Storage};
use crate::types::{Citation, QueryHit, RetrievedContext};
use crate::vector::VectorStore;

/// Citation excerpts are clipped to this many characters
const EXCERPT_CHARS: usize = 200;

pub struct RetrievalEngine {
    storage: Storage,
    vectors: VectorStore,
    embedder: Arc<dyn Embedder>,
}

fn format_date(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Render one hit as a context section: header line, blank line, chunk
/// text, trailing separator.
fn render_section(hit: &QueryHit) -> String {
    format!(
        "[{}] {} → {}, participants: {}\n\n{}\n---\n",
        hit.chat_name,
        format_date(hit.start_ts),
        format_date(hit.end_ts),
        hit.participants.join(", "),
        hit.excerpt,
    )
}

fn clip_excerpt(text: &str) -> String {
    if text.chars().count() <= EXCERPT_CHARS {
        return text.to_string();
    }
    let clipped: String = text.chars().take(EXCERPT_CHARS).collect();
    format!("{}…", clipped.trim_end())
}

impl RetrievalEngine {
    pub fn new(storage: Storage, vectors: VectorStore, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            storage,
            vectors,
            embedder,
        }
    }

    /// Retrieve context for a query. Never fails: any error along the way
    /// yields an empty result and the orchestrator proceeds without
    /// context.
    pub async fn retrieve(&self, query: &str, settings: &Settings) -> RetrievedContext {
        match self.try_retrieve(query, settings).await {
            Ok(context) => context,
            Err(e) => {
                warn!("retrieval degraded to empty context: {}", e);
                RetrievedContext::default()
            }
        }
    }

    async fn try_retrieve(&self, query: &str, settings: &Settings) -> Result<RetrievedContext> {
        let included: HashSet<String> = self
            .storage
            .with_connection(|conn| queries::included_chat_ids(conn))?
            .into_iter()
            .collect();
        if included.is_empty() {
            return Ok(RetrievedContext::default());
        }

        let query_embedding = self
            .embedder
            .embed(std::slice::from_ref(&query.to_string()))
            .await?;
        let Some(query_embedding) = query_embedding.first() else {
            return Ok(RetrievedContext::default());
        };

        let mut hits = self.vectors.query(
            query_embedding,
            settings.top_k.max(0) as usize,
            &included,
        )?;

        // Similarity decided inclusion; display order is chronological.
        hits.sort_by(|a, b| {
            a.start_ts
                .cmp(&b.start_ts)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });

        Ok(assemble(&hits, settings.context_max_tokens.max(0) as usize))
    }
}

/// Greedy token-capped assembly. A section that would overflow the cap is
/// skipped but assembly continues, so an early small chunk is never
/// starved by a large one before it.
fn assemble(hits: &[QueryHit], context_cap: usize) -> RetrievedContext {
    let mut context_text = String::new();
    let mut citations = Vec::new();
    let mut used_tokens = 0usize;

    for hit in hits {
        let section = render_section(hit);
        let section_tokens = count_tokens(&section);
        if used_tokens + section_tokens > context_cap {
            continue;
        }
        used_tokens += section_tokens;
        context_text.push_str(&section);
        citations.push(Citation {
            chunk_id: hit.chunk_id.clone(),
            chat_id: hit.chat_id.clone(),
            chat_name: hit.chat_name.clone(),
            start_ts: hit.start_ts,
            end_ts: hit.end_ts,
            excerpt: clip_excerpt(&hit.excerpt),
        });
    }

    RetrievedContext {
        context_text,
        citations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(chunk_id: &str, start_ts: i64, excerpt: &str) -> QueryHit {
        QueryHit {
            chunk_id: chunk_id.to_string(),
            chat_id: "a".to_string(),
            chat_name: "Chat A".to_string(),
            start_ts,
            end_ts: start_ts + 3600,
            participants: vec!["alice".to_string(), "bob".to_string()],
            excerpt: excerpt.to_string(),
            score: 0.9,
        }
    }

    #[test]
    fn test_render_section_shape() {
        let section = render_section(&hit("c1", 0, "hello world"));
        assert!(section.starts_with("[Chat A] 1970-01-01 → 1970-01-01, participants: alice, bob\n\n"));
        assert!(section.contains("hello world"));
        assert!(section.ends_with("---\n"));
    }

    #[test]
    fn test_assemble_respects_cap_but_continues() {
        let big = "word ".repeat(500);
        let hits = vec![hit("early", 0, "short one"), hit("huge", 100, &big), hit("late", 200, "short two")];

        let context = assemble(&hits, 80);
        let ids: Vec<&str> = context.citations.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
        assert!(!context.context_text.contains("word word"));
    }

    #[test]
    fn test_assemble_empty() {
        let context = assemble(&[], 1000);
        assert!(context.is_empty());
        assert!(context.context_text.is_empty());
    }

    #[test]
    fn test_citation_excerpt_clipped() {
        let long = "x".repeat(500);
        let hits = vec![hit("c1", 0, &long)];
        let context = assemble(&hits, 10_000);
        assert!(context.citations[0].excerpt.chars().count() <= EXCERPT_CHARS + 1);
        assert!(context.citations[0].excerpt.ends_with('…'));
    }

    #[test]
    fn test_format_date() {
        assert_eq!(format_date(0), "1970-01-01");
        assert_eq!(format_date(86_400), "1970-01-02");
    }
}
