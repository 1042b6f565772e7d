//! Ingest pipeline: fetch, persist, chunk, embed, mark
//!
//! One logical ingest runs the stages strictly in order, batching within
//! each stage. Progress streams to a single subscriber; cancellation is
//! checked between batches and preserves everything already committed.
//! A failed embed batch leaves its chunks pending, so an interrupted run
//! resumes by simply running again.

pub mod reindex;
pub mod source;

pub use source::{JsonFileSource, MessageSource, SourceConnector, SourceStatus, UnconfiguredConnector, VecSource};

use rand::Rng;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chunker::{Chunker, ChunkerConfig, GAP_BREAK_SECS};
use crate::embedding::Embedder;
use crate::error::{LifeQueryError, Result};
use crate::storage::{queries, Settings, Storage};
use crate::types::{
    IncomingMessage, InsertOutcome, OperationCounters, OperationStatus, ProgressEvent, Stage,
    VectorRecord,
};
use crate::vector::{VectorStore, LIVE_COLLECTION};

/// Upper bound on texts per embedding call
pub const EMBED_BATCH_SIZE: usize = 64;

/// Retries for transient failures within one operation
const MAX_RETRIES: u32 = 3;

/// Terminal outcome of a pipeline run
#[derive(Debug)]
pub struct PipelineReport {
    pub counters: OperationCounters,
    pub status: OperationStatus,
    pub detail: Option<String>,
}

impl PipelineReport {
    fn success(counters: OperationCounters) -> Self {
        Self {
            counters,
            status: OperationStatus::Success,
            detail: None,
        }
    }

    fn cancelled(counters: OperationCounters) -> Self {
        Self {
            counters,
            status: OperationStatus::Cancelled,
            detail: None,
        }
    }

    fn error(counters: OperationCounters, err: &LifeQueryError) -> Self {
        Self {
            counters,
            status: OperationStatus::Error,
            detail: Some(err.to_string()),
        }
    }

    /// A run that failed before any work happened
    pub fn failed(err: &LifeQueryError) -> Self {
        Self::error(OperationCounters::default(), err)
    }

    /// The terminal progress event for this report
    pub fn terminal_event(&self) -> ProgressEvent {
        match self.status {
            OperationStatus::Cancelled => ProgressEvent::Cancelled {
                counters: self.counters,
            },
            OperationStatus::Error => ProgressEvent::Error {
                message: self.detail.clone().unwrap_or_else(|| "unknown error".into()),
            },
            _ => ProgressEvent::Done {
                counters: self.counters,
            },
        }
    }
}

/// Retry a transient-failing operation with exponential backoff + jitter
pub(crate) async fn with_retries<T, F, Fut>(cancel: &CancellationToken, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                attempt += 1;
                let base = 500u64 * (1 << attempt);
                let jitter = rand::thread_rng().gen_range(0..base / 2 + 1);
                let backoff = Duration::from_millis(base + jitter);
                warn!("transient failure (attempt {}): {}; backing off {:?}", attempt, e, backoff);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LifeQueryError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            other => return other,
        }
    }
}

/// Drives ingest-family operations against the stores
pub struct IngestPipeline {
    storage: Storage,
    vectors: VectorStore,
    embedder: Arc<dyn Embedder>,
}

struct ProgressSink<'a> {
    tx: &'a mpsc::Sender<ProgressEvent>,
}

impl ProgressSink<'_> {
    async fn send(&self, stage: Stage, message: impl Into<String>) {
        // The single subscriber may be gone; the operation keeps going.
        let _ = self.tx.send(ProgressEvent::progress(stage, message)).await;
    }
}

impl IngestPipeline {
    pub fn new(storage: Storage, vectors: VectorStore, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            storage,
            vectors,
            embedder,
        }
    }

    /// Full ingest: fetch from the source, persist, then chunk and embed
    /// whatever is now pending.
    pub async fn run(
        &self,
        source: &mut dyn MessageSource,
        settings: &Settings,
        cancel: &CancellationToken,
        progress: &mpsc::Sender<ProgressEvent>,
    ) -> PipelineReport {
        let mut counters = OperationCounters::default();
        let sink = ProgressSink { tx: progress };

        match self.fetch_and_persist(source, settings, cancel, &sink, &mut counters).await {
            Ok(()) => {}
            Err(LifeQueryError::Cancelled) => return PipelineReport::cancelled(counters),
            Err(e) => return PipelineReport::error(counters, &e),
        }

        self.process_pending(settings, cancel, &sink, counters).await
    }

    /// Chunk + embed only: picks up whatever earlier runs left pending.
    pub async fn run_process(
        &self,
        settings: &Settings,
        cancel: &CancellationToken,
        progress: &mpsc::Sender<ProgressEvent>,
    ) -> PipelineReport {
        let sink = ProgressSink { tx: progress };
        self.process_pending(settings, cancel, &sink, OperationCounters::default()).await
    }

    async fn process_pending(
        &self,
        settings: &Settings,
        cancel: &CancellationToken,
        sink: &ProgressSink<'_>,
        mut counters: OperationCounters,
    ) -> PipelineReport {
        match self.chunk_new_messages(settings, cancel, sink, &mut counters).await {
            Ok(()) => {}
            Err(LifeQueryError::Cancelled) => return PipelineReport::cancelled(counters),
            Err(e) => return PipelineReport::error(counters, &e),
        }

        match self.embed_pending(cancel, sink, &mut counters).await {
            Ok(()) => {}
            Err(LifeQueryError::Cancelled) => return PipelineReport::cancelled(counters),
            Err(e) => return PipelineReport::error(counters, &e),
        }

        info!(
            "ingest finished: {} messages, {} chunks, {} embedded",
            counters.messages_added, counters.chunks_added, counters.chunks_embedded
        );
        PipelineReport::success(counters)
    }

    async fn fetch_and_persist(
        &self,
        source: &mut dyn MessageSource,
        settings: &Settings,
        cancel: &CancellationToken,
        sink: &ProgressSink<'_>,
        counters: &mut OperationCounters,
    ) -> Result<()> {
        let batch_size = settings.sync_batch_size.max(1) as usize;
        let delay = Duration::from_millis(settings.sync_batch_delay_ms.max(0) as u64);
        let mut batch_no = 0usize;

        while let Some(batch) = source.next_batch(batch_size).await? {
            if cancel.is_cancelled() {
                return Err(LifeQueryError::Cancelled);
            }
            batch_no += 1;
            sink.send(Stage::Fetch, format!("batch {}: {} messages", batch_no, batch.len()))
                .await;

            let (inserted, duplicates) = self.persist_batch(&batch)?;
            counters.messages_added += inserted;
            counters.duplicates_skipped += duplicates;
            sink.send(
                Stage::Persist,
                format!("batch {}: {} new, {} duplicate", batch_no, inserted, duplicates),
            )
            .await;

            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LifeQueryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        Ok(())
    }

    /// Persist one batch inside a single transaction
    fn persist_batch(&self, batch: &[IncomingMessage]) -> Result<(i64, i64)> {
        self.storage.with_transaction(|conn| {
            let mut inserted = 0;
            let mut duplicates = 0;
            let mut touched: HashSet<String> = HashSet::new();

            for incoming in batch {
                queries::upsert_chat(
                    conn,
                    &incoming.chat_id,
                    incoming.chat_title.as_deref(),
                    incoming.chat_type,
                )?;
                touched.insert(incoming.chat_id.clone());

                match queries::insert_message(conn, &incoming.clone().into_message())? {
                    InsertOutcome::Inserted => inserted += 1,
                    InsertOutcome::Duplicate => duplicates += 1,
                }
            }

            for chat_id in &touched {
                queries::refresh_chat_message_count(conn, chat_id)?;
            }

            Ok((inserted, duplicates))
        })
    }

    async fn chunk_new_messages(
        &self,
        settings: &Settings,
        cancel: &CancellationToken,
        sink: &ProgressSink<'_>,
        counters: &mut OperationCounters,
    ) -> Result<()> {
        let chat_ids = self
            .storage
            .with_connection(|conn| queries::chats_with_new_messages(conn))?;

        let config = ChunkerConfig::from_settings(settings);
        for chat_id in chat_ids {
            if cancel.is_cancelled() {
                return Err(LifeQueryError::Cancelled);
            }
            let added = self.chunk_chat(&chat_id, &config, counters)?;
            if added > 0 {
                sink.send(Stage::Chunk, format!("{}: {} new chunks", chat_id, added))
                    .await;
            }
            // Chunking is pure CPU; yield between chats so a large backlog
            // does not starve the runtime.
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Chunk one chat's unprocessed tail.
    ///
    /// When new messages continue the previous window (gap below the break
    /// threshold), the window's last chunk is re-chunked together with the
    /// new messages and replaced, never extended in place. If re-chunking
    /// reproduces the old chunk exactly it is kept as is.
    fn chunk_chat(
        &self,
        chat_id: &str,
        config: &ChunkerConfig,
        counters: &mut OperationCounters,
    ) -> Result<i64> {
        let chat = self
            .storage
            .with_connection(|conn| queries::get_chat(conn, chat_id))?;
        let chat_name = chat
            .as_ref()
            .map(|c| {
                if c.title.is_empty() {
                    c.chat_id.clone()
                } else {
                    c.title.clone()
                }
            })
            .unwrap_or_else(|| chat_id.to_string());

        let (messages, mut replace, mut known) = self.storage.with_connection(|conn| {
            let last = queries::last_chunk(conn, chat_id)?;
            let last_end = last.as_ref().map(|c| c.end_ts);
            let new_messages = queries::list_messages(conn, chat_id, last_end)?;
            if new_messages.is_empty() {
                return Ok((Vec::new(), None, HashSet::new()));
            }

            let known = queries::known_hashes(conn, chat_id)?;

            // Window continuity: pull the last chunk's own messages back in
            // when the silence before the first new message is short enough
            // that the window may continue.
            let (messages, replace) = match last {
                Some(lc) if new_messages[0].ts - lc.end_ts < GAP_BREAK_SECS => {
                    let mut tail =
                        queries::list_messages_between(conn, chat_id, lc.start_ts, lc.end_ts)?;
                    tail.extend(new_messages);
                    (tail, Some(lc))
                }
                _ => (new_messages, None),
            };
            Ok((messages, replace, known))
        })?;

        if messages.is_empty() {
            return Ok(0);
        }

        if let Some(lc) = &replace {
            known.remove(&lc.content_hash);
        }

        let chunker = Chunker::new(config.clone(), chat_id, chat_name);
        let mut batch = chunker.chunk_messages(&messages, &mut known);
        counters.noise_dropped += batch.noise_dropped;

        // Re-chunking may reproduce the old chunk verbatim (e.g. the new
        // messages landed past a join gap); keep it instead of churning.
        if let Some(lc) = &replace {
            if batch
                .chunks
                .first()
                .map(|c| c.content_hash == lc.content_hash)
                .unwrap_or(false)
            {
                batch.chunks.remove(0);
                replace = None;
            }
        }

        let evicted = self.storage.with_transaction(|conn| {
            let mut evicted = Vec::new();
            if let Some(lc) = &replace {
                queries::delete_chunk(conn, &lc.chunk_id)?;
                if lc.embedded {
                    evicted.push(lc.chunk_id.clone());
                }
            }
            for chunk in &batch.chunks {
                if queries::insert_chunk(conn, chunk)? == InsertOutcome::Inserted {
                    counters.chunks_added += 1;
                }
            }
            Ok(evicted)
        })?;

        if !evicted.is_empty() {
            self.vectors.delete(&evicted)?;
        }

        Ok(batch.chunks.len() as i64)
    }

    async fn embed_pending(
        &self,
        cancel: &CancellationToken,
        sink: &ProgressSink<'_>,
        counters: &mut OperationCounters,
    ) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(LifeQueryError::Cancelled);
            }

            let pending = self
                .storage
                .with_connection(|conn| queries::list_pending_chunks(conn, Some(EMBED_BATCH_SIZE)))?;
            if pending.is_empty() {
                return Ok(());
            }

            let texts: Vec<String> = pending.iter().map(|c| c.text.clone()).collect();
            let embedder = self.embedder.clone();
            let vectors =
                with_retries(cancel, || async { embedder.embed(&texts).await }).await?;

            if vectors.len() != pending.len() {
                return Err(LifeQueryError::Invariant(format!(
                    "embedder returned {} vectors for {} chunks",
                    vectors.len(),
                    pending.len()
                )));
            }

            let records: Vec<VectorRecord> = pending
                .iter()
                .zip(vectors)
                .map(|(chunk, embedding)| VectorRecord::from_chunk(chunk, embedding))
                .collect();

            // Vectors land first; the embedded flag only flips afterwards,
            // so a crash in between leaves chunks pending and the upsert
            // makes the re-run harmless.
            self.vectors.upsert(LIVE_COLLECTION, &records)?;

            let chunk_ids: Vec<String> = pending.iter().map(|c| c.chunk_id.clone()).collect();
            self.storage
                .with_transaction(|conn| queries::mark_embedded(conn, &chunk_ids))?;

            counters.chunks_embedded += pending.len() as i64;
            sink.send(
                Stage::Embed,
                format!("embedded {} chunks ({} total)", pending.len(), counters.chunks_embedded),
            )
            .await;
        }
    }
}
