//! End-to-end pipeline scenarios
//!
//! Exercises ingest → chunk → embed → retrieve against in-memory stores
//! with a deterministic fake embedder; no network anywhere.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lifequery::embedding::Embedder;
use lifequery::error::{LifeQueryError, Result};
use lifequery::ingest::{IngestPipeline, MessageSource, VecSource};
use lifequery::ingest::reindex::run_reindex;
use lifequery::retrieval::RetrievalEngine;
use lifequery::storage::{queries, Settings, Storage};
use lifequery::types::{
    ChatType, IncomingMessage, OperationStatus, ProgressEvent,
};
use lifequery::vector::{VectorStore, LIVE_COLLECTION};

/// Deterministic embedder: 8-dim vector derived from a SHA-256 of the text
struct FakeEmbedder;

fn fake_vector(text: &str) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    let mut v: Vec<f32> = digest[..8].iter().map(|b| *b as f32 / 255.0 + 0.01).collect();
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter_mut().for_each(|x| *x /= norm);
    v
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| fake_vector(t)).collect())
    }

    fn dimensions(&self) -> Option<usize> {
        Some(8)
    }
}

/// Embedder that always fails upstream
struct BrokenEmbedder;

#[async_trait]
impl Embedder for BrokenEmbedder {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(LifeQueryError::Upstream("embedding endpoint returned 500".into()))
    }

    fn dimensions(&self) -> Option<usize> {
        None
    }
}

/// Source that cancels the operation after yielding N batches
struct CancellingSource {
    inner: VecSource,
    cancel: CancellationToken,
    batches_before_cancel: usize,
    yielded: AtomicUsize,
}

#[async_trait]
impl MessageSource for CancellingSource {
    async fn next_batch(&mut self, batch_size: usize) -> Result<Option<Vec<IncomingMessage>>> {
        let batch = self.inner.next_batch(batch_size).await?;
        let yielded = self.yielded.fetch_add(1, Ordering::SeqCst) + 1;
        if yielded >= self.batches_before_cancel {
            self.cancel.cancel();
        }
        Ok(batch)
    }
}

fn msg(chat_id: &str, message_id: i64, ts: i64, text: &str) -> IncomingMessage {
    IncomingMessage {
        chat_id: chat_id.to_string(),
        message_id,
        ts,
        sender: Some(if message_id % 2 == 0 { "bob" } else { "alice" }.to_string()),
        text: text.to_string(),
        chat_title: Some(format!("Chat {}", chat_id.to_uppercase())),
        chat_type: Some(ChatType::OneToOne),
    }
}

struct Harness {
    storage: Storage,
    vectors: VectorStore,
    embedder: Arc<dyn Embedder>,
    pipeline: IngestPipeline,
    settings: Settings,
}

fn harness_with(embedder: Arc<dyn Embedder>) -> Harness {
    let storage = Storage::open_in_memory().unwrap();
    let vectors = VectorStore::open_in_memory().unwrap();
    let pipeline = IngestPipeline::new(storage.clone(), vectors.clone(), embedder.clone());
    let settings = storage.with_connection(Settings::load).unwrap();
    Harness {
        storage,
        vectors,
        embedder,
        pipeline,
        settings,
    }
}

fn harness() -> Harness {
    harness_with(Arc::new(FakeEmbedder))
}

async fn run_ingest(h: &Harness, messages: Vec<IncomingMessage>) -> lifequery::ingest::PipelineReport {
    let mut source = VecSource::new(messages);
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(100);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
    let report = h.pipeline.run(&mut source, &h.settings, &cancel, &tx).await;
    drop(tx);
    let _ = drain.await;
    report
}

#[tokio::test]
async fn clean_ingest_produces_chunk_and_vector() {
    let h = harness();
    let report = run_ingest(
        &h,
        vec![msg("a", 1, 0, "hi"), msg("a", 2, 60, "how are you")],
    )
    .await;

    assert_eq!(report.status, OperationStatus::Success);
    assert_eq!(report.counters.messages_added, 2);
    assert_eq!(report.counters.chunks_added, 1);
    assert_eq!(report.counters.chunks_embedded, 1);

    let stats = h.storage.with_connection(|c| queries::stats(c)).unwrap();
    assert_eq!(stats.message_count, 2);
    assert_eq!(stats.chunk_count, 1);
    assert_eq!(stats.embedded_count, 1);
    assert_eq!(h.vectors.count(LIVE_COLLECTION).unwrap(), 1);
}

#[tokio::test]
async fn gap_break_splits_into_two_chunks() {
    let h = harness();
    run_ingest(&h, vec![msg("a", 1, 0, "hi"), msg("a", 2, 5 * 3600, "back again")]).await;

    let chunks = h
        .storage
        .with_connection(|c| queries::list_chunks(c, 0, 100))
        .unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].start_ts, 0);
    assert_eq!(chunks[1].start_ts, 5 * 3600);
}

#[tokio::test]
async fn double_sync_is_idempotent() {
    let h = harness();
    let messages = vec![msg("a", 1, 0, "hi"), msg("a", 2, 60, "how are you")];

    let first = run_ingest(&h, messages.clone()).await;
    assert_eq!(first.counters.messages_added, 2);
    assert_eq!(first.counters.chunks_added, 1);

    let second = run_ingest(&h, messages).await;
    assert_eq!(second.status, OperationStatus::Success);
    assert_eq!(second.counters.messages_added, 0);
    assert_eq!(second.counters.duplicates_skipped, 2);
    assert_eq!(second.counters.chunks_added, 0);

    let stats = h.storage.with_connection(|c| queries::stats(c)).unwrap();
    assert_eq!(stats.chunk_count, 1);
    assert_eq!(h.vectors.count(LIVE_COLLECTION).unwrap(), 1);
}

#[tokio::test]
async fn inclusion_mask_filters_retrieval() {
    let h = harness();
    run_ingest(
        &h,
        vec![
            msg("a", 1, 0, "the alpine hiking trip photos"),
            msg("b", 1, 0, "the alpine hiking trip pictures"),
        ],
    )
    .await;

    h.storage
        .with_connection(|c| queries::set_included(c, "b", false))
        .unwrap();

    let retrieval = RetrievalEngine::new(h.storage.clone(), h.vectors.clone(), h.embedder.clone());
    let result = retrieval.retrieve("alpine hiking trip", &h.settings).await;

    assert!(!result.citations.is_empty());
    assert!(result.citations.iter().all(|c| c.chat_id == "a"));
}

#[tokio::test]
async fn excluding_every_chat_yields_empty_context() {
    let h = harness();
    run_ingest(&h, vec![msg("a", 1, 0, "hello world")]).await;
    h.storage
        .with_connection(|c| queries::set_included(c, "a", false))
        .unwrap();

    let retrieval = RetrievalEngine::new(h.storage.clone(), h.vectors.clone(), h.embedder.clone());
    let result = retrieval.retrieve("hello", &h.settings).await;
    assert!(result.is_empty());
    assert!(result.context_text.is_empty());
}

#[tokio::test]
async fn delete_chat_and_reimport_restores_hashes() {
    let h = harness();
    let messages = vec![msg("a", 1, 0, "hi"), msg("a", 2, 60, "how are you")];
    run_ingest(&h, messages.clone()).await;

    let before: HashSet<String> = h
        .storage
        .with_connection(|c| queries::known_hashes(c, "a"))
        .unwrap();
    assert_eq!(before.len(), 1);

    let deleted = h
        .storage
        .with_transaction(|c| queries::delete_chat(c, "a"))
        .unwrap();
    assert_eq!(deleted.messages_deleted, 2);
    h.vectors.delete(&deleted.chunk_ids).unwrap();
    assert_eq!(h.vectors.count(LIVE_COLLECTION).unwrap(), 0);

    run_ingest(&h, messages).await;
    let after: HashSet<String> = h
        .storage
        .with_connection(|c| queries::known_hashes(c, "a"))
        .unwrap();
    assert_eq!(before, after);
    assert_eq!(h.vectors.count(LIVE_COLLECTION).unwrap(), 1);
}

#[tokio::test]
async fn cancellation_preserves_committed_batches() {
    let mut h = harness();
    h.settings.sync_batch_size = 10;

    let messages: Vec<IncomingMessage> = (0..100)
        .map(|i| msg("a", i, i * 30, &format!("message number {}", i)))
        .collect();

    let cancel = CancellationToken::new();
    let mut source = CancellingSource {
        inner: VecSource::new(messages),
        cancel: cancel.clone(),
        batches_before_cancel: 2,
        yielded: AtomicUsize::new(0),
    };

    let (tx, mut rx) = mpsc::channel(100);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
    let report = h.pipeline.run(&mut source, &h.settings, &cancel, &tx).await;
    drop(tx);
    let _ = drain.await;

    assert_eq!(report.status, OperationStatus::Cancelled);
    // The first batch committed before the cancel; the in-flight second
    // batch was discarded, nothing was rolled back.
    assert_eq!(report.counters.messages_added, 10);

    let stats = h.storage.with_connection(|c| queries::stats(c)).unwrap();
    assert_eq!(stats.message_count, 10);
}

#[tokio::test]
async fn failed_embed_leaves_chunks_pending_and_is_resumable() {
    let h = harness_with(Arc::new(BrokenEmbedder));
    let report = run_ingest(&h, vec![msg("a", 1, 0, "hi"), msg("a", 2, 60, "there")]).await;

    assert_eq!(report.status, OperationStatus::Error);
    assert_eq!(report.counters.chunks_added, 1);
    assert_eq!(report.counters.chunks_embedded, 0);

    let pending = h
        .storage
        .with_connection(|c| queries::list_pending_chunks(c, None))
        .unwrap();
    assert_eq!(pending.len(), 1);

    // Same stores, working embedder: process picks the pending chunk up
    let pipeline = IngestPipeline::new(h.storage.clone(), h.vectors.clone(), Arc::new(FakeEmbedder));
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(100);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
    let report = pipeline.run_process(&h.settings, &cancel, &tx).await;
    drop(tx);
    let _ = drain.await;

    assert_eq!(report.status, OperationStatus::Success);
    assert_eq!(report.counters.chunks_embedded, 1);
    assert_eq!(h.vectors.count(LIVE_COLLECTION).unwrap(), 1);
    let pending = h
        .storage
        .with_connection(|c| queries::list_pending_chunks(c, None))
        .unwrap();
    assert!(pending.is_empty());
}

#[tokio::test]
async fn reindex_rebuilds_live_collection() {
    let h = harness();
    run_ingest(
        &h,
        vec![
            msg("a", 1, 0, "first conversation"),
            msg("b", 1, 10 * 3600, "second conversation"),
        ],
    )
    .await;
    let chunk_count = h
        .storage
        .with_connection(|c| Ok(queries::stats(c)?.chunk_count))
        .unwrap();
    assert_eq!(h.vectors.count(LIVE_COLLECTION).unwrap(), chunk_count);

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(100);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
    let report = run_reindex(&h.storage, &h.vectors, h.embedder.clone(), &cancel, &tx).await;
    drop(tx);
    let _ = drain.await;

    assert_eq!(report.status, OperationStatus::Success);
    assert_eq!(report.counters.chunks_embedded, chunk_count);
    // Exactly one vector per chunk in the promoted collection
    assert_eq!(h.vectors.count(LIVE_COLLECTION).unwrap(), chunk_count);

    let stats = h.storage.with_connection(|c| queries::stats(c)).unwrap();
    assert_eq!(stats.embedded_count, chunk_count);

    // The store remains queryable after the swap
    let retrieval = RetrievalEngine::new(h.storage.clone(), h.vectors.clone(), h.embedder.clone());
    let result = retrieval.retrieve("first conversation", &h.settings).await;
    assert!(!result.citations.is_empty());
}

#[tokio::test]
async fn reindex_covers_chunks_that_were_never_embedded() {
    let h = harness_with(Arc::new(BrokenEmbedder));
    run_ingest(&h, vec![msg("a", 1, 0, "hello there")]).await;
    assert_eq!(h.vectors.count(LIVE_COLLECTION).unwrap(), 0);

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(100);
    let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
    let report = run_reindex(&h.storage, &h.vectors, Arc::new(FakeEmbedder), &cancel, &tx).await;
    drop(tx);
    let _ = drain.await;

    assert_eq!(report.status, OperationStatus::Success);
    assert_eq!(h.vectors.count(LIVE_COLLECTION).unwrap(), 1);
    let stats = h.storage.with_connection(|c| queries::stats(c)).unwrap();
    assert_eq!(stats.embedded_count, 1);
}

#[tokio::test]
async fn progress_events_carry_stages_and_terminal_counts() {
    let h = harness();
    let mut source = VecSource::new(vec![msg("a", 1, 0, "hi"), msg("a", 2, 60, "there")]);
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(100);

    let pipeline = h.pipeline;
    let settings = h.settings;
    let run = tokio::spawn(async move {
        let report = pipeline.run(&mut source, &settings, &cancel, &tx).await;
        let _ = tx.send(report.terminal_event()).await;
    });

    let mut saw_persist = false;
    let mut saw_embed = false;
    let mut terminal = None;
    while let Some(event) = rx.recv().await {
        match &event {
            ProgressEvent::Progress { stage, .. } => {
                let stage = stage.to_string();
                saw_persist |= stage == "persist";
                saw_embed |= stage == "embed";
            }
            other => terminal = Some(serde_json::to_value(other).unwrap()),
        }
    }
    run.await.unwrap();

    assert!(saw_persist);
    assert!(saw_embed);
    let terminal = terminal.expect("terminal event");
    assert_eq!(terminal["type"], "done");
    assert_eq!(terminal["messages_added"], 2);
    assert_eq!(terminal["chunks_embedded"], 1);
}

#[tokio::test]
async fn incremental_sync_extends_open_window_by_replacement() {
    let h = harness();
    run_ingest(&h, vec![msg("a", 1, 0, "hi")]).await;
    let first_hashes: HashSet<String> = h
        .storage
        .with_connection(|c| queries::known_hashes(c, "a"))
        .unwrap();

    // A follow-up inside the window: the old chunk is replaced, not kept
    run_ingest(&h, vec![msg("a", 1, 0, "hi"), msg("a", 2, 60, "and more")]).await;

    let chunks = h
        .storage
        .with_connection(|c| queries::list_chunks(c, 0, 100))
        .unwrap();
    assert_eq!(chunks.len(), 1);
    assert!(!first_hashes.contains(&chunks[0].content_hash));
    assert!(chunks[0].text.contains("and more"));
    assert_eq!(chunks[0].start_ts, 0);
    assert_eq!(chunks[0].end_ts, 60);

    // No orphaned vector for the replaced chunk
    let stats = h.storage.with_connection(|c| queries::stats(c)).unwrap();
    assert_eq!(h.vectors.count(LIVE_COLLECTION).unwrap(), stats.embedded_count);
}
