//! Full reindex: re-embed every chunk into a fresh collection and swap
//!
//! The durable store's chunk rows are left untouched (apart from the
//! `embedded` flags of chunks that had never been embedded before). The
//! live collection stays queryable for the whole run; the swap at the end
//! is atomic, so a concurrent retrieval sees the old vectors or the new
//! ones and never an empty store.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{with_retries, PipelineReport, EMBED_BATCH_SIZE};
use crate::embedding::Embedder;
use crate::error::{LifeQueryError, Result};
use crate::storage::{queries, Storage};
use crate::types::{OperationCounters, ProgressEvent, Stage, VectorRecord};
use crate::vector::{VectorStore, TEMP_COLLECTION};

pub async fn run_reindex(
    storage: &Storage,
    vectors: &VectorStore,
    embedder: Arc<dyn Embedder>,
    cancel: &CancellationToken,
    progress: &mpsc::Sender<ProgressEvent>,
) -> PipelineReport {
    let mut counters = OperationCounters::default();

    match reindex_inner(storage, vectors, embedder, cancel, progress, &mut counters).await {
        Ok(()) => PipelineReport {
            counters,
            status: crate::types::OperationStatus::Success,
            detail: None,
        },
        Err(LifeQueryError::Cancelled) => {
            if let Err(e) = vectors.drop_collection(TEMP_COLLECTION) {
                warn!("failed to drop temp collection after cancel: {}", e);
            }
            PipelineReport {
                counters,
                status: crate::types::OperationStatus::Cancelled,
                detail: None,
            }
        }
        Err(e) => {
            if let Err(drop_err) = vectors.drop_collection(TEMP_COLLECTION) {
                warn!("failed to drop temp collection after error: {}", drop_err);
            }
            PipelineReport {
                counters,
                status: crate::types::OperationStatus::Error,
                detail: Some(e.to_string()),
            }
        }
    }
}

async fn reindex_inner(
    storage: &Storage,
    vectors: &VectorStore,
    embedder: Arc<dyn Embedder>,
    cancel: &CancellationToken,
    progress: &mpsc::Sender<ProgressEvent>,
    counters: &mut OperationCounters,
) -> Result<()> {
    vectors.create_temp()?;

    let mut offset = 0usize;
    let mut newly_embedded: Vec<String> = Vec::new();

    loop {
        if cancel.is_cancelled() {
            return Err(LifeQueryError::Cancelled);
        }

        let chunks =
            storage.with_connection(|conn| queries::list_chunks(conn, offset, EMBED_BATCH_SIZE))?;
        if chunks.is_empty() {
            break;
        }
        offset += chunks.len();

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let batch_embedder = embedder.clone();
        let embeddings =
            with_retries(cancel, || async { batch_embedder.embed(&texts).await }).await?;

        if embeddings.len() != chunks.len() {
            return Err(LifeQueryError::Invariant(format!(
                "embedder returned {} vectors for {} chunks",
                embeddings.len(),
                chunks.len()
            )));
        }

        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| VectorRecord::from_chunk(chunk, embedding))
            .collect();
        vectors.upsert(TEMP_COLLECTION, &records)?;

        for chunk in &chunks {
            if !chunk.embedded {
                newly_embedded.push(chunk.chunk_id.clone());
            }
        }

        counters.chunks_embedded += chunks.len() as i64;
        let _ = progress
            .send(ProgressEvent::progress(
                Stage::Embed,
                format!("re-embedded {} chunks", counters.chunks_embedded),
            ))
            .await;
    }

    let _ = progress
        .send(ProgressEvent::progress(Stage::Swap, "promoting new collection"))
        .await;
    vectors.swap_from_temp()?;

    // Chunks that had never been embedded are covered by the new
    // collection now; flip their flags to keep the invariant.
    if !newly_embedded.is_empty() {
        storage.with_transaction(|conn| queries::mark_embedded(conn, &newly_embedded))?;
    }

    info!("reindex complete: {} chunks", counters.chunks_embedded);
    Ok(())
}
