//! Embedding generation via a remote model endpoint
//!
//! The query path and the ingest path must embed with the same model and
//! normalization; switching models without a full reindex breaks retrieval,
//! so the embedder pins the vector dimension it first observes and treats a
//! later mismatch as an invariant violation.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{classify_http_error, classify_status, LifeQueryError, Result};

/// Per-batch request timeout
const EMBED_TIMEOUT: Duration = Duration::from_secs(30);

/// Trait for embedding generators
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts. The result has one vector per input, all of
    /// the same dimension.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Dimension pinned from the first successful call, if any
    fn dimensions(&self) -> Option<usize>;
}

/// Connection parameters for the remote endpoint
#[derive(Debug, Clone)]
pub struct EmbedderConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// OpenAI-compatible `/embeddings` client.
///
/// The HTTP client is built lazily and survives reconfiguration; `reset`
/// swaps the endpoint parameters and unpins the dimension (a model change
/// is only valid together with a reindex).
pub struct RemoteEmbedder {
    client: reqwest::Client,
    config: RwLock<EmbedderConfig>,
    dimensions: AtomicUsize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

impl RemoteEmbedder {
    pub fn new(config: EmbedderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(EMBED_TIMEOUT)
            .build()
            .map_err(|e| LifeQueryError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            config: RwLock::new(config),
            dimensions: AtomicUsize::new(0),
        })
    }

    /// Replace endpoint parameters and unpin the dimension
    pub fn reset(&self, config: EmbedderConfig) {
        *self.config.write() = config;
        self.dimensions.store(0, Ordering::SeqCst);
    }

    fn check_config(&self) -> Result<EmbedderConfig> {
        let config = self.config.read().clone();
        if config.base_url.is_empty() {
            return Err(LifeQueryError::Config("embedding_base_url is not set".into()));
        }
        if config.model.is_empty() {
            return Err(LifeQueryError::Config("embedding_model is not set".into()));
        }
        Ok(config)
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let config = self.check_config()?;

        let url = format!("{}/embeddings", config.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&serde_json::json!({
            "input": texts,
            "model": config.model,
        }));
        if !config.api_key.is_empty() {
            request = request.bearer_auth(&config.api_key);
        }

        let response = request.send().await.map_err(|e| classify_http_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| LifeQueryError::Upstream(format!("embedding response: {}", e)))?;

        if parsed.data.len() != texts.len() {
            return Err(LifeQueryError::Upstream(format!(
                "embedding count mismatch: sent {}, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|item| item.embedding).collect();

        let dim = vectors.first().map(|v| v.len()).unwrap_or(0);
        if dim == 0 || vectors.iter().any(|v| v.len() != dim) {
            return Err(LifeQueryError::Upstream(
                "embedding response has non-uniform dimensions".into(),
            ));
        }

        match self
            .dimensions
            .compare_exchange(0, dim, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {}
            Err(pinned) if pinned != dim => {
                return Err(LifeQueryError::Invariant(format!(
                    "embedding dimension changed from {} to {}; reindex required",
                    pinned, dim
                )));
            }
            Err(_) => {}
        }

        Ok(vectors)
    }

    fn dimensions(&self) -> Option<usize> {
        match self.dimensions.load(Ordering::SeqCst) {
            0 => None,
            d => Some(d),
        }
    }
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 0.001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 0.001);

        assert_eq!(cosine_similarity(&a, &[]), 0.0);
    }

    #[tokio::test]
    async fn test_missing_config_is_config_error() {
        let embedder = RemoteEmbedder::new(EmbedderConfig {
            base_url: String::new(),
            api_key: String::new(),
            model: "m".into(),
        })
        .unwrap();

        let err = embedder.embed(&["hi".to_string()]).await.unwrap_err();
        assert!(matches!(err, LifeQueryError::Config(_)));
    }

    #[tokio::test]
    async fn test_empty_batch_short_circuits() {
        let embedder = RemoteEmbedder::new(EmbedderConfig {
            base_url: String::new(),
            api_key: String::new(),
            model: String::new(),
        })
        .unwrap();
        assert!(embedder.embed(&[]).await.unwrap().is_empty());
    }

    #[test]
    fn test_reset_unpins_dimension() {
        let embedder = RemoteEmbedder::new(EmbedderConfig {
            base_url: "http://localhost".into(),
            api_key: String::new(),
            model: "m".into(),
        })
        .unwrap();
        embedder.dimensions.store(1536, Ordering::SeqCst);
        assert_eq!(embedder.dimensions(), Some(1536));

        embedder.reset(EmbedderConfig {
            base_url: "http://localhost".into(),
            api_key: String::new(),
            model: "other".into(),
        });
        assert_eq!(embedder.dimensions(), None);
    }
}
