//! Embedding providers and the process-wide embedder singleton.
//!
//! Defines the [`EmbeddingProvider`] trait and two implementations:
//!
//! - **[`HashedProvider`]** — deterministic token-hash vectors. Not
//!   semantic, but stable across processes and machines; used for offline
//!   operation and the test suite.
//! - **[`OpenAIProvider`]** — calls the OpenAI embeddings API with
//!   batching, retry, and exponential backoff.
//!
//! # The singleton
//!
//! Provider construction is the dominant cold-start cost and every loaded
//! index needs the same model available at query time. [`shared`] hands out
//! one [`Embedder`] per process: concurrent first-callers block on a single
//! initialization, later callers get the same handle. Fanning a query over
//! thirty shards therefore pays the model cost once, not thirty times.
//!
//! # Retry Strategy
//!
//! The OpenAI provider retries transient failures with exponential backoff:
//! HTTP 429 and 5xx retry, other 4xx fail immediately, network errors
//! retry. Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};

use crate::config::EmbeddingConfig;

/// An embedding backend: a pure function from text batches to vectors of
/// a fixed dimension.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier recorded in build manifests (e.g.
    /// `"text-embedding-3-small"`, `"hashed-384"`).
    fn model_name(&self) -> &str;

    /// Embedding dimensionality; constant for the provider's lifetime.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Shared embedder: one provider plus batching and query memoization.
pub struct Embedder {
    provider: Box<dyn EmbeddingProvider>,
    batch_size: usize,
    query_cache: RwLock<HashMap<String, Vec<f32>>>,
}

impl Embedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let provider: Box<dyn EmbeddingProvider> = match config.provider.as_str() {
            "hashed" => Box::new(HashedProvider::new(config.dims.unwrap_or(384))),
            "openai" => Box::new(OpenAIProvider::new(config)?),
            other => bail!("Unknown embedding provider: {}", other),
        };

        Ok(Self {
            provider,
            batch_size: config.batch_size.max(1),
            query_cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn dims(&self) -> usize {
        self.provider.dims()
    }

    /// Embed a batch of chunk texts, splitting into provider-sized batches.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let mut embedded = self.provider.embed(batch).await?;
            if embedded.len() != batch.len() {
                bail!(
                    "Provider returned {} vectors for {} inputs",
                    embedded.len(),
                    batch.len()
                );
            }
            vectors.append(&mut embedded);
        }
        Ok(vectors)
    }

    /// Embed a single query text, memoizing repeats. Questions recur across
    /// shards of the same fan-out call, so this makes per-shard embedding
    /// effectively free after the first shard.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.query_cache.read().await.get(text) {
            return Ok(cached.clone());
        }

        let vectors = self.provider.embed(&[text.to_string()]).await?;
        let vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;

        self.query_cache
            .write()
            .await
            .insert(text.to_string(), vector.clone());
        Ok(vector)
    }
}

static SHARED: OnceCell<Arc<Embedder>> = OnceCell::const_new();

/// Get the process-wide embedder, constructing it on first call. Concurrent
/// first-callers block on a single initialization; exactly one provider is
/// ever built. The handle lives for the process lifetime — the service is a
/// long-lived daemon and tearing the model down mid-life is never useful.
pub async fn shared(config: &EmbeddingConfig) -> Result<Arc<Embedder>> {
    let embedder = SHARED
        .get_or_try_init(|| async {
            tracing::info!(provider = %config.provider, "Initializing embedding model");
            Embedder::new(config).map(Arc::new)
        })
        .await?;
    Ok(embedder.clone())
}

// ============ Hashed Provider ============

/// Deterministic token-hash embeddings. Each lowercase whitespace token is
/// hashed into a bucket and the bucket counts are L2-normalized. The
/// digest-based bucket choice keeps vectors identical across processes and
/// machines, which the content-addressed store depends on.
pub struct HashedProvider {
    dims: usize,
    name: String,
}

impl HashedProvider {
    pub fn new(dims: usize) -> Self {
        let dims = dims.max(1);
        Self {
            name: format!("hashed-{}", dims),
            dims,
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in text.to_lowercase().split_whitespace() {
            let digest = Sha256::digest(token.as_bytes());
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(raw) % self.dims as u64) as usize;
            vector[bucket] += 1.0;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashedProvider {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ OpenAI Provider ============

/// Embedding provider backed by `POST /v1/embeddings`. Requires the
/// `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
    client: reqwest::Client,
    api_key: String,
    max_retries: u32,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            model,
            dims,
            client,
            api_key,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_embeddings_response(&json);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing data array"))?;

    let mut embeddings = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid embeddings response: missing embedding"))?;
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        embeddings.push(vec);
    }

    Ok(embeddings)
}
