//! Parallel multi-shard query engine.
//!
//! Fans one question out over N per-fingerprint indices with bounded
//! concurrency, isolates per-shard failures, and aggregates the surviving
//! passages. Shards share the process heap: one embedding model, one
//! cache. Fanning over thirty shards therefore costs roughly one shard
//! plus one model load — the whole point of keeping workers in-process
//! instead of one process per shard, which would pay the model load N
//! times over.
//!
//! Each shard gets an independent deadline; an expired or failed shard is
//! reported and excluded without cancelling its siblings. The call as a
//! whole succeeds while at least one shard survives. Dropping the future
//! aborts all outstanding shard tasks.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::aggregate::{self, AggregatedPassage, ShardPassage};
use crate::cache::IndexCache;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::fingerprint;
use crate::models::Passage;
use crate::store;

/// Hard cap on questions per multi-query invocation.
pub const MAX_QUERIES_PER_CALL: usize = 3;

#[derive(Debug, Clone)]
pub struct FanoutOptions {
    pub top_k_per_shard: usize,
    pub max_workers: usize,
    pub shard_timeout: Duration,
}

impl Default for FanoutOptions {
    fn default() -> Self {
        Self {
            top_k_per_shard: 3,
            max_workers: 4,
            shard_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-shard status in a fan-out response.
#[derive(Debug, Clone, Serialize)]
pub struct ShardOutcome {
    /// Fingerprint (or path label for external sources).
    pub shard: String,
    /// Display name resolved from the shard's manifest.
    pub name: String,
    pub elapsed_secs: f64,
    /// Passages returned; empty on failure.
    #[serde(skip)]
    pub passages: Vec<Passage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl ShardOutcome {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of fanning one question over a set of shards.
#[derive(Debug)]
pub struct QueryRun {
    pub question: String,
    pub passages: Vec<AggregatedPassage>,
    pub shards: Vec<ShardOutcome>,
    /// Passage count before deduplication.
    pub before_dedup: usize,
    pub elapsed_secs: f64,
}

impl QueryRun {
    pub fn successful_shards(&self) -> usize {
        self.shards.iter().filter(|s| s.success()).count()
    }

    pub fn failed_shards(&self) -> Vec<&ShardOutcome> {
        self.shards.iter().filter(|s| !s.success()).collect()
    }

    pub fn duplicates_removed(&self) -> usize {
        self.before_dedup - self.passages.len()
    }
}

/// A shard to query: label plus on-disk location.
#[derive(Debug, Clone)]
pub struct ShardRef {
    pub label: String,
    pub dir: PathBuf,
}

/// Resolve fingerprints to their per-file index directories under the
/// store root. Unknown or ill-formed fingerprints fail up front.
pub fn resolve_hashes(store_root: &Path, hashes: &[String]) -> Result<Vec<ShardRef>> {
    let mut shards = Vec::with_capacity(hashes.len());
    for hash in hashes {
        if !fingerprint::is_fingerprint(hash) {
            return Err(Error::SourceUnavailable {
                path: store_root.join(hash),
                reason: "not a valid fingerprint".to_string(),
            });
        }
        let dir = store::shard_dir(store_root, hash);
        if !dir.is_dir() {
            return Err(Error::SourceUnavailable {
                path: dir,
                reason: "no index directory for fingerprint".to_string(),
            });
        }
        shards.push(ShardRef {
            label: hash.clone(),
            dir,
        });
    }
    Ok(shards)
}

/// Every per-file index directory under the store root, sorted by
/// fingerprint. Used when a query does not narrow the shard set.
pub fn all_shards(store_root: &Path) -> Result<Vec<ShardRef>> {
    let entries = std::fs::read_dir(store_root).map_err(|e| Error::SourceUnavailable {
        path: store_root.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut shards = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() && fingerprint::is_fingerprint(&name) && store::index_dir_is_complete(&path)
        {
            shards.push(ShardRef {
                label: name,
                dir: path,
            });
        }
    }
    shards.sort_by(|a, b| a.label.cmp(&b.label));
    Ok(shards)
}

/// Fan one question out over `shards`.
///
/// Fails only when embedding the question fails or every shard fails; any
/// other combination returns the surviving shards' aggregated passages
/// with the failure set enumerated.
pub async fn fan_out(
    cache: Arc<IndexCache>,
    embedder: Arc<Embedder>,
    shards: Vec<ShardRef>,
    question: &str,
    options: &FanoutOptions,
) -> Result<QueryRun> {
    let start = Instant::now();

    let query_vec = embedder
        .embed_query(question)
        .await
        .map_err(|e| Error::EmbeddingFailure(e.to_string()))?;
    let query_vec = Arc::new(query_vec);

    let semaphore = Arc::new(Semaphore::new(options.max_workers.max(1)));
    let mut tasks: JoinSet<ShardOutcome> = JoinSet::new();

    for shard in shards {
        let cache = cache.clone();
        let embedder = embedder.clone();
        let query_vec = query_vec.clone();
        let semaphore = semaphore.clone();
        let timeout = options.shard_timeout;
        let k = options.top_k_per_shard;

        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("fanout semaphore closed");
            let shard_start = Instant::now();

            let result =
                tokio::time::timeout(timeout, query_shard(&cache, &embedder, &shard, &query_vec, k))
                    .await;

            let elapsed_secs = shard_start.elapsed().as_secs_f64();
            let name = store::display_name(&shard.dir);

            match result {
                Ok(Ok(passages)) => ShardOutcome {
                    shard: shard.label,
                    name,
                    elapsed_secs,
                    passages,
                    error: None,
                    error_kind: None,
                },
                Ok(Err(e)) => {
                    let err = Error::ShardFailure {
                        fingerprint: shard.label.clone(),
                        reason: e.to_string(),
                    };
                    tracing::warn!("{}", err);
                    ShardOutcome {
                        shard: shard.label,
                        name,
                        elapsed_secs,
                        passages: Vec::new(),
                        error: Some(e.to_string()),
                        error_kind: Some(e.kind().to_string()),
                    }
                }
                Err(_) => {
                    let err = Error::ShardTimeout {
                        fingerprint: shard.label.clone(),
                        secs: timeout.as_secs(),
                    };
                    tracing::warn!("{}", err);
                    ShardOutcome {
                        shard: shard.label,
                        name,
                        elapsed_secs,
                        passages: Vec::new(),
                        error: Some(err.to_string()),
                        error_kind: Some(err.kind().to_string()),
                    }
                }
            }
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => tracing::error!("Shard task panicked: {}", e),
        }
    }
    outcomes.sort_by(|a, b| a.shard.cmp(&b.shard));

    if !outcomes.is_empty() && outcomes.iter().all(|o| !o.success()) {
        return Err(Error::AllShardsFailed {
            causes: outcomes
                .into_iter()
                .map(|o| (o.shard, o.error.unwrap_or_default()))
                .collect(),
        });
    }

    let shard_passages: Vec<ShardPassage> = outcomes
        .iter()
        .filter(|o| o.success())
        .flat_map(|o| {
            o.passages.iter().cloned().map(|passage| ShardPassage {
                fingerprint: o.shard.clone(),
                shard_name: o.name.clone(),
                passage,
            })
        })
        .collect();
    let before_dedup = shard_passages.len();
    let passages = aggregate::aggregate(shard_passages);

    Ok(QueryRun {
        question: question.to_string(),
        passages,
        shards: outcomes,
        before_dedup,
        elapsed_secs: start.elapsed().as_secs_f64(),
    })
}

/// One shard's work: obtain the handle (possibly loading it), verify it
/// matches the process embedding model, and search.
async fn query_shard(
    cache: &IndexCache,
    embedder: &Embedder,
    shard: &ShardRef,
    query_vec: &Arc<Vec<f32>>,
    k: usize,
) -> Result<Vec<Passage>> {
    let loaded = cache.get_or_load(&shard.dir).await?;

    if loaded.embedding_model != embedder.model_name() {
        return Err(Error::StaleCache {
            path: shard.dir.clone(),
            detail: format!(
                "index built with embedding model '{}', process uses '{}'; rebuild required",
                loaded.embedding_model,
                embedder.model_name()
            ),
        });
    }

    let handle = loaded.handle;
    let query_vec = query_vec.clone();
    let passages = tokio::task::spawn_blocking(move || handle.search(&query_vec, k))
        .await
        .map_err(|e| Error::ShardFailure {
            fingerprint: shard.label.clone(),
            reason: format!("search task failed: {}", e),
        })?;
    Ok(passages)
}

// ============ Multi-query invocation ============

/// In-process API for batched fan-out calls: up to
/// [`MAX_QUERIES_PER_CALL`] questions over a shard set selected by
/// fingerprint, by external collection path, or (neither given) every
/// shard under the store root.
#[derive(Debug, Clone, Default)]
pub struct MultiQueryRequest {
    pub queries: Vec<String>,
    /// Restrict to these per-file indices under the store root.
    pub source_hashes: Option<Vec<String>>,
    /// Additional collection roots outside the store.
    pub external_sources: Vec<PathBuf>,
    pub options: FanoutOptions,
}

/// Aggregate statistics over a multi-query call.
#[derive(Debug, Serialize)]
pub struct MultiQueryStats {
    pub shards_total: usize,
    pub shards_successful: usize,
    pub shards_failed: usize,
    pub total_secs: f64,
}

#[derive(Debug)]
pub struct MultiQueryResponse {
    pub runs: Vec<QueryRun>,
    pub stats: MultiQueryStats,
}

/// Run each question of the request over the resolved shard set. Questions
/// run sequentially; shards within a question run in parallel. The shared
/// cache and embedder mean only the first question's first cold shard pays
/// a load.
pub async fn run_multi(
    cache: Arc<IndexCache>,
    embedder: Arc<Embedder>,
    store_root: &Path,
    request: MultiQueryRequest,
) -> anyhow::Result<MultiQueryResponse> {
    if request.queries.is_empty() {
        anyhow::bail!("at least one query required");
    }
    if request.queries.len() > MAX_QUERIES_PER_CALL {
        anyhow::bail!(
            "at most {} queries per call, got {}",
            MAX_QUERIES_PER_CALL,
            request.queries.len()
        );
    }

    let mut shards = match &request.source_hashes {
        Some(hashes) => resolve_hashes(store_root, hashes)?,
        None if request.external_sources.is_empty() => all_shards(store_root)?,
        None => Vec::new(),
    };
    for path in &request.external_sources {
        shards.push(ShardRef {
            label: path.display().to_string(),
            dir: path.clone(),
        });
    }

    if shards.is_empty() {
        anyhow::bail!("no shards to query under {}", store_root.display());
    }

    let start = Instant::now();
    let mut runs = Vec::with_capacity(request.queries.len());
    for question in &request.queries {
        let run = fan_out(
            cache.clone(),
            embedder.clone(),
            shards.clone(),
            question,
            &request.options,
        )
        .await?;
        runs.push(run);
    }

    let shards_successful = runs
        .iter()
        .map(|r| r.successful_shards())
        .min()
        .unwrap_or(0);
    let shards_failed = shards.len() - shards_successful;
    let stats = MultiQueryStats {
        shards_total: shards.len(),
        shards_successful,
        shards_failed,
        total_secs: start.elapsed().as_secs_f64(),
    };

    Ok(MultiQueryResponse { runs, stats })
}
