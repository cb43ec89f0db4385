//! HTTP query service.
//!
//! Long-running process that keeps indices resident in memory and answers
//! retrieval queries with sub-second latency once warm. Responses return
//! ranked, source-attributed passages — the `answer` field is a
//! deterministic rendering of the retrieved passages, never generated
//! text.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/` | Service health: status, cached count, resident paths |
//! | `GET` | `/cache/stats` | Per-entry load time and document counts |
//! | `POST` | `/query` | Query a collection's index |
//! | `DELETE` | `/cache/{path}` | Evict one resident entry |
//! | `DELETE` | `/cache` | Evict everything |
//! | `POST` | `/cache/reload` | Rebuild-and-swap a resident entry |
//!
//! # Error Contract
//!
//! Errors are structured JSON: `{ "error": { "code": "...", "message":
//! "..." } }` with machine-readable codes from the domain taxonomy.
//! Queries never block each other once an index is resident; a cold
//! first query blocks only other queries for the same path.

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};

use crate::cache::{CacheStat, IndexCache};
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::Error;
use crate::models::Passage;

const SERVICE_NAME: &str = "shelfdex";

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<IndexCache>,
    pub embedder: Arc<Embedder>,
}

/// Start the query service: bind, warm the preload path in the
/// background, and serve until terminated. A bind failure is fatal and
/// propagates out so the process exits non-zero.
pub async fn run_server(config: Config, cache: Arc<IndexCache>, embedder: Arc<Embedder>) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = AppState {
        config: Arc::new(config),
        cache,
        embedder,
    };

    if let Some(preload) = state.config.store.preload.clone() {
        let cache = state.cache.clone();
        tokio::spawn(async move {
            tracing::info!("Preloading {}", preload.display());
            let started = Instant::now();
            match cache.get_or_load(&preload).await {
                Ok(loaded) => tracing::info!(
                    "Preloaded {} docs in {:.2}s; first query will be warm",
                    loaded.handle.doc_count(),
                    started.elapsed().as_secs_f64()
                ),
                Err(e) => tracing::warn!(
                    "Preload of {} failed ({}); first query will pay the load",
                    preload.display(),
                    e
                ),
            }
        });
    }

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e))?;
    tracing::info!("Query service listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/cache/stats", get(handle_cache_stats))
        .route("/query", post(handle_query))
        .route("/cache/{*path}", delete(handle_evict))
        .route("/cache", delete(handle_evict_all))
        .route("/cache/reload", post(handle_reload))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::SourceUnavailable { .. } => StatusCode::NOT_FOUND,
            Error::StaleCache { .. } => StatusCode::CONFLICT,
            Error::ShardTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            code: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

fn query_timeout(secs: u64) -> AppError {
    AppError {
        status: StatusCode::GATEWAY_TIMEOUT,
        code: "query_timeout".to_string(),
        message: format!("query exceeded {}s deadline", secs),
    }
}

// ============ GET / ============

#[derive(Serialize)]
struct RootResponse {
    service: &'static str,
    status: &'static str,
    cached_count: usize,
    paths: Vec<String>,
}

async fn handle_root(State(state): State<AppState>) -> Json<RootResponse> {
    Json(RootResponse {
        service: SERVICE_NAME,
        status: "running",
        cached_count: state.cache.len(),
        paths: state.cache.resident_paths(),
    })
}

// ============ GET /cache/stats ============

#[derive(Serialize)]
struct StatsResponse {
    total_cached: usize,
    indices: Vec<CacheStat>,
}

async fn handle_cache_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let indices = state.cache.stats();
    Json(StatsResponse {
        total_cached: indices.len(),
        indices,
    })
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    /// Collection (or fingerprint directory) to query. Defaults to the
    /// configured preload path.
    #[serde(default)]
    pdf_directory: Option<String>,
    question: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct SourceEntry {
    content: String,
    metadata: SourceMetadata,
}

#[derive(Serialize)]
struct SourceMetadata {
    source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    page: Option<usize>,
}

#[derive(Serialize)]
struct QueryResponse {
    answer: String,
    sources: Vec<SourceEntry>,
    load_time_seconds: f64,
    retrieval_time_seconds: f64,
    from_cache: bool,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let path = match req.pdf_directory {
        Some(dir) => PathBuf::from(dir),
        None => state
            .config
            .store
            .preload
            .clone()
            .ok_or_else(|| bad_request("pdf_directory required (no preload configured)"))?,
    };
    if !path.exists() {
        return Err(not_found(format!("Directory not found: {}", path.display())));
    }

    let top_k = req.top_k.unwrap_or(state.config.retrieval.top_k).max(1);
    let deadline = Duration::from_secs(state.config.retrieval.query_timeout_secs);

    let outcome = tokio::time::timeout(
        deadline,
        run_query(&state, path, req.question.clone(), top_k),
    )
    .await
    .map_err(|_| query_timeout(state.config.retrieval.query_timeout_secs))??;

    Ok(Json(outcome))
}

async fn run_query(
    state: &AppState,
    path: PathBuf,
    question: String,
    top_k: usize,
) -> Result<QueryResponse, AppError> {
    let loaded = state.cache.get_or_load(&path).await?;

    if loaded.embedding_model != state.embedder.model_name() {
        return Err(Error::StaleCache {
            path,
            detail: format!(
                "index built with embedding model '{}', process uses '{}'; rebuild required",
                loaded.embedding_model,
                state.embedder.model_name()
            ),
        }
        .into());
    }

    let retrieval_start = Instant::now();
    let query_vec = state
        .embedder
        .embed_query(&question)
        .await
        .map_err(|e| AppError::from(Error::EmbeddingFailure(e.to_string())))?;

    let handle = loaded.handle.clone();
    let passages = tokio::task::spawn_blocking(move || handle.search(&query_vec, top_k))
        .await
        .map_err(|e| internal_error(format!("search task failed: {}", e)))?;
    let retrieval_time_seconds = retrieval_start.elapsed().as_secs_f64();

    Ok(QueryResponse {
        answer: render_answer(&passages),
        sources: passages
            .into_iter()
            .map(|p| SourceEntry {
                metadata: SourceMetadata {
                    source: p.source.clone(),
                    page: p.page,
                },
                content: p.text,
            })
            .collect(),
        load_time_seconds: loaded.load_secs,
        retrieval_time_seconds,
        from_cache: loaded.from_cache,
    })
}

/// Deterministic rendering of the top-k passages, best first.
fn render_answer(passages: &[Passage]) -> String {
    passages
        .iter()
        .map(|p| p.render())
        .collect::<Vec<_>>()
        .join("\n---\n")
}

// ============ DELETE /cache/{path} and /cache ============

#[derive(Serialize)]
struct EvictResponse {
    ok: bool,
}

#[derive(Serialize)]
struct EvictAllResponse {
    ok: bool,
    evicted: usize,
}

async fn handle_evict(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
) -> Result<Json<EvictResponse>, AppError> {
    // The wildcard capture may or may not keep its leading slash.
    let path = if path.starts_with('/') {
        path
    } else {
        format!("/{}", path)
    };

    if state.cache.evict(std::path::Path::new(&path)) {
        Ok(Json(EvictResponse { ok: true }))
    } else {
        Err(not_found(format!("Path not in cache: {}", path)))
    }
}

async fn handle_evict_all(State(state): State<AppState>) -> Json<EvictAllResponse> {
    let evicted = state.cache.evict_all();
    Json(EvictAllResponse { ok: true, evicted })
}

// ============ POST /cache/reload ============

#[derive(Deserialize, Default)]
struct ReloadRequest {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Serialize)]
struct ReloadResponse {
    load_time_seconds: f64,
    docs_count: usize,
}

async fn handle_reload(
    State(state): State<AppState>,
    body: Option<Json<ReloadRequest>>,
) -> Result<Json<ReloadResponse>, AppError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let path = match req.path {
        Some(p) => PathBuf::from(p),
        None => state
            .config
            .store
            .preload
            .clone()
            .ok_or_else(|| bad_request("path required (no preload configured)"))?,
    };

    let loaded = state.cache.reload(&path).await?;
    Ok(Json(ReloadResponse {
        load_time_seconds: loaded.load_secs,
        docs_count: loaded.handle.doc_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_renders_passages_with_separator() {
        let passages = vec![
            Passage {
                score: 0.9,
                text: "first passage".to_string(),
                source: "a.pdf".to_string(),
                page: Some(3),
                ordinal: 0,
            },
            Passage {
                score: 0.8,
                text: "second passage".to_string(),
                source: "b.pdf".to_string(),
                page: None,
                ordinal: 1,
            },
        ];

        let answer = render_answer(&passages);
        assert_eq!(
            answer,
            "[a.pdf] Page 3:\nfirst passage\n---\n[b.pdf]:\nsecond passage"
        );
    }

    #[test]
    fn empty_results_render_empty_answer() {
        assert_eq!(render_answer(&[]), "");
    }
}
