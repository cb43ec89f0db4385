use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:1411".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1200
}
fn default_chunk_overlap() -> usize {
    150
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Passages returned by the single-collection query service.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Passages fetched from each shard in a fan-out query.
    #[serde(default = "default_top_k_per_shard")]
    pub top_k_per_shard: usize,
    /// Concurrent shard workers in a fan-out query.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Per-shard deadline; an expired shard is reported failed without
    /// cancelling its siblings.
    #[serde(default = "default_shard_timeout_secs")]
    pub shard_timeout_secs: u64,
    /// Overall deadline for a single service query.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            top_k_per_shard: default_top_k_per_shard(),
            max_workers: default_max_workers(),
            shard_timeout_secs: default_shard_timeout_secs(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

fn default_top_k() -> usize {
    4
}
fn default_top_k_per_shard() -> usize {
    3
}
fn default_max_workers() -> usize {
    4
}
fn default_shard_timeout_secs() -> u64 {
    30
}
fn default_query_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"hashed"` (deterministic, offline) or `"openai"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hashed".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Root directory holding source files and their fingerprint-named
    /// index directories.
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
    /// Collection path warmed into the cache at server startup.
    #[serde(default)]
    pub preload: Option<PathBuf>,
    /// Which files in a collection count as sources.
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
            preload: None,
            include_globs: default_include_globs(),
        }
    }
}

fn default_store_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_include_globs() -> Vec<String> {
    vec!["*.pdf".to_string(), "*.txt".to_string()]
}

impl StoreConfig {
    /// Compile the include globs into a matcher for collection scans.
    pub fn include_matcher(&self) -> Result<globset::GlobSet> {
        let mut builder = globset::GlobSetBuilder::new();
        for pattern in &self.include_globs {
            let glob = globset::GlobBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("Invalid include glob: {}", pattern))?;
            builder.add(glob);
        }
        Ok(builder.build()?)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

/// Load the config file if it exists, otherwise fall back to defaults.
/// Commands that only read indices work without a config file.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        let config = Config::default();
        validate(&config)?;
        Ok(config)
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be < chunking.chunk_size");
    }

    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.top_k_per_shard < 1 {
        anyhow::bail!("retrieval.top_k_per_shard must be >= 1");
    }
    if config.retrieval.max_workers < 1 {
        anyhow::bail!("retrieval.max_workers must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "hashed" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hashed or openai.",
            other
        ),
    }

    config.store.include_matcher()?;

    Ok(())
}
