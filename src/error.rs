//! Domain error taxonomy.
//!
//! Structured errors that cross module boundaries and surface in HTTP
//! responses and shard status reports. Application edges (CLI, server
//! startup) still use `anyhow` for context-rich propagation; this enum
//! covers the cases callers dispatch on.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested source path does not exist or cannot be read.
    /// Surfaced to the caller; never retried.
    #[error("source unavailable: {path}: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    /// A resident index no longer matches the fingerprints derivable from
    /// its source directory. The entry keeps serving; `reload` is the remedy.
    #[error("stale index for {path}: {detail}")]
    StaleCache { path: PathBuf, detail: String },

    /// An on-disk index failed to load or parse.
    #[error("corrupt index at {dir}: {reason}")]
    IndexCorrupt { dir: PathBuf, reason: String },

    /// The embedding backend failed. Builds abort cleanly; queries return
    /// an error response.
    #[error("embedding failure: {0}")]
    EmbeddingFailure(String),

    /// A shard exceeded its per-shard deadline. Siblings are unaffected.
    #[error("shard {fingerprint} timed out after {secs}s")]
    ShardTimeout { fingerprint: String, secs: u64 },

    /// A shard failed for a non-timeout reason. Siblings are unaffected.
    #[error("shard {fingerprint} failed: {reason}")]
    ShardFailure { fingerprint: String, reason: String },

    /// Every shard of a fan-out call failed; the composite carries each
    /// shard's cause.
    #[error("all {} shards failed", .causes.len())]
    AllShardsFailed { causes: Vec<(String, String)> },
}

impl Error {
    /// Machine-readable code used in HTTP error bodies and shard reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::SourceUnavailable { .. } => "source_unavailable",
            Error::StaleCache { .. } => "stale_cache",
            Error::IndexCorrupt { .. } => "index_corrupt",
            Error::EmbeddingFailure(_) => "embedding_failure",
            Error::ShardTimeout { .. } => "shard_timeout",
            Error::ShardFailure { .. } => "shard_failure",
            Error::AllShardsFailed { .. } => "all_shards_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let err = Error::SourceUnavailable {
            path: PathBuf::from("/missing"),
            reason: "no such file".into(),
        };
        assert_eq!(err.kind(), "source_unavailable");

        let err = Error::AllShardsFailed {
            causes: vec![("abc".into(), "boom".into())],
        };
        assert_eq!(err.kind(), "all_shards_failed");
        assert!(err.to_string().contains("all 1 shards failed"));
    }
}
