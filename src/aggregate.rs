//! Cross-shard result aggregation.
//!
//! Shards are built independently, so the same passage can come back from
//! several of them (duplicate books, overlapping collections). Each passage
//! gets a canonical content key — a digest of its whitespace-normalized
//! text — and passages sharing a key collapse into one entry carrying the
//! best score and every contributing source. Scores from different shards
//! use the same metric (fixed by the embedding model) and compare directly.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::models::Passage;

/// A passage tagged with the shard it came from.
#[derive(Debug, Clone)]
pub struct ShardPassage {
    /// Fingerprint of the contributing shard.
    pub fingerprint: String,
    /// Display name of the contributing shard (source filename).
    pub shard_name: String,
    pub passage: Passage,
}

/// A deduplicated passage in the final ranking.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedPassage {
    /// Best score across contributing shards.
    pub score: f32,
    pub text: String,
    /// Display filename of the best-scoring occurrence.
    pub source: String,
    pub page: Option<usize>,
    /// Ordinal of the best-scoring occurrence within its source.
    pub ordinal: usize,
    /// Fingerprint of the best-scoring occurrence; tie-break anchor.
    pub fingerprint: String,
    /// Every shard (by display name) that returned this passage.
    pub sources: Vec<String>,
    /// Every contributing shard fingerprint.
    pub shards: Vec<String>,
    pub content_key: String,
}

/// Canonical key for a passage's text: SHA-256 over the text with runs of
/// whitespace collapsed, so formatting differences between shards don't
/// defeat deduplication.
pub fn content_key(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

/// Merge per-shard passages into a deduplicated ranking.
///
/// Ordering: descending best score, then ascending fingerprint, then
/// ascending chunk ordinal — fully deterministic for identical inputs.
pub fn aggregate(shard_passages: Vec<ShardPassage>) -> Vec<AggregatedPassage> {
    let mut groups: HashMap<String, AggregatedPassage> = HashMap::new();

    for sp in shard_passages {
        let key = content_key(&sp.passage.text);
        match groups.get_mut(&key) {
            Some(group) => {
                if !group.sources.contains(&sp.shard_name) {
                    group.sources.push(sp.shard_name.clone());
                }
                if !group.shards.contains(&sp.fingerprint) {
                    group.shards.push(sp.fingerprint.clone());
                }
                let better = sp.passage.score > group.score
                    || (sp.passage.score == group.score
                        && (sp.fingerprint.as_str(), sp.passage.ordinal)
                            < (group.fingerprint.as_str(), group.ordinal));
                if better {
                    group.score = sp.passage.score;
                    group.source = sp.passage.source;
                    group.page = sp.passage.page;
                    group.ordinal = sp.passage.ordinal;
                    group.fingerprint = sp.fingerprint;
                }
            }
            None => {
                groups.insert(
                    key.clone(),
                    AggregatedPassage {
                        score: sp.passage.score,
                        text: sp.passage.text,
                        source: sp.passage.source,
                        page: sp.passage.page,
                        ordinal: sp.passage.ordinal,
                        fingerprint: sp.fingerprint.clone(),
                        sources: vec![sp.shard_name],
                        shards: vec![sp.fingerprint],
                        content_key: key,
                    },
                );
            }
        }
    }

    let mut merged: Vec<AggregatedPassage> = groups.into_values().collect();
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
            .then_with(|| a.ordinal.cmp(&b.ordinal))
    });
    merged
}
