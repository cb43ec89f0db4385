//! Core data types flowing through the build and query pipeline.
//!
//! ```text
//! source file → extract → pages → chunk → StoredChunk
//!                                             ↓
//!                                        embed → VectorIndex entry
//!                                             ↓
//!                                       search → Passage
//! ```
//!
//! A **[`StoredChunk`]** is a contiguous span of source text persisted in
//! the index directory's chunk-metadata file. A **[`Passage`]** is a chunk
//! returned by a search, bearing its similarity score. Fan-out queries wrap
//! passages in shard context before aggregation.

use serde::{Deserialize, Serialize};

/// A chunk of source text persisted alongside its vector.
///
/// The `source` filename is display-only: identity is carried by the
/// fingerprint of the owning index directory, so renaming a source never
/// invalidates its chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChunk {
    /// UUID v4 chunk id.
    pub id: String,
    /// Originating source filename (display only).
    pub source: String,
    /// 1-indexed page number, when the text producer supplied pages.
    pub page: Option<usize>,
    /// Zero-based ordinal within the source.
    pub ordinal: usize,
    /// Chunk text content.
    pub text: String,
}

/// A ranked search hit from one index.
#[derive(Debug, Clone, Serialize)]
pub struct Passage {
    /// Cosine similarity against the query vector.
    pub score: f32,
    pub text: String,
    /// Display filename of the originating source.
    pub source: String,
    pub page: Option<usize>,
    /// Chunk ordinal within its source; part of the stable tie-break order.
    pub ordinal: usize,
}

impl Passage {
    /// Render this passage the way responses present it:
    /// `[source.pdf] Page N:\n<content>`.
    pub fn render(&self) -> String {
        match self.page {
            Some(page) => format!("[{}] Page {}:\n{}", self.source, page, self.text),
            None => format!("[{}]:\n{}", self.source, self.text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_page_when_known() {
        let passage = Passage {
            score: 0.9,
            text: "body".to_string(),
            source: "book.pdf".to_string(),
            page: Some(12),
            ordinal: 3,
        };
        assert_eq!(passage.render(), "[book.pdf] Page 12:\nbody");
    }

    #[test]
    fn render_without_page() {
        let passage = Passage {
            score: 0.9,
            text: "body".to_string(),
            source: "notes.txt".to_string(),
            page: None,
            ordinal: 0,
        };
        assert_eq!(passage.render(), "[notes.txt]:\nbody");
    }
}
