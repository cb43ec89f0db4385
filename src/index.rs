//! In-memory vector index with flat-file persistence.
//!
//! An index is a row-major matrix of L2-scored chunk vectors plus the chunk
//! metadata, searched by cosine similarity against a query vector. The
//! capability set is deliberately small — `search`, `doc_count`, `dims` —
//! so single-file and merged-collection indices are interchangeable behind
//! the same handle type.
//!
//! # Persistence
//!
//! Vectors are stored as little-endian `f32` bytes behind an
//! `[dims: u32][rows: u32]` header in `index.vec`; chunk metadata lives in
//! `chunks.json`. Both files sit inside the fingerprint-named directory
//! next to the build manifest.

use anyhow::Result;
use std::path::Path;

use crate::error::Error;
use crate::models::{Passage, StoredChunk};

/// Vector matrix file inside an index directory.
pub const INDEX_FILE: &str = "index.vec";
/// Chunk metadata file inside an index directory.
pub const CHUNKS_FILE: &str = "chunks.json";

/// A loaded, searchable index. Shared across concurrent readers by `Arc`;
/// search takes `&self` and never blocks other searches.
#[derive(Debug)]
pub struct VectorIndex {
    dims: usize,
    /// Row-major `rows × dims` matrix.
    vectors: Vec<f32>,
    /// Precomputed row norms, one per vector.
    norms: Vec<f32>,
    chunks: Vec<StoredChunk>,
}

impl VectorIndex {
    /// Assemble an index from chunks and their embeddings. Every vector
    /// must have the same dimension.
    pub fn build(chunks: Vec<StoredChunk>, embeddings: Vec<Vec<f32>>) -> Result<Self> {
        if chunks.len() != embeddings.len() {
            anyhow::bail!(
                "Chunk/vector count mismatch: {} chunks, {} vectors",
                chunks.len(),
                embeddings.len()
            );
        }

        let dims = embeddings.first().map(|v| v.len()).unwrap_or(0);
        let mut vectors = Vec::with_capacity(chunks.len() * dims);
        for (i, vector) in embeddings.iter().enumerate() {
            if vector.len() != dims {
                anyhow::bail!(
                    "Vector {} has dimension {}, expected {}",
                    i,
                    vector.len(),
                    dims
                );
            }
            vectors.extend_from_slice(vector);
        }

        let norms = row_norms(&vectors, dims);
        Ok(Self {
            dims,
            vectors,
            norms,
            chunks,
        })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Number of entries (chunks) in the index.
    pub fn doc_count(&self) -> usize {
        self.chunks.len()
    }

    /// Top-k nearest chunks by cosine similarity, descending score. Ties
    /// resolve by ascending ordinal so results are stable across runs.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<Passage> {
        if query.len() != self.dims || self.chunks.is_empty() || k == 0 {
            return Vec::new();
        }

        let query_norm: f32 = query.iter().map(|v| v * v).sum::<f32>().sqrt();
        if query_norm < f32::EPSILON {
            return Vec::new();
        }

        let mut scored: Vec<(f32, usize)> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(row, _)| {
                let offset = row * self.dims;
                let dot: f32 = self.vectors[offset..offset + self.dims]
                    .iter()
                    .zip(query.iter())
                    .map(|(a, b)| a * b)
                    .sum();
                let denom = self.norms[row] * query_norm;
                let score = if denom < f32::EPSILON { 0.0 } else { dot / denom };
                (score, row)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.chunks[a.1].ordinal.cmp(&self.chunks[b.1].ordinal))
        });

        scored
            .into_iter()
            .take(k)
            .map(|(score, row)| {
                let chunk = &self.chunks[row];
                Passage {
                    score,
                    text: chunk.text.clone(),
                    source: chunk.source.clone(),
                    page: chunk.page,
                    ordinal: chunk.ordinal,
                }
            })
            .collect()
    }

    /// Persist the matrix and chunk metadata into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;

        let mut blob = Vec::with_capacity(8 + self.vectors.len() * 4);
        blob.extend_from_slice(&(self.dims as u32).to_le_bytes());
        blob.extend_from_slice(&(self.chunks.len() as u32).to_le_bytes());
        for v in &self.vectors {
            blob.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::write(dir.join(INDEX_FILE), blob)?;

        let meta = serde_json::to_string(&self.chunks)?;
        std::fs::write(dir.join(CHUNKS_FILE), meta)?;
        Ok(())
    }

    /// Load an index from `dir`. Any structural problem — short file,
    /// header mismatch, unparseable metadata — reports the directory as
    /// corrupt rather than panicking.
    pub fn load(dir: &Path) -> std::result::Result<Self, Error> {
        let corrupt = |reason: String| Error::IndexCorrupt {
            dir: dir.to_path_buf(),
            reason,
        };

        let blob =
            std::fs::read(dir.join(INDEX_FILE)).map_err(|e| corrupt(format!("{}: {}", INDEX_FILE, e)))?;
        if blob.len() < 8 {
            return Err(corrupt(format!("{} shorter than header", INDEX_FILE)));
        }

        let dims = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
        let rows = u32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]) as usize;
        let expected = 8 + rows * dims * 4;
        if blob.len() != expected {
            return Err(corrupt(format!(
                "{} has {} bytes, expected {} for {}x{}",
                INDEX_FILE,
                blob.len(),
                expected,
                rows,
                dims
            )));
        }

        let vectors: Vec<f32> = blob[8..]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        let meta = std::fs::read_to_string(dir.join(CHUNKS_FILE))
            .map_err(|e| corrupt(format!("{}: {}", CHUNKS_FILE, e)))?;
        let chunks: Vec<StoredChunk> =
            serde_json::from_str(&meta).map_err(|e| corrupt(format!("{}: {}", CHUNKS_FILE, e)))?;

        if chunks.len() != rows {
            return Err(corrupt(format!(
                "{} rows but {} chunk records",
                rows,
                chunks.len()
            )));
        }

        let norms = row_norms(&vectors, dims);
        Ok(Self {
            dims,
            vectors,
            norms,
            chunks,
        })
    }
}

fn row_norms(vectors: &[f32], dims: usize) -> Vec<f32> {
    if dims == 0 {
        return Vec::new();
    }
    vectors
        .chunks_exact(dims)
        .map(|row| row.iter().map(|v| v * v).sum::<f32>().sqrt())
        .collect()
}
