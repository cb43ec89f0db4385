//! Content-addressed index store layout and manifests.
//!
//! # Layouts
//!
//! Per-file shard indices (the canonical multi-shard layout) live in
//! directories named by the source's fingerprint, as siblings of the
//! sources themselves:
//!
//! ```text
//! <root>/
//!   book.pdf
//!   <fingerprint>/
//!     index.vec        — vector matrix
//!     chunks.json      — chunk metadata
//!     manifest.json    — build manifest
//! ```
//!
//! A merged collection additionally keeps one index over all its sources
//! in a hidden subdirectory, with a collection manifest at the root
//! recording which files (by fingerprint) went into it:
//!
//! ```text
//! <collection_root>/
//!   source1.pdf
//!   source2.pdf
//!   manifest.json      — collection manifest
//!   .shelfdex_index/
//!     index.vec
//!     chunks.json
//!     manifest.json
//! ```
//!
//! Both layouts are readable; this implementation writes `.shelfdex_index/`
//! for merged collections. The collection manifest is the source of truth
//! for staleness: rebuild is needed exactly when its fingerprint set
//! differs from a fresh directory scan.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::fingerprint;
use crate::index::INDEX_FILE;

pub const MANIFEST_FILE: &str = "manifest.json";
/// Hidden subdirectory holding a merged collection's index.
pub const COLLECTION_INDEX_DIR: &str = ".shelfdex_index";
pub const SCHEMA_VERSION: u32 = 1;

/// Record persisted alongside every on-disk index describing what it was
/// built from and with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildManifest {
    pub schema_version: u32,
    /// Fingerprint of each source included; exactly one for per-file
    /// indices.
    pub fingerprints: Vec<String>,
    /// Display filename for per-file indices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub chunks: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_model: String,
    /// ISO-8601 build timestamp.
    pub built_at: String,
}

impl BuildManifest {
    pub fn new(
        fingerprints: Vec<String>,
        filename: Option<String>,
        chunks: usize,
        chunk_size: usize,
        chunk_overlap: usize,
        embedding_model: &str,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            fingerprints,
            filename,
            chunks,
            chunk_size,
            chunk_overlap,
            embedding_model: embedding_model.to_string(),
            built_at: Utc::now().to_rfc3339(),
        }
    }
}

pub fn write_build_manifest(dir: &Path, manifest: &BuildManifest) -> Result<()> {
    let json = serde_json::to_string_pretty(manifest)?;
    std::fs::write(dir.join(MANIFEST_FILE), json)
        .with_context(|| format!("Failed to write manifest in {}", dir.display()))?;
    Ok(())
}

pub fn read_build_manifest(dir: &Path) -> std::result::Result<BuildManifest, Error> {
    let corrupt = |reason: String| Error::IndexCorrupt {
        dir: dir.to_path_buf(),
        reason,
    };
    let json = std::fs::read_to_string(dir.join(MANIFEST_FILE))
        .map_err(|e| corrupt(format!("{}: {}", MANIFEST_FILE, e)))?;
    serde_json::from_str(&json).map_err(|e| corrupt(format!("{}: {}", MANIFEST_FILE, e)))
}

// ============ Collection manifest ============

/// Per-source state recorded in the collection manifest. Size and mtime
/// let a rescan skip re-hashing unchanged files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceState {
    pub fingerprint: String,
    pub size: u64,
    pub mtime: i64,
}

/// Root-level manifest of a merged collection: which files, by content,
/// the merged index was built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionManifest {
    pub version: u32,
    /// filename → source state.
    pub files: BTreeMap<String, SourceState>,
    pub built_at: String,
    pub total_chunks: usize,
}

impl CollectionManifest {
    pub fn new(files: BTreeMap<String, SourceState>, total_chunks: usize) -> Self {
        Self {
            version: SCHEMA_VERSION,
            files,
            built_at: Utc::now().to_rfc3339(),
            total_chunks,
        }
    }

}

pub fn write_collection_manifest(root: &Path, manifest: &CollectionManifest) -> Result<()> {
    let json = serde_json::to_string_pretty(manifest)?;
    std::fs::write(root.join(MANIFEST_FILE), json)
        .with_context(|| format!("Failed to write collection manifest in {}", root.display()))?;
    Ok(())
}

/// Read the collection manifest if one exists. An unparseable manifest is
/// treated as absent — the collection just looks unbuilt.
pub fn read_collection_manifest(root: &Path) -> Option<CollectionManifest> {
    let json = std::fs::read_to_string(root.join(MANIFEST_FILE)).ok()?;
    serde_json::from_str(&json).ok()
}

/// Scan a collection root non-recursively for source files and compute
/// their current state. When a file's size and mtime match the previous
/// manifest, its recorded fingerprint is reused instead of re-hashing.
pub fn scan_collection(
    root: &Path,
    include: &globset::GlobSet,
    previous: Option<&CollectionManifest>,
) -> Result<BTreeMap<String, SourceState>> {
    let entries = std::fs::read_dir(root)
        .with_context(|| format!("Failed to read collection {}", root.display()))?;

    let mut files = BTreeMap::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || !include.is_match(&name) {
            continue;
        }

        let meta = entry.metadata()?;
        let size = meta.len();
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let prev = previous.and_then(|m| m.files.get(&name));
        let hash = match prev {
            Some(state) if state.size == size && state.mtime == mtime => {
                state.fingerprint.clone()
            }
            _ => fingerprint::fingerprint(&path)?,
        };

        files.insert(
            name,
            SourceState {
                fingerprint: hash,
                size,
                mtime,
            },
        );
    }

    Ok(files)
}

/// What changed between the manifest a merged index was built from and the
/// collection's current contents.
#[derive(Debug, Default)]
pub struct StaleReport {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
}

impl StaleReport {
    pub fn is_stale(&self) -> bool {
        self.added > 0 || self.removed > 0 || self.modified > 0
    }

    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if self.added > 0 {
            parts.push(format!("{} added", self.added));
        }
        if self.removed > 0 {
            parts.push(format!("{} removed", self.removed));
        }
        if self.modified > 0 {
            parts.push(format!("{} modified", self.modified));
        }
        if parts.is_empty() {
            "unchanged".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Compare by fingerprint set: a rename moves a fingerprint to a new
/// filename without making the index stale. A file whose name survives but
/// whose content changed counts as modified rather than added+removed.
pub fn diff_collection(
    manifest: &CollectionManifest,
    current: &BTreeMap<String, SourceState>,
) -> StaleReport {
    use std::collections::BTreeSet;

    let old_hashes: BTreeSet<&str> = manifest
        .files
        .values()
        .map(|s| s.fingerprint.as_str())
        .collect();
    let new_hashes: BTreeSet<&str> = current.values().map(|s| s.fingerprint.as_str()).collect();

    let mut report = StaleReport::default();

    for (name, state) in current {
        if old_hashes.contains(state.fingerprint.as_str()) {
            continue;
        }
        match manifest.files.get(name) {
            Some(_) => report.modified += 1,
            None => report.added += 1,
        }
    }

    for (name, state) in &manifest.files {
        if new_hashes.contains(state.fingerprint.as_str()) {
            continue;
        }
        // Content changes were already counted as modified above.
        if !current.contains_key(name) {
            report.removed += 1;
        }
    }

    report
}

// ============ Path resolution ============

/// Directory holding the per-file index for `hash` under a store root.
pub fn shard_dir(root: &Path, hash: &str) -> PathBuf {
    root.join(hash)
}

/// True when `dir` contains a complete index: matrix, chunk metadata, and
/// build manifest.
pub fn index_dir_is_complete(dir: &Path) -> bool {
    dir.join(INDEX_FILE).is_file()
        && dir.join(crate::index::CHUNKS_FILE).is_file()
        && dir.join(MANIFEST_FILE).is_file()
}

/// Resolve a queryable path to its index directory. Accepts either a
/// fingerprint directory holding the index files directly, or a collection
/// root with a merged index in [`COLLECTION_INDEX_DIR`].
pub fn resolve_index_dir(path: &Path) -> std::result::Result<PathBuf, Error> {
    if !path.exists() {
        return Err(Error::SourceUnavailable {
            path: path.to_path_buf(),
            reason: "no such directory".to_string(),
        });
    }

    if path.join(INDEX_FILE).is_file() {
        return Ok(path.to_path_buf());
    }

    let merged = path.join(COLLECTION_INDEX_DIR);
    if merged.join(INDEX_FILE).is_file() {
        return Ok(merged);
    }

    Err(Error::SourceUnavailable {
        path: path.to_path_buf(),
        reason: "no index found (build it first)".to_string(),
    })
}

/// Human-facing name for a shard directory: the manifest's filename when
/// present, otherwise the directory name itself.
pub fn display_name(dir: &Path) -> String {
    if let Ok(manifest) = read_build_manifest(dir) {
        if let Some(filename) = manifest.filename {
            return filename;
        }
    }
    dir.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| dir.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn sample_manifest() -> BuildManifest {
        BuildManifest::new(
            vec!["0123456789abcdef0123456789abcdef".to_string()],
            Some("book.pdf".to_string()),
            42,
            1200,
            150,
            "hashed-384",
        )
    }

    #[test]
    fn build_manifest_round_trip() {
        let tmp = TempDir::new().unwrap();
        let manifest = sample_manifest();
        write_build_manifest(tmp.path(), &manifest).unwrap();

        let loaded = read_build_manifest(tmp.path()).unwrap();
        assert_eq!(loaded.schema_version, SCHEMA_VERSION);
        assert_eq!(loaded.fingerprints, manifest.fingerprints);
        assert_eq!(loaded.filename.as_deref(), Some("book.pdf"));
        assert_eq!(loaded.chunks, 42);
        assert_eq!(loaded.embedding_model, "hashed-384");
    }

    #[test]
    fn garbled_manifest_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(MANIFEST_FILE), "{not json").unwrap();
        let err = read_build_manifest(tmp.path()).unwrap_err();
        assert_eq!(err.kind(), "index_corrupt");
    }

    #[test]
    fn scan_reuses_fingerprint_when_unchanged() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "stable contents").unwrap();

        let include = crate::config::StoreConfig::default().include_matcher().unwrap();
        let first = scan_collection(tmp.path(), &include, None).unwrap();
        let state = first.get("a.txt").unwrap().clone();

        // Pretend the previous manifest recorded a sentinel fingerprint;
        // with size+mtime unchanged the scan must trust it over re-hashing.
        let mut files = BTreeMap::new();
        files.insert(
            "a.txt".to_string(),
            SourceState {
                fingerprint: "f".repeat(32),
                size: state.size,
                mtime: state.mtime,
            },
        );
        let previous = CollectionManifest::new(files, 0);

        let second = scan_collection(tmp.path(), &include, Some(&previous)).unwrap();
        assert_eq!(second.get("a.txt").unwrap().fingerprint, "f".repeat(32));
    }

    #[test]
    fn rename_is_not_stale() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "same bytes").unwrap();

        let include = crate::config::StoreConfig::default().include_matcher().unwrap();
        let scan = scan_collection(tmp.path(), &include, None).unwrap();
        let manifest = CollectionManifest::new(scan, 10);

        fs::rename(tmp.path().join("a.txt"), tmp.path().join("z.txt")).unwrap();
        let rescan = scan_collection(tmp.path(), &include, None).unwrap();

        let report = diff_collection(&manifest, &rescan);
        assert!(!report.is_stale(), "rename must not invalidate: {:?}", report);
    }

    #[test]
    fn added_and_removed_sources_are_stale() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "aaa").unwrap();

        let include = crate::config::StoreConfig::default().include_matcher().unwrap();
        let scan = scan_collection(tmp.path(), &include, None).unwrap();
        let manifest = CollectionManifest::new(scan, 5);

        fs::remove_file(tmp.path().join("a.txt")).unwrap();
        fs::write(tmp.path().join("b.txt"), "bbb").unwrap();
        let rescan = scan_collection(tmp.path(), &include, None).unwrap();

        let report = diff_collection(&manifest, &rescan);
        assert_eq!(report.added, 1);
        assert_eq!(report.removed, 1);
        assert!(report.is_stale());
        assert!(report.summary().contains("added"));
    }

    #[test]
    fn resolve_prefers_direct_index() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(INDEX_FILE), b"x").unwrap();
        assert_eq!(resolve_index_dir(tmp.path()).unwrap(), tmp.path());
    }

    #[test]
    fn resolve_finds_merged_index() {
        let tmp = TempDir::new().unwrap();
        let merged = tmp.path().join(COLLECTION_INDEX_DIR);
        fs::create_dir(&merged).unwrap();
        fs::write(merged.join(INDEX_FILE), b"x").unwrap();
        assert_eq!(resolve_index_dir(tmp.path()).unwrap(), merged);
    }

    #[test]
    fn resolve_missing_path_is_unavailable() {
        let err = resolve_index_dir(Path::new("/no/such/collection")).unwrap_err();
        assert_eq!(err.kind(), "source_unavailable");
    }

    #[test]
    fn display_name_prefers_manifest_filename() {
        let tmp = TempDir::new().unwrap();
        write_build_manifest(tmp.path(), &sample_manifest()).unwrap();
        assert_eq!(display_name(tmp.path()), "book.pdf");
    }
}
