//! In-memory cache of loaded indices.
//!
//! Maps canonical paths to loaded index handles. Reads are concurrent; a
//! cold path is loaded under a per-path mutex so N simultaneous callers
//! trigger exactly one disk load. There is no global write lock across
//! paths: loading one collection never blocks queries against another.
//!
//! `reload` follows read-copy-update: the replacement index is loaded
//! first, then swapped in. In-flight searches keep their `Arc` to the old
//! handle and complete against the old index; the old handle drops when
//! the last reader releases it. Entries stay resident until evicted —
//! memory sizing is the operator's call.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::index::VectorIndex;
use crate::store;

/// A resident index.
pub struct CacheEntry {
    pub path: PathBuf,
    pub handle: Arc<VectorIndex>,
    pub loaded_at: DateTime<Utc>,
    /// Embedding model recorded in the loaded manifest.
    pub embedding_model: String,
}

/// Result of a cache lookup.
#[derive(Debug)]
pub struct Loaded {
    pub handle: Arc<VectorIndex>,
    /// Embedding model the index was built with, from its manifest.
    pub embedding_model: String,
    /// Seconds spent loading; 0 on a hit.
    pub load_secs: f64,
    pub from_cache: bool,
}

/// One row of `stats()`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStat {
    pub path: String,
    pub loaded_at: DateTime<Utc>,
    pub docs_count: usize,
}

#[derive(Default)]
pub struct IndexCache {
    entries: RwLock<HashMap<PathBuf, Arc<CacheEntry>>>,
    /// Per-path load locks; the registry itself is only held momentarily.
    loading: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl IndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the resident handle for `path`, loading it on first use.
    /// Concurrent callers for the same cold path block on one load and all
    /// observe the same handle.
    pub async fn get_or_load(&self, path: &Path) -> Result<Loaded> {
        let key = canonical(path)?;

        if let Some(entry) = self.lookup(&key) {
            tracing::debug!("Cache hit: {}", key.display());
            return Ok(Loaded {
                handle: entry.handle.clone(),
                embedding_model: entry.embedding_model.clone(),
                load_secs: 0.0,
                from_cache: true,
            });
        }

        let lock = self.load_lock(&key);
        let _guard = lock.lock().await;

        // Another caller may have finished the load while we waited.
        if let Some(entry) = self.lookup(&key) {
            return Ok(Loaded {
                handle: entry.handle.clone(),
                embedding_model: entry.embedding_model.clone(),
                load_secs: 0.0,
                from_cache: true,
            });
        }

        tracing::info!("Loading index: {}", key.display());
        let start = Instant::now();
        let entry = load_entry(&key).await?;
        let load_secs = start.elapsed().as_secs_f64();
        let handle = entry.handle.clone();
        let embedding_model = entry.embedding_model.clone();

        self.entries
            .write()
            .expect("cache map poisoned")
            .insert(key.clone(), entry);
        tracing::info!("Loaded {} in {:.2}s", key.display(), load_secs);

        Ok(Loaded {
            handle,
            embedding_model,
            load_secs,
            from_cache: false,
        })
    }

    /// Load a fresh entry and swap it in. The previous handle survives
    /// until its last in-flight reader drops it.
    pub async fn reload(&self, path: &Path) -> Result<Loaded> {
        let key = canonical(path)?;

        let lock = self.load_lock(&key);
        let _guard = lock.lock().await;

        let start = Instant::now();
        let entry = load_entry(&key).await?;
        let load_secs = start.elapsed().as_secs_f64();
        let handle = entry.handle.clone();
        let embedding_model = entry.embedding_model.clone();

        self.entries
            .write()
            .expect("cache map poisoned")
            .insert(key, entry);

        Ok(Loaded {
            handle,
            embedding_model,
            load_secs,
            from_cache: false,
        })
    }

    /// Remove one entry. Returns false when the path was not resident.
    pub fn evict(&self, path: &Path) -> bool {
        let key = match canonical(path) {
            Ok(key) => key,
            Err(_) => PathBuf::from(path),
        };
        self.entries
            .write()
            .expect("cache map poisoned")
            .remove(&key)
            .is_some()
    }

    /// Remove every entry; returns how many were evicted.
    pub fn evict_all(&self) -> usize {
        let mut map = self.entries.write().expect("cache map poisoned");
        let count = map.len();
        map.clear();
        count
    }

    pub fn stats(&self) -> Vec<CacheStat> {
        let map = self.entries.read().expect("cache map poisoned");
        let mut stats: Vec<CacheStat> = map
            .values()
            .map(|entry| CacheStat {
                path: entry.path.display().to_string(),
                loaded_at: entry.loaded_at,
                docs_count: entry.handle.doc_count(),
            })
            .collect();
        stats.sort_by(|a, b| a.path.cmp(&b.path));
        stats
    }

    pub fn resident_paths(&self) -> Vec<String> {
        let map = self.entries.read().expect("cache map poisoned");
        let mut paths: Vec<String> = map.keys().map(|p| p.display().to_string()).collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &Path) -> Option<Arc<CacheEntry>> {
        self.entries
            .read()
            .expect("cache map poisoned")
            .get(key)
            .cloned()
    }

    fn load_lock(&self, key: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.loading.lock().expect("load lock registry poisoned");
        locks
            .entry(key.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn canonical(path: &Path) -> Result<PathBuf> {
    path.canonicalize().map_err(|e| Error::SourceUnavailable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Read an index off disk into a cache entry. Index deserialization is
/// CPU-and-disk work, so it runs on the blocking pool.
async fn load_entry(key: &Path) -> Result<Arc<CacheEntry>> {
    let index_dir = store::resolve_index_dir(key)?;
    let manifest = store::read_build_manifest(&index_dir)?;

    // Merged collections are checked against the current directory scan;
    // a drifted fingerprint set is worth a warning but keeps serving.
    if index_dir.ends_with(store::COLLECTION_INDEX_DIR) {
        warn_if_stale(key);
    }

    let dir = index_dir.clone();
    let index = tokio::task::spawn_blocking(move || VectorIndex::load(&dir))
        .await
        .map_err(|e| Error::IndexCorrupt {
            dir: index_dir.clone(),
            reason: format!("load task failed: {}", e),
        })??;

    Ok(Arc::new(CacheEntry {
        path: key.to_path_buf(),
        handle: Arc::new(index),
        loaded_at: Utc::now(),
        embedding_model: manifest.embedding_model,
    }))
}

fn warn_if_stale(root: &Path) {
    let Some(manifest) = store::read_collection_manifest(root) else {
        return;
    };
    let include = match crate::config::StoreConfig::default().include_matcher() {
        Ok(include) => include,
        Err(_) => return,
    };
    if let Ok(current) = store::scan_collection(root, &include, Some(&manifest)) {
        let report = store::diff_collection(&manifest, &current);
        if report.is_stale() {
            tracing::warn!(
                "Sources under {} changed since the index was built ({}); \
                 reload after rebuilding to refresh",
                root.display(),
                report.summary()
            );
        }
    }
}
