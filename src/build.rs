//! Index builder: source text → chunks → vectors → persisted index.
//!
//! Two build shapes share one pipeline:
//!
//! - **Per-file** ([`build_file_index`]): one source file into a
//!   fingerprint-named directory under the store root. Already-built
//!   fingerprints are skipped unless forced, so retraining a collection of
//!   hundreds of books only pays for the new ones.
//! - **Merged collection** ([`build_collection_index`]): every source in a
//!   directory into one index under `.shelfdex_index/`, with the
//!   collection manifest at the root recording the fingerprint set.
//!
//! Builds are atomic: everything is written into a temporary sibling
//! directory that is renamed over the target only once complete, so a
//! failed embedding run leaves no partial output. At most one build per
//! fingerprint runs at a time within the process.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::OnceLock;
use std::time::Instant;

use crate::chunk;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::Error;
use crate::extract;
use crate::fingerprint;
use crate::index::VectorIndex;
use crate::models::StoredChunk;
use crate::store::{self, BuildManifest, CollectionManifest, SourceState};

/// Outcome of a per-file build.
#[derive(Debug)]
pub struct FileBuildStatus {
    pub fingerprint: String,
    pub dir: PathBuf,
    pub chunks: usize,
    /// False when the existing index was reused.
    pub built: bool,
    pub elapsed_secs: f64,
}

/// Outcome of a collection build.
#[derive(Debug)]
pub struct CollectionBuildReport {
    pub total_chunks: usize,
    pub sources: usize,
    /// Sources skipped with their reasons.
    pub warnings: Vec<String>,
    /// False when the existing merged index was kept (fresh, or stale
    /// without `force`).
    pub built: bool,
    pub elapsed_secs: f64,
}

/// Serialize builds per fingerprint: N concurrent requests for the same
/// cold fingerprint trigger exactly one build.
fn build_lock(hash: &str) -> std::sync::Arc<tokio::sync::Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, std::sync::Arc<tokio::sync::Mutex<()>>>>> =
        OnceLock::new();
    let registry = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut map = registry.lock().expect("build lock registry poisoned");
    map.entry(hash.to_string())
        .or_insert_with(|| std::sync::Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

/// Build (or reuse) the per-file index for one source. The index lands in
/// `<store_root>/<fingerprint>/`; a complete existing directory short-
/// circuits the build unless `force` is set.
pub async fn build_file_index(
    config: &Config,
    embedder: &Embedder,
    source: &Path,
    store_root: &Path,
    force: bool,
) -> Result<FileBuildStatus> {
    let start = Instant::now();
    let hash = fingerprint::fingerprint(source)?;
    let dir = store::shard_dir(store_root, &hash);
    let filename = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| source.display().to_string());

    let lock = build_lock(&hash);
    let _guard = lock.lock().await;

    if !force && store::index_dir_is_complete(&dir) {
        refresh_filename(&dir, &filename)?;
        let manifest = store::read_build_manifest(&dir)?;
        tracing::debug!(fingerprint = %hash, "Index already built, reusing");
        return Ok(FileBuildStatus {
            fingerprint: hash,
            dir,
            chunks: manifest.chunks,
            built: false,
            elapsed_secs: start.elapsed().as_secs_f64(),
        });
    }

    let pages = extract::extract_pages(source)?;
    let chunks = chunk::chunk_pages(&filename, &pages, &config.chunking);
    let manifest = BuildManifest::new(
        vec![hash.clone()],
        Some(filename),
        chunks.len(),
        config.chunking.chunk_size,
        config.chunking.chunk_overlap,
        embedder.model_name(),
    );

    write_index_atomically(embedder, chunks, &dir, &manifest).await?;
    tracing::info!(fingerprint = %hash, chunks = manifest.chunks, "Built per-file index");

    Ok(FileBuildStatus {
        fingerprint: hash,
        dir,
        chunks: manifest.chunks,
        built: true,
        elapsed_secs: start.elapsed().as_secs_f64(),
    })
}

/// Build every source file of a collection into per-file indices.
pub async fn build_all_file_indices(
    config: &Config,
    embedder: &Embedder,
    root: &Path,
    force: bool,
) -> Result<(Vec<FileBuildStatus>, Vec<String>)> {
    let include = config.store.include_matcher()?;
    let mut statuses = Vec::new();
    let mut warnings = Vec::new();

    let mut entries: Vec<PathBuf> = std::fs::read_dir(root)
        .with_context(|| format!("Failed to read collection {}", root.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| !n.starts_with('.') && include.is_match(n))
                    .unwrap_or(false)
        })
        .collect();
    entries.sort();

    for path in entries {
        match build_file_index(config, embedder, &path, root, force).await {
            Ok(status) => statuses.push(status),
            Err(e) => {
                // An unreadable source is recorded and skipped; an
                // embedding failure aborts the whole run.
                if e.downcast_ref::<Error>()
                    .map(|err| matches!(err, Error::EmbeddingFailure(_)))
                    .unwrap_or(false)
                {
                    return Err(e);
                }
                let warning = format!("{}: {}", path.display(), e);
                tracing::warn!("Skipping source: {}", warning);
                warnings.push(warning);
            }
        }
    }

    Ok((statuses, warnings))
}

/// Build (or keep) the merged index over all sources of a collection.
///
/// Rebuild triggers: no index, no manifest, a changed fingerprint set, or
/// `force`. A stale collection without `force` keeps serving the existing
/// index and only warns — the operator opts into the rebuild.
pub async fn build_collection_index(
    config: &Config,
    embedder: &Embedder,
    root: &Path,
    force: bool,
) -> Result<CollectionBuildReport> {
    let start = Instant::now();
    let include = config.store.include_matcher()?;
    let previous = store::read_collection_manifest(root);
    let current = store::scan_collection(root, &include, previous.as_ref())?;

    let index_dir = root.join(store::COLLECTION_INDEX_DIR);
    let index_exists = store::index_dir_is_complete(&index_dir);

    if let Some(ref manifest) = previous {
        let report = store::diff_collection(manifest, &current);
        if index_exists && !force {
            if report.is_stale() {
                tracing::warn!(
                    "Collection {} changed ({}); serving existing index, rebuild to refresh",
                    root.display(),
                    report.summary()
                );
            } else {
                // Filenames may have moved between fingerprints; keep the
                // manifest current without rebuilding.
                if manifest_filenames_changed(manifest, &current) {
                    let refreshed =
                        CollectionManifest::new(current.clone(), manifest.total_chunks);
                    store::write_collection_manifest(root, &refreshed)?;
                }
            }
            return Ok(CollectionBuildReport {
                total_chunks: manifest.total_chunks,
                sources: current.len(),
                warnings: Vec::new(),
                built: false,
                elapsed_secs: start.elapsed().as_secs_f64(),
            });
        }
    } else if index_exists && !force {
        tracing::warn!(
            "Collection {} has an index but no manifest; force a rebuild to re-establish provenance",
            root.display()
        );
        let chunks = store::read_build_manifest(&index_dir)
            .map(|m| m.chunks)
            .unwrap_or(0);
        return Ok(CollectionBuildReport {
            total_chunks: chunks,
            sources: current.len(),
            warnings: Vec::new(),
            built: false,
            elapsed_secs: start.elapsed().as_secs_f64(),
        });
    }

    if current.is_empty() {
        anyhow::bail!("No source files found in {}", root.display());
    }

    // Chunk every readable source; unreadable ones are recorded and skipped.
    let mut all_chunks: Vec<StoredChunk> = Vec::new();
    let mut warnings = Vec::new();
    let mut indexed: BTreeMap<String, SourceState> = BTreeMap::new();

    for (name, state) in &current {
        let path = root.join(name);
        match extract::extract_pages(&path) {
            Ok(pages) => {
                let mut chunks = chunk::chunk_pages(name, &pages, &config.chunking);
                // Ordinals restart per source; offset them into one
                // collection-wide sequence for stable ordering.
                let offset = all_chunks.len();
                for chunk in &mut chunks {
                    chunk.ordinal += offset;
                }
                all_chunks.extend(chunks);
                indexed.insert(name.clone(), state.clone());
            }
            Err(e) => {
                let warning = format!("{}: {}", name, e);
                tracing::warn!("Skipping source: {}", warning);
                warnings.push(warning);
            }
        }
    }

    if all_chunks.is_empty() {
        anyhow::bail!(
            "No sources in {} produced any text ({} skipped)",
            root.display(),
            warnings.len()
        );
    }

    let fingerprints: Vec<String> = indexed.values().map(|s| s.fingerprint.clone()).collect();
    let manifest = BuildManifest::new(
        fingerprints,
        None,
        all_chunks.len(),
        config.chunking.chunk_size,
        config.chunking.chunk_overlap,
        embedder.model_name(),
    );
    let total_chunks = all_chunks.len();

    write_index_atomically(embedder, all_chunks, &index_dir, &manifest).await?;
    store::write_collection_manifest(root, &CollectionManifest::new(indexed.clone(), total_chunks))?;

    tracing::info!(
        sources = indexed.len(),
        chunks = total_chunks,
        "Built merged collection index at {}",
        index_dir.display()
    );

    Ok(CollectionBuildReport {
        total_chunks,
        sources: indexed.len(),
        warnings,
        built: true,
        elapsed_secs: start.elapsed().as_secs_f64(),
    })
}

/// Embed, assemble, and persist an index. Writes into a temporary sibling
/// directory and renames it over the target only once every file is in
/// place, so failures leave the previous index (or nothing) behind.
async fn write_index_atomically(
    embedder: &Embedder,
    chunks: Vec<StoredChunk>,
    target: &Path,
    manifest: &BuildManifest,
) -> Result<()> {
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let embeddings = embedder
        .embed_texts(&texts)
        .await
        .map_err(|e| Error::EmbeddingFailure(e.to_string()))?;

    let index = VectorIndex::build(chunks, embeddings)?;

    let parent = target
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Index target {} has no parent", target.display()))?;
    let staging = parent.join(format!(
        ".staging-{}",
        target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    ));

    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }

    let write = (|| -> Result<()> {
        index.save(&staging)?;
        store::write_build_manifest(&staging, manifest)?;
        Ok(())
    })();

    if let Err(e) = write {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    if target.exists() {
        std::fs::remove_dir_all(target)
            .with_context(|| format!("Failed to replace {}", target.display()))?;
    }
    std::fs::rename(&staging, target)
        .with_context(|| format!("Failed to move index into {}", target.display()))?;
    Ok(())
}

/// Keep the recorded display filename in step with the source. Renames
/// reuse the fingerprint directory, so only the manifest needs touching.
fn refresh_filename(dir: &Path, filename: &str) -> Result<()> {
    let mut manifest = store::read_build_manifest(dir)?;
    if manifest.filename.as_deref() != Some(filename) {
        tracing::debug!(
            "Source renamed to {}; updating manifest in {}",
            filename,
            dir.display()
        );
        manifest.filename = Some(filename.to_string());
        store::write_build_manifest(dir, &manifest)?;
    }
    Ok(())
}

fn manifest_filenames_changed(
    manifest: &CollectionManifest,
    current: &BTreeMap<String, SourceState>,
) -> bool {
    manifest.files.keys().ne(current.keys())
}
