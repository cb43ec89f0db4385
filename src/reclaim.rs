//! Orphaned index reclamation.
//!
//! A fingerprint directory whose source file no longer exists in the
//! collection is an orphan: nothing will ever query it again, but it keeps
//! holding disk. Reclamation compares the fingerprints of the current
//! source files against the fingerprint-named directories and removes the
//! difference.
//!
//! Safety rules: only directories whose names are well-formed fingerprints
//! are ever considered, and removal is whole-directory — no partial
//! deletion inside an index. Everything else (sources, the merged index
//! subdirectory, stray files) is untouchable.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use walkdir::WalkDir;

use crate::fingerprint;

#[derive(Debug, Serialize)]
pub struct ReclaimReport {
    pub orphans_found: usize,
    /// Fingerprints actually removed (empty in a dry run).
    pub removed: Vec<String>,
    /// Valid fingerprint directories left in place.
    pub kept: usize,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
    pub dry_run: bool,
}

/// Remove (or, with `dry_run`, just report) every orphaned fingerprint
/// directory under `collection_root`.
pub fn reclaim(collection_root: &Path, dry_run: bool) -> Result<ReclaimReport> {
    let sources = fingerprint::directory_manifest(collection_root)
        .with_context(|| format!("Failed to scan sources in {}", collection_root.display()))?;
    let valid: BTreeSet<&str> = sources.keys().map(|s| s.as_str()).collect();

    let mut index_dirs: BTreeSet<String> = BTreeSet::new();
    for entry in std::fs::read_dir(collection_root)
        .with_context(|| format!("Failed to read {}", collection_root.display()))?
        .flatten()
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.path().is_dir() && fingerprint::is_fingerprint(&name) {
            index_dirs.insert(name);
        }
    }

    let orphans: Vec<String> = index_dirs
        .iter()
        .filter(|hash| !valid.contains(hash.as_str()))
        .cloned()
        .collect();

    let mut report = ReclaimReport {
        orphans_found: orphans.len(),
        removed: Vec::new(),
        kept: index_dirs.len() - orphans.len(),
        bytes_freed: 0,
        errors: Vec::new(),
        dry_run,
    };

    for hash in orphans {
        let dir = collection_root.join(&hash);
        let size = dir_size(&dir);

        if dry_run {
            tracing::info!(
                "Would remove orphan {} ({} bytes)",
                hash,
                size
            );
            report.bytes_freed += size;
            continue;
        }

        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!("Removed orphan {} ({} bytes)", hash, size);
                report.bytes_freed += size;
                report.removed.push(hash);
            }
            Err(e) => {
                let msg = format!("{}: {}", hash, e);
                tracing::warn!("Failed to remove orphan {}", msg);
                report.errors.push(msg);
            }
        }
    }

    Ok(report)
}

fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_index_dir(root: &Path, hash: &str, payload_bytes: usize) {
        let dir = root.join(hash);
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("index.vec"), vec![0u8; payload_bytes]).unwrap();
        fs::write(dir.join("manifest.json"), "{}").unwrap();
    }

    #[test]
    fn removes_only_orphans() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("kept.txt"), "kept source").unwrap();
        let live = fingerprint::fingerprint(&tmp.path().join("kept.txt")).unwrap();

        fake_index_dir(tmp.path(), &live, 10);
        let orphan_a = "a".repeat(32);
        let orphan_b = "b".repeat(32);
        fake_index_dir(tmp.path(), &orphan_a, 100);
        fake_index_dir(tmp.path(), &orphan_b, 200);

        let report = reclaim(tmp.path(), false).unwrap();
        assert_eq!(report.orphans_found, 2);
        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.kept, 1);
        assert!(report.bytes_freed >= 300);
        assert!(report.errors.is_empty());

        assert!(tmp.path().join(&live).is_dir());
        assert!(!tmp.path().join(&orphan_a).exists());
        assert!(!tmp.path().join(&orphan_b).exists());
    }

    #[test]
    fn dry_run_deletes_nothing() {
        let tmp = TempDir::new().unwrap();
        let orphan = "c".repeat(32);
        fake_index_dir(tmp.path(), &orphan, 50);

        let report = reclaim(tmp.path(), true).unwrap();
        assert_eq!(report.orphans_found, 1);
        assert!(report.removed.is_empty());
        assert!(report.bytes_freed >= 50);
        assert!(tmp.path().join(&orphan).is_dir());
    }

    #[test]
    fn non_fingerprint_directories_are_untouchable() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("notes")).unwrap();
        fs::create_dir(tmp.path().join(".shelfdex_index")).unwrap();
        fs::write(tmp.path().join(".shelfdex_index/index.vec"), "x").unwrap();

        let report = reclaim(tmp.path(), false).unwrap();
        assert_eq!(report.orphans_found, 0);
        assert!(tmp.path().join("notes").is_dir());
        assert!(tmp.path().join(".shelfdex_index").is_dir());
    }

    #[test]
    fn every_surviving_directory_has_a_source() {
        let tmp = TempDir::new().unwrap();
        for i in 0..10 {
            fs::write(tmp.path().join(format!("book{}.txt", i)), format!("body {}", i)).unwrap();
        }
        let manifest = fingerprint::directory_manifest(tmp.path()).unwrap();
        for hash in manifest.keys() {
            fake_index_dir(tmp.path(), hash, 10);
        }

        // Delete three sources; their directories become orphans.
        for i in 0..3 {
            fs::remove_file(tmp.path().join(format!("book{}.txt", i))).unwrap();
        }

        let report = reclaim(tmp.path(), false).unwrap();
        assert_eq!(report.orphans_found, 3);
        assert_eq!(report.removed.len(), 3);
        assert_eq!(report.kept, 7);

        // Reclaim invariant: every remaining fingerprint directory has a
        // matching source.
        let remaining = fingerprint::directory_manifest(tmp.path()).unwrap();
        for entry in fs::read_dir(tmp.path()).unwrap().flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.path().is_dir() && fingerprint::is_fingerprint(&name) {
                assert!(remaining.contains_key(&name));
            }
        }
    }
}
