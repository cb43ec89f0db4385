//! Content fingerprinting for source files.
//!
//! A fingerprint is the streaming SHA-256 digest of a file's raw bytes,
//! rendered as lowercase hex and truncated to 32 characters so it doubles
//! as the file's index directory name. Fingerprints depend only on content:
//! renaming a file never changes its fingerprint, and any byte change does.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

/// Directory names are exactly this many lowercase hex characters.
pub const FINGERPRINT_LEN: usize = 32;

const READ_BUF_BYTES: usize = 8 * 1024;

/// Compute the fingerprint of a file by streaming its bytes through the
/// digest. Never loads the whole file into memory.
pub fn fingerprint(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {} for hashing", path.display()))?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; READ_BUF_BYTES];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let digest = format!("{:x}", hasher.finalize());
    Ok(digest[..FINGERPRINT_LEN].to_string())
}

/// Returns true when `name` is a well-formed fingerprint. Used to decide
/// which directories the store and reclaimer are allowed to touch.
pub fn is_fingerprint(name: &str) -> bool {
    name.len() == FINGERPRINT_LEN && name.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Walk a directory non-recursively and map each source file's fingerprint
/// to its filename. Two files with identical content collapse to one entry,
/// which is how duplicates show up.
pub fn directory_manifest(dir: &Path) -> Result<BTreeMap<String, String>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?;

    let mut manifest = BTreeMap::new();
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() || !is_source_file(&path) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        let hash = fingerprint(&path)?;
        if let Some(previous) = manifest.insert(hash.clone(), name.clone()) {
            tracing::warn!(
                "Duplicate content in {}: {} and {} share fingerprint {}",
                dir.display(),
                previous,
                name,
                hash
            );
        }
    }
    Ok(manifest)
}

/// Source files are the indexable documents of a collection. Hidden files,
/// manifests, and index directories never count.
pub fn is_source_file(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n,
        None => return false,
    };
    if name.starts_with('.') {
        return false;
    }
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("pdf") | Some("txt")
    )
}
