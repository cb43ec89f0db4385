//! Plain-text production from source files.
//!
//! The build pipeline treats text production as an opaque step: given a
//! source path, return its text split into pages. `.txt` transcripts are
//! read directly with form-feed page breaks; `.pdf` files go through the
//! `pdf-extract` crate. Extraction never panics — a failed source returns
//! an error and the build records it as a warning.

use std::path::Path;

use crate::error::{Error, Result};

/// Form feed; both `pdftotext`-style transcripts and pdf-extract output
/// use it as the page delimiter.
const PAGE_BREAK: char = '\u{c}';

/// Extract the text of a source file as a list of pages. A file with no
/// page breaks yields a single page.
pub fn extract_pages(path: &Path) -> Result<Vec<String>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let text = match ext.as_str() {
        "txt" => read_text(path)?,
        "pdf" => extract_pdf(path)?,
        other => {
            return Err(Error::SourceUnavailable {
                path: path.to_path_buf(),
                reason: format!("unsupported source type: .{}", other),
            })
        }
    };

    if text.trim().is_empty() {
        return Err(Error::SourceUnavailable {
            path: path.to_path_buf(),
            reason: "no text content".to_string(),
        });
    }

    Ok(split_pages(&text))
}

fn read_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| Error::SourceUnavailable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn extract_pdf(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| Error::SourceUnavailable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    pdf_extract::extract_text_from_mem(&bytes).map_err(|e| Error::SourceUnavailable {
        path: path.to_path_buf(),
        reason: format!("PDF extraction failed: {}", e),
    })
}

fn split_pages(text: &str) -> Vec<String> {
    let pages: Vec<String> = text
        .split(PAGE_BREAK)
        .map(|p| p.to_string())
        .filter(|p| !p.trim().is_empty())
        .collect();
    if pages.is_empty() {
        vec![text.to_string()]
    } else {
        pages
    }
}
