//! Recursive-separator text chunker.
//!
//! Splits page text into chunks of roughly `chunk_size` characters with
//! `chunk_overlap` characters carried over between neighbors. Splitting
//! walks a separator hierarchy — paragraph, line, sentence, word — and only
//! falls back to a hard character split when a single word exceeds the
//! limit. Chunk ordinals are global per source, so the (fingerprint,
//! ordinal) pair identifies a chunk across shards.

use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::models::StoredChunk;

/// Separator hierarchy, coarsest first. The empty string means
/// "split between characters" and is the terminal fallback.
const SEPARATORS: [&str; 5] = ["\n\n", "\n", ". ", " ", ""];

/// Split one body of text into chunk strings honoring the size limit and
/// neighbor overlap. Deterministic for identical input and settings.
pub fn split_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let pieces = split_recursive(text, chunk_size, &SEPARATORS);
    merge_pieces(&pieces, chunk_size, chunk_overlap)
}

/// Chunk a source's pages into [`StoredChunk`]s. Page numbers are 1-indexed;
/// ordinals run across the whole source.
pub fn chunk_pages(
    source_name: &str,
    pages: &[String],
    config: &ChunkingConfig,
) -> Vec<StoredChunk> {
    let paged = pages.len() > 1;
    let mut chunks = Vec::new();
    let mut ordinal = 0usize;

    for (page_idx, page_text) in pages.iter().enumerate() {
        for text in split_text(page_text, config.chunk_size, config.chunk_overlap) {
            if text.trim().is_empty() {
                continue;
            }
            chunks.push(StoredChunk {
                id: Uuid::new_v4().to_string(),
                source: source_name.to_string(),
                page: paged.then_some(page_idx + 1),
                ordinal,
                text,
            });
            ordinal += 1;
        }
    }

    chunks
}

/// Break text into pieces no longer than `max_len`, preferring the coarsest
/// separator that works. Pieces keep their natural order.
fn split_recursive(text: &str, max_len: usize, separators: &[&str]) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if char_len(trimmed) <= max_len {
        return vec![trimmed.to_string()];
    }

    let (sep, rest) = match separators.split_first() {
        Some(pair) => pair,
        None => return hard_split(trimmed, max_len),
    };

    if sep.is_empty() {
        return hard_split(trimmed, max_len);
    }

    let mut pieces = Vec::new();
    for part in trimmed.split(sep) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if char_len(part) <= max_len {
            pieces.push(part.to_string());
        } else {
            pieces.extend(split_recursive(part, max_len, rest));
        }
    }

    if pieces.is_empty() {
        hard_split(trimmed, max_len)
    } else {
        pieces
    }
}

/// Greedily pack pieces into chunks up to `chunk_size`, seeding each new
/// chunk with the tail of the previous one so neighbors share roughly
/// `overlap` characters of context.
fn merge_pieces(pieces: &[String], chunk_size: usize, overlap: usize) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    // Whether `current` holds anything beyond carried overlap. A buffer of
    // pure carry must never flush on its own: it would duplicate the tail
    // of the previous chunk.
    let mut fresh = false;

    for piece in pieces {
        let projected = if current.is_empty() {
            char_len(piece)
        } else {
            char_len(&current) + 1 + char_len(piece)
        };

        if projected > chunk_size && fresh {
            let carry = overlap_tail(&current, overlap);
            chunks.push(std::mem::take(&mut current));
            current = carry;
            fresh = false;
        }

        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(piece);
        fresh = true;
    }

    if fresh && !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Last `overlap` characters of a chunk, snapped forward to a word boundary
/// so the carried context starts cleanly.
fn overlap_tail(chunk: &str, overlap: usize) -> String {
    if overlap == 0 {
        return String::new();
    }
    let chars: Vec<char> = chunk.chars().collect();
    if chars.len() <= overlap {
        return chunk.to_string();
    }
    let tail: String = chars[chars.len() - overlap..].iter().collect();
    match tail.find(' ') {
        Some(pos) => tail[pos + 1..].to_string(),
        None => tail,
    }
}

fn hard_split(text: &str, max_len: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_len.max(1))
        .map(|c| c.iter().collect::<String>())
        .collect()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(chunk_size: usize, chunk_overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size,
            chunk_overlap,
        }
    }

    #[test]
    fn small_text_single_chunk() {
        let chunks = split_text("Hello, world!", 1200, 150);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn empty_text_no_chunks() {
        assert!(split_text("", 1200, 150).is_empty());
        assert!(split_text("   \n\n  ", 1200, 150).is_empty());
    }

    #[test]
    fn splits_on_paragraphs_first() {
        let text = format!("{}\n\n{}", "a".repeat(50), "b".repeat(50));
        let chunks = split_text(&text, 60, 0);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].chars().all(|c| c == 'a'));
        assert!(chunks[1].chars().all(|c| c == 'b'));
    }

    #[test]
    fn respects_chunk_size_limit() {
        let text = (0..40)
            .map(|i| format!("Sentence number {} is here. ", i))
            .collect::<String>();
        for chunk in split_text(&text, 120, 20) {
            assert!(chunk.chars().count() <= 120, "oversized chunk: {:?}", chunk);
        }
    }

    #[test]
    fn neighbors_share_overlap() {
        let text = (0..30)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = split_text(&text, 60, 20);
        assert!(chunks.len() > 1);
        for window in chunks.windows(2) {
            let tail_words: Vec<&str> = window[0].split_whitespace().rev().take(2).collect();
            let shared = tail_words.iter().any(|w| window[1].contains(w));
            assert!(shared, "no overlap between {:?} and {:?}", window[0], window[1]);
        }
    }

    #[test]
    fn oversized_word_hard_splits() {
        let text = "x".repeat(300);
        let chunks = split_text(&text, 100, 0);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 100));
    }

    #[test]
    fn deterministic() {
        let text = "Alpha beta gamma. Delta epsilon zeta.\n\nEta theta iota kappa.";
        let a = split_text(text, 30, 10);
        let b = split_text(text, 30, 10);
        assert_eq!(a, b);
    }

    #[test]
    fn pages_get_numbers_and_global_ordinals() {
        let pages = vec![
            "First page text that is short.".to_string(),
            "Second page text that is short.".to_string(),
        ];
        let chunks = chunk_pages("book.pdf", &pages, &config(1200, 150));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].page, Some(1));
        assert_eq!(chunks[1].page, Some(2));
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[1].ordinal, 1);
        assert_eq!(chunks[0].source, "book.pdf");
    }

    #[test]
    fn single_page_has_no_page_number() {
        let pages = vec!["Only one page here.".to_string()];
        let chunks = chunk_pages("notes.txt", &pages, &config(1200, 150));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].page, None);
    }
}
