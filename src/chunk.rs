//! Recursive character text splitter.
//!
//! Splits page text into [`Chunk`]s of at most `chunk_size` characters.
//! The splitter tries the coarsest separator first (`\n\n`), and only falls
//! back to finer ones (`\n`, space, single characters) for pieces that are
//! still too large. Adjacent pieces are merged greedily, and consecutive
//! chunks share up to `chunk_overlap` characters of trailing pieces so a
//! sentence cut at a chunk edge is still retrievable from either side.
//!
//! Each chunk receives a UUID plus a SHA-256 hash of its text for staleness
//! detection.

use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::models::{Chunk, ScrapedPage};

const SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

/// Split `text` into chunks of at most `chunk_size` characters.
pub fn split_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    if chunk_size == 0 {
        return Vec::new();
    }
    split_recursive(text, SEPARATORS, chunk_size, chunk_overlap)
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn split_recursive(
    text: &str,
    separators: &[&str],
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<String> {
    // First separator present in the text; "" always matches.
    let position = separators
        .iter()
        .position(|sep| sep.is_empty() || text.contains(sep))
        .unwrap_or(separators.len().saturating_sub(1));
    let separator = separators.get(position).copied().unwrap_or("");
    let finer = separators.get(position + 1..).unwrap_or(&[]);

    let splits: Vec<&str> = if separator.is_empty() {
        text.char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect()
    } else {
        text.split(separator).filter(|s| !s.is_empty()).collect()
    };

    let mut chunks = Vec::new();
    let mut fitting: Vec<&str> = Vec::new();

    for piece in splits {
        if char_len(piece) <= chunk_size {
            fitting.push(piece);
            continue;
        }

        if !fitting.is_empty() {
            chunks.extend(merge_splits(&fitting, separator, chunk_size, chunk_overlap));
            fitting.clear();
        }
        if finer.is_empty() {
            chunks.push(piece.to_string());
        } else {
            chunks.extend(split_recursive(piece, finer, chunk_size, chunk_overlap));
        }
    }

    if !fitting.is_empty() {
        chunks.extend(merge_splits(&fitting, separator, chunk_size, chunk_overlap));
    }

    chunks
}

/// Greedily join pieces up to `chunk_size`, carrying an overlap window.
fn merge_splits(
    splits: &[&str],
    separator: &str,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<String> {
    let sep_len = char_len(separator);
    let mut merged = Vec::new();
    let mut window: VecDeque<&str> = VecDeque::new();
    let mut total = 0usize;

    for &piece in splits {
        let len = char_len(piece);
        let joiner = if window.is_empty() { 0 } else { sep_len };

        if total + len + joiner > chunk_size && !window.is_empty() {
            push_joined(&mut merged, &window, separator);

            // Shrink to the overlap, and until the next piece fits.
            while total > chunk_overlap || (total > 0 && total + sep_len + len > chunk_size) {
                let Some(front) = window.pop_front() else {
                    break;
                };
                let freed = if window.is_empty() { 0 } else { sep_len };
                total -= char_len(front) + freed;
            }
        }

        let joiner = if window.is_empty() { 0 } else { sep_len };
        window.push_back(piece);
        total += len + joiner;
    }

    push_joined(&mut merged, &window, separator);
    merged
}

fn push_joined(out: &mut Vec<String>, window: &VecDeque<&str>, separator: &str) {
    let joined = window.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Chunk every page of a crawl. Indices are contiguous across pages,
/// starting at 0, in page order.
pub fn chunk_pages(session_id: &str, pages: &[ScrapedPage], config: &ChunkingConfig) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut chunk_index: i64 = 0;

    for page in pages {
        for text in split_text(&page.content, config.chunk_size, config.chunk_overlap) {
            chunks.push(make_chunk(session_id, page, chunk_index, &text));
            chunk_index += 1;
        }
    }

    chunks
}

fn make_chunk(session_id: &str, page: &ScrapedPage, index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        page_url: page.url.clone(),
        page_title: page.title.clone(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(url: &str, content: &str) -> ScrapedPage {
        ScrapedPage {
            url: url.to_string(),
            title: Some("Title".to_string()),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = split_text("Hello, world!", 1000, 100);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_empty_text_no_chunks() {
        assert!(split_text("", 1000, 100).is_empty());
        assert!(split_text("  \n\n  ", 1000, 100).is_empty());
    }

    #[test]
    fn test_paragraphs_merged_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = split_text(text, 1000, 100);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], text);
    }

    #[test]
    fn test_overlap_between_chunks() {
        let chunks = split_text("aaa bbb ccc ddd eee", 7, 3);
        assert_eq!(chunks, vec!["aaa bbb", "bbb ccc", "ccc ddd", "ddd eee"]);
    }

    #[test]
    fn test_zero_overlap() {
        let chunks = split_text("aaa bbb ccc ddd", 7, 0);
        assert_eq!(chunks, vec!["aaa bbb", "ccc ddd"]);
    }

    #[test]
    fn test_chunks_never_exceed_size() {
        let text = "Lorem ipsum dolor sit amet, consectetur adipiscing elit.\n\
                    Sed do eiusmod tempor incididunt ut labore et dolore magna aliqua.\n\n\
                    Ut enim ad minim veniam, quis nostrud exercitation ullamco laboris."
            .repeat(5);
        for chunk in split_text(&text, 60, 10) {
            assert!(chunk.chars().count() <= 60, "{chunk:?}");
        }
    }

    #[test]
    fn test_long_word_split_by_characters() {
        let chunks = split_text(&"x".repeat(25), 10, 0);
        assert_eq!(chunks, vec!["x".repeat(10), "x".repeat(10), "x".repeat(5)]);
    }

    #[test]
    fn test_multibyte_characters() {
        let chunks = split_text(&"é".repeat(12), 5, 0);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 5));
    }

    #[test]
    fn test_deterministic() {
        let text = "one two three four five six seven eight nine ten".repeat(20);
        assert_eq!(split_text(&text, 50, 10), split_text(&text, 50, 10));
    }

    #[test]
    fn test_chunk_pages_contiguous_indices() {
        let config = ChunkingConfig {
            chunk_size: 20,
            chunk_overlap: 0,
        };
        let pages = vec![
            page("https://example.com/", "alpha beta gamma delta epsilon zeta"),
            page("https://example.com/b", "eta theta iota"),
        ];
        let chunks = chunk_pages("s1", &pages, &config);
        assert!(chunks.len() >= 3);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
            assert_eq!(c.session_id, "s1");
        }
        let last = chunks.last().unwrap();
        assert_eq!(last.page_url, "https://example.com/b");
        assert_eq!(last.text, "eta theta iota");
    }

    #[test]
    fn test_hash_deterministic() {
        let config = ChunkingConfig::default();
        let pages = vec![page("https://example.com/", "Same text here.")];
        let c1 = chunk_pages("s1", &pages, &config);
        let c2 = chunk_pages("s2", &pages, &config);
        assert_eq!(c1[0].hash, c2[0].hash);
        assert_ne!(c1[0].id, c2[0].id);
    }
}
