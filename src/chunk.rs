//! Overlapping boundary-aware text chunker.
//!
//! Splits source text into [`Chunk`]s of at most `chunk_size` characters.
//! Each cut prefers, in order, a paragraph break (`\n\n`), a line break, a
//! sentence end (`". "`), then a space; without any of those inside the
//! window it falls back to a hard cut. The next chunk starts `overlap`
//! characters before the previous cut, so concepts spanning a cut remain
//! retrievable and dropping each chunk's first `overlap` characters (after
//! the first chunk) reconstructs the source exactly.
//!
//! Lengths are counted in Unicode scalar values, never bytes.

use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Cut preferences, strongest first. Cuts land right after the separator.
const SEPARATORS: [&str; 4] = ["\n\n", "\n", ". ", " "];

/// Split text into overlapping chunks with contiguous indices starting at 0.
///
/// Empty or whitespace-only text yields no chunks; callers treat that as
/// "nothing to ingest". `overlap` is clamped below `chunk_size`.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<Chunk> {
    if chunk_size == 0 || text.trim().is_empty() {
        return Vec::new();
    }
    let overlap = overlap.min(chunk_size - 1);

    // Byte offset of every char, plus a sentinel for the end of the text.
    let offsets: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total = offsets.len() - 1;

    let mut chunks = Vec::new();
    let mut start = 0usize;
    loop {
        if total - start <= chunk_size {
            chunks.push(make_chunk(chunks.len() as i64, start, &text[offsets[start]..]));
            break;
        }

        let end = find_cut(text, &offsets, start, start + overlap + 1, start + chunk_size);
        chunks.push(make_chunk(
            chunks.len() as i64,
            start,
            &text[offsets[start]..offsets[end]],
        ));
        start = end - overlap;
    }

    chunks
}

/// Pick the cut position (a char index) in `[min_end, window_end]`.
///
/// `min_end > start + overlap` guarantees the next chunk starts after this
/// one did.
fn find_cut(text: &str, offsets: &[usize], start: usize, min_end: usize, window_end: usize) -> usize {
    let window_start_byte = offsets[start];
    let window = &text[window_start_byte..offsets[window_end]];

    for sep in SEPARATORS {
        if let Some(pos) = window.rfind(sep) {
            let cut_byte = window_start_byte + pos + sep.len();
            // Separators are ASCII, so the cut is always a char boundary.
            if let Ok(cut) = offsets.binary_search(&cut_byte) {
                if cut >= min_end {
                    return cut;
                }
            }
        }
    }

    window_end
}

fn make_chunk(index: i64, start: usize, text: &str) -> Chunk {
    Chunk {
        index,
        start,
        text: text.to_string(),
        hash: hash_text(text),
    }
}

/// SHA-256 of a text, hex encoded.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn char_len(s: &str) -> usize {
        s.chars().count()
    }

    /// Rebuild the source by dropping each later chunk's overlap prefix.
    fn reassemble(chunks: &[Chunk], overlap: usize) -> String {
        let mut out = String::new();
        for (i, c) in chunks.iter().enumerate() {
            if i == 0 {
                out.push_str(&c.text);
            } else {
                out.extend(c.text.chars().skip(overlap));
            }
        }
        out
    }

    fn long_text() -> String {
        (0..40)
            .map(|i| {
                format!(
                    "Paragraph {} talks about topic {}. It has a second sentence about detail {}.",
                    i,
                    i * 3,
                    i * 7
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", 1000, 200);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn test_empty_and_whitespace_yield_nothing() {
        assert!(chunk_text("", 1000, 200).is_empty());
        assert!(chunk_text("   \n\n\t  ", 1000, 200).is_empty());
    }

    #[test]
    fn test_lengths_bounded_by_chunk_size() {
        let text = long_text();
        let chunks = chunk_text(&text, 120, 30);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(char_len(&c.text) <= 120, "chunk too long: {}", char_len(&c.text));
        }
    }

    #[test]
    fn test_consecutive_chunks_share_overlap() {
        let text = long_text();
        let overlap = 30;
        let chunks = chunk_text(&text, 120, overlap);
        for pair in chunks.windows(2) {
            let prev: Vec<char> = pair[0].text.chars().collect();
            let tail: String = prev[prev.len() - overlap..].iter().collect();
            let head: String = pair[1].text.chars().take(overlap).collect();
            assert_eq!(tail, head);
        }
    }

    #[test]
    fn test_lossless_reconstruction() {
        let text = long_text();
        for (size, overlap) in [(120, 30), (50, 0), (300, 299), (1000, 200)] {
            let chunks = chunk_text(&text, size, overlap);
            assert_eq!(reassemble(&chunks, overlap), text, "size={} overlap={}", size, overlap);
        }
    }

    #[test]
    fn test_prefers_paragraph_boundary() {
        let text = format!("{}\n\n{}", "a".repeat(60), "b ".repeat(40));
        let chunks = chunk_text(&text, 80, 10);
        assert!(chunks[0].text.ends_with("\n\n"), "got {:?}", chunks[0].text);
    }

    #[test]
    fn test_prefers_sentence_over_space() {
        let text = "First sentence here. Second sentence follows with more words in it and more.";
        let chunks = chunk_text(text, 40, 5);
        assert_eq!(chunks[0].text, "First sentence here. ");
    }

    #[test]
    fn test_hard_cut_without_boundaries() {
        let text = "x".repeat(250);
        let chunks = chunk_text(&text, 100, 20);
        assert_eq!(chunks[0].text.len(), 100);
        assert_eq!(chunks[1].start, 80);
        assert_eq!(reassemble(&chunks, 20), text);
    }

    #[test]
    fn test_multibyte_text_counts_chars() {
        let text = "파리는 프랑스의 수도입니다. ".repeat(30);
        let chunks = chunk_text(&text, 50, 10);
        for c in &chunks {
            assert!(char_len(&c.text) <= 50);
        }
        assert_eq!(reassemble(&chunks, 10), text);
    }

    #[test]
    fn test_indices_contiguous_and_deterministic() {
        let text = long_text();
        let a = chunk_text(&text, 100, 25);
        let b = chunk_text(&text, 100, 25);
        assert_eq!(a, b);
        for (i, c) in a.iter().enumerate() {
            assert_eq!(c.index, i as i64);
            assert_eq!(c.hash, hash_text(&c.text));
        }
    }

    #[test]
    fn test_overlap_clamped_below_size() {
        let text = "word ".repeat(100);
        let chunks = chunk_text(&text, 10, 50);
        assert!(!chunks.is_empty());
        assert_eq!(reassemble(&chunks, 9), text);
    }
}
