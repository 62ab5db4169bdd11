//! Overlapping chunking and anchor hashes
//!
//! Chunks are byte spans into the original text, sized in chars. Boundaries
//! prefer a blank line, then a line break, then any whitespace in the second
//! half of the window, and always fall on char boundaries.

use crate::analysis::take_chars;

/// One chunk of a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub start: usize,
    pub end: usize,
    pub text: String,
    /// Anchor hash of `text`
    pub anchor: u64,
}

/// Stable 64-bit hash of a chunk's exact text. The first eight bytes of a
/// blake3 digest, so it is identical across platforms and builds.
pub fn anchor_hash(text: &str) -> u64 {
    let digest = blake3::hash(text.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Split `text` into chunks of at most `chunk_size` chars that overlap by
/// roughly `overlap` chars. Whitespace-only spans are dropped.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<TextChunk> {
    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size / 2);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = start + take_chars(&text[start..], chunk_size).len();
        if end < text.len() {
            end = break_point(text, start, end);
        }

        let span = &text[start..end];
        if !span.trim().is_empty() {
            chunks.push(TextChunk {
                start,
                end,
                text: span.to_string(),
                anchor: anchor_hash(span),
            });
        }

        if end >= text.len() {
            break;
        }

        let next = end - tail_len(span, overlap);
        start = if next > start { next } else { end };
    }

    chunks
}

/// Byte length of the last `chars` chars of `span`
fn tail_len(span: &str, chars: usize) -> usize {
    if chars == 0 {
        return 0;
    }
    span.char_indices()
        .rev()
        .nth(chars - 1)
        .map_or(span.len(), |(i, _)| span.len() - i)
}

/// Pick a natural boundary inside `text[start..end]`, searching only the
/// second half of the window
fn break_point(text: &str, start: usize, end: usize) -> usize {
    let window = &text[start..end];
    let min = window.len() / 2;

    let candidates = [
        window.rfind("\n\n").map(|i| i + 2),
        window.rfind('\n').map(|i| i + 1),
        window
            .rfind(char::is_whitespace)
            .map(|i| i + window[i..].chars().next().map_or(1, char::len_utf8)),
    ];

    candidates
        .into_iter()
        .flatten()
        .find(|&i| i > min)
        .map(|i| start + i)
        .unwrap_or(end)
}
