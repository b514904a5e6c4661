//! Paragraph-boundary text chunker.
//!
//! Splits merged segment text into [`TextChunk`]s that respect a configurable
//! `max_tokens` limit. Splitting occurs on paragraph boundaries (`\n\n`) so a
//! transcript and its caption stay together when they fit.
//!
//! Chunks remember the segment they came from, which lets the index stage
//! fold chunk embeddings back into one text vector per segment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextChunk {
    /// Position among all chunks of the video, contiguous from 0.
    pub chunk_index: usize,
    pub segment_index: usize,
    pub text: String,
}

/// Split text on paragraph boundaries, respecting `max_tokens`.
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;

    let mut chunks = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        // If adding this paragraph would exceed max, flush current buffer
        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };
        if would_be > max_chars && !current_buf.is_empty() {
            chunks.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            // Hard split, preferring newline or space boundaries.
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = floor_char_boundary(remaining, max_chars);
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                let piece = remaining[..actual_split].trim();
                if !piece.is_empty() {
                    chunks.push(piece.to_string());
                }
                remaining = &remaining[actual_split..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        chunks.push(current_buf);
    }
    chunks
}

/// Chunk every segment's merged text. Segments with no text produce no
/// chunks; chunk indices are contiguous across the whole video.
pub fn chunk_segments(segments: &BTreeMap<usize, String>, max_tokens: usize) -> Vec<TextChunk> {
    let mut out = Vec::new();
    for (&segment_index, text) in segments {
        for piece in chunk_text(text, max_tokens) {
            out.push(TextChunk {
                chunk_index: out.len(),
                segment_index,
                text: piece,
            });
        }
    }
    out
}

/// Largest index `<= max` that lies on a char boundary (at least one char).
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    if idx == 0 {
        s.chars().next().map(char::len_utf8).unwrap_or(s.len())
    } else {
        idx
    }
}
