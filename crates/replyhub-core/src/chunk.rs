//! Paragraph-boundary text chunker for knowledge ingestion.
//!
//! Uploaded documents and synced pages are split into pieces small enough
//! to embed and to excerpt. Splitting happens on blank lines (`\n\n`); a
//! paragraph longer than the limit is hard-split at the last newline or
//! space before the limit.
//!
//! # Example
//!
//! ```rust
//! use replyhub_core::chunk::split_text;
//!
//! let pieces = split_text("Opening hours.\n\nShipping rates.", 700);
//! assert_eq!(pieces.len(), 1);
//! assert_eq!(pieces[0].index, 0);
//! ```

use sha2::{Digest, Sha256};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// One piece of a larger text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPiece {
    /// Contiguous position starting at 0.
    pub index: usize,
    pub text: String,
    /// SHA-256 of `text`, hex-encoded.
    pub hash: String,
}

/// Split `text` into pieces of at most `max_tokens × 4` bytes.
///
/// Empty or whitespace-only input yields no pieces: there is nothing to
/// store for retrieval.
pub fn split_text(text: &str, max_tokens: usize) -> Vec<TextPiece> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if buf.is_empty() {
            trimmed.len()
        } else {
            buf.len() + 2 + trimmed.len()
        };
        if would_be > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }

        if trimmed.len() > max_chars {
            hard_split(trimmed, max_chars, &mut pieces);
        } else {
            if !buf.is_empty() {
                buf.push_str("\n\n");
            }
            buf.push_str(trimmed);
        }
    }

    if !buf.is_empty() {
        pieces.push(buf);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, text)| {
            let hash = hex::encode(Sha256::digest(text.as_bytes()));
            TextPiece { index, text, hash }
        })
        .collect()
}

fn hard_split(mut remaining: &str, max_chars: usize, out: &mut Vec<String>) {
    while !remaining.is_empty() {
        let limit = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
        let cut = if limit < remaining.len() {
            remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        } else {
            limit
        };
        // A single char wider than the limit still has to make progress.
        let cut = if cut == 0 {
            remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len())
        } else {
            cut
        };
        let piece = remaining[..cut].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[cut..];
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_piece() {
        let pieces = split_text("Hello, world!", 700);
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].text, "Hello, world!");
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(split_text("", 700).is_empty());
        assert!(split_text("\n\n   \n\n", 700).is_empty());
    }

    #[test]
    fn test_paragraphs_exceeding_limit_split() {
        let text = "This is paragraph one.\n\nThis is paragraph two.\n\nThis is paragraph three.";
        let pieces = split_text(text, 5);
        assert!(pieces.len() > 1);
        for (i, p) in pieces.iter().enumerate() {
            assert_eq!(p.index, i);
            assert!(p.text.len() <= 20);
        }
    }

    #[test]
    fn test_oversized_paragraph_hard_split_at_spaces() {
        let text = "word ".repeat(100);
        let pieces = split_text(&text, 10);
        assert!(pieces.len() > 1);
        assert!(pieces.iter().all(|p| !p.text.ends_with(' ') && p.text.len() <= 40));
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let pieces = split_text(text, 3);
        assert!(!pieces.is_empty());
        assert!(pieces.iter().all(|p| !p.text.is_empty()));
    }

    #[test]
    fn test_deterministic_hashes() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let a = split_text(text, 5);
        let b = split_text(text, 5);
        assert_eq!(a, b);
    }
}
