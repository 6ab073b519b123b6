//! Structure-aware, token-bounded chunker with overlap.
//!
//! Splits a [`Document`]'s text into [`Chunk`]s whose token counts respect
//! [`ChunkerConfig`]. Chunk text is always a verbatim slice of the source,
//! so formatting inside a chunk (line breaks, lists, code) survives.
//!
//! # Algorithm
//!
//! 1. Split into sections at markdown headings (`#` to `######` at the start
//!    of a line, followed by text on the same line).
//! 2. A section that fits `max_tokens` becomes one piece. Larger sections
//!    accumulate paragraphs (blank-line separated) until the next one would
//!    overflow.
//! 3. A paragraph longer than `max_tokens` is hard-split at token
//!    boundaries; those pieces are flagged [`Chunk::hard_split`].
//! 4. Pieces under `min_tokens` are merged into the previous piece (the next
//!    one for the first piece). When the merge would overflow, the boundary
//!    moves instead so both sides end up within bounds.
//! 5. Every piece after the first is prefixed with the trailing tokens of the
//!    previous piece, clamped so the chunk still fits `max_tokens`.
//!
//! Empty or whitespace-only documents produce no chunks.
//!
//! # Example
//!
//! ```rust
//! use vault_rag_core::chunk::{chunk_text, ChunkerConfig};
//!
//! let config = ChunkerConfig { max_tokens: 50, overlap_tokens: 0, min_tokens: 5 };
//! let pieces = chunk_text("Hello world.\n\nSecond paragraph.", &config);
//! assert_eq!(pieces.len(), 1);
//! assert_eq!(pieces[0].text, "Hello world.\n\nSecond paragraph.");
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;
use crate::models::{Chunk, Document};
use crate::tokens::{token_spans, TokenSpan};

/// Chunk size bounds, all in tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub max_tokens: usize,
    /// Tokens repeated from the end of the previous chunk.
    pub overlap_tokens: usize,
    /// Smallest chunk allowed, except for a document's only chunk.
    pub min_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: 800,
            overlap_tokens: 150,
            min_tokens: 100,
        }
    }
}

impl ChunkerConfig {
    /// `2 * min_tokens <= max_tokens` guarantees an undersized piece can
    /// always borrow tokens from a neighbour without pushing it under the
    /// minimum.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tokens == 0 {
            return Err(ConfigError("chunking.max_tokens must be > 0".into()));
        }
        if self.overlap_tokens >= self.max_tokens {
            return Err(ConfigError(format!(
                "chunking.overlap_tokens ({}) must be less than max_tokens ({})",
                self.overlap_tokens, self.max_tokens
            )));
        }
        if self.min_tokens.saturating_mul(2) > self.max_tokens {
            return Err(ConfigError(format!(
                "chunking.min_tokens ({}) must be at most half of max_tokens ({})",
                self.min_tokens, self.max_tokens
            )));
        }
        Ok(())
    }
}

/// A chunk before it is bound to a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPiece {
    pub text: String,
    pub token_count: usize,
    pub overlap_token_count: usize,
    pub hard_split: bool,
}

/// Chunk one document. Chunk IDs are `{document_id}#{index}` with
/// contiguous indices from 0.
pub fn chunk_document(doc: &Document, config: &ChunkerConfig) -> Vec<Chunk> {
    let metadata = doc.chunk_metadata();
    let pieces = chunk_text(&doc.full_text, config);
    let hard = pieces.iter().filter(|p| p.hard_split).count();
    if hard > 0 {
        tracing::debug!(
            document_id = %doc.id,
            pieces = hard,
            "oversized paragraph hard-split at token boundaries"
        );
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| Chunk {
            id: Chunk::make_id(&doc.id, index),
            document_id: doc.id.clone(),
            sequence_index: index,
            hash: content_hash(&piece.text),
            text: piece.text,
            token_count: piece.token_count,
            overlap_token_count: piece.overlap_token_count,
            hard_split: piece.hard_split,
            metadata: metadata.clone(),
        })
        .collect()
}

/// Split raw text into bounded pieces.
pub fn chunk_text(text: &str, config: &ChunkerConfig) -> Vec<TextPiece> {
    let layout = Layout::new(text);
    if layout.spans.is_empty() {
        return Vec::new();
    }
    let max = config.max_tokens.max(1);

    let mut pieces = Vec::new();
    for section in layout.sections() {
        layout.split_section(section, max, &mut pieces);
    }
    enforce_min(&mut pieces, config.min_tokens, max);

    let mut out = Vec::with_capacity(pieces.len());
    for (i, piece) in pieces.iter().enumerate() {
        let overlap = if i == 0 {
            0
        } else {
            config
                .overlap_tokens
                .min(pieces[i - 1].len())
                .min(max.saturating_sub(piece.len()))
        };
        let first = piece.start - overlap;
        let slice = &text[layout.spans[first].start..layout.spans[piece.end - 1].end];
        out.push(TextPiece {
            text: slice.to_string(),
            token_count: piece.len() + overlap,
            overlap_token_count: overlap,
            hard_split: piece.hard_split,
        });
    }
    out
}

/// SHA-256 of chunk text, hex encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Half-open token range `[start, end)`.
#[derive(Debug, Clone, Copy)]
struct Piece {
    start: usize,
    end: usize,
    hard_split: bool,
}

impl Piece {
    fn len(&self) -> usize {
        self.end - self.start
    }
}

struct Layout<'a> {
    text: &'a str,
    spans: Vec<TokenSpan>,
}

impl<'a> Layout<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            spans: token_spans(text),
        }
    }

    fn token(&self, i: usize) -> &'a str {
        &self.text[self.spans[i].start..self.spans[i].end]
    }

    /// Whitespace between token `i - 1` and token `i`.
    fn gap_before(&self, i: usize) -> &'a str {
        let from = if i == 0 { 0 } else { self.spans[i - 1].end };
        &self.text[from..self.spans[i].start]
    }

    fn starts_line(&self, i: usize) -> bool {
        let gap = self.gap_before(i);
        match gap.rfind('\n') {
            Some(pos) => pos + 1 == gap.len(),
            None => i == 0 && gap.is_empty(),
        }
    }

    fn is_heading(&self, i: usize) -> bool {
        let tok = self.token(i);
        tok.len() <= 6
            && tok.bytes().all(|b| b == b'#')
            && self.starts_line(i)
            && i + 1 < self.spans.len()
            && !self.gap_before(i + 1).contains('\n')
    }

    fn starts_paragraph(&self, i: usize) -> bool {
        i > 0 && self.gap_before(i).matches('\n').count() >= 2
    }

    fn sections(&self) -> Vec<(usize, usize)> {
        let mut sections = Vec::new();
        let mut start = 0;
        for i in 1..self.spans.len() {
            if self.is_heading(i) {
                sections.push((start, i));
                start = i;
            }
        }
        sections.push((start, self.spans.len()));
        sections
    }

    fn split_section(&self, (start, end): (usize, usize), max: usize, out: &mut Vec<Piece>) {
        if end - start <= max {
            out.push(Piece {
                start,
                end,
                hard_split: false,
            });
            return;
        }

        let mut paragraphs = Vec::new();
        let mut para_start = start;
        for i in start + 1..end {
            if self.starts_paragraph(i) {
                paragraphs.push((para_start, i));
                para_start = i;
            }
        }
        paragraphs.push((para_start, end));

        let mut current: Option<Piece> = None;
        for (p_start, p_end) in paragraphs {
            let p_len = p_end - p_start;
            if p_len > max {
                out.extend(current.take());
                let mut at = p_start;
                while at < p_end {
                    let cut = (at + max).min(p_end);
                    out.push(Piece {
                        start: at,
                        end: cut,
                        hard_split: true,
                    });
                    at = cut;
                }
                continue;
            }
            match current.as_mut() {
                Some(piece) if piece.len() + p_len <= max => piece.end = p_end,
                _ => {
                    out.extend(current.take());
                    current = Some(Piece {
                        start: p_start,
                        end: p_end,
                        hard_split: false,
                    });
                }
            }
        }
        out.extend(current);
    }
}

/// Merge or rebalance pieces shorter than `min`. A lone piece is left as is.
fn enforce_min(pieces: &mut Vec<Piece>, min: usize, max: usize) {
    let mut i = 0;
    while i < pieces.len() && pieces.len() > 1 {
        let len = pieces[i].len();
        if len >= min {
            i += 1;
            continue;
        }
        let need = min - len;

        if i > 0 {
            let prev = i - 1;
            if pieces[prev].len() + len <= max {
                pieces[prev].end = pieces[i].end;
                pieces[prev].hard_split |= pieces[i].hard_split;
                pieces.remove(i);
                continue;
            }
            if pieces[prev].len() >= min + need {
                pieces[prev].end -= need;
                pieces[i].start -= need;
            }
        } else {
            if len + pieces[1].len() <= max {
                pieces[1].start = pieces[0].start;
                pieces[1].hard_split |= pieces[0].hard_split;
                pieces.remove(0);
                continue;
            }
            if pieces[1].len() >= min + need {
                pieces[0].end += need;
                pieces[1].start += need;
            }
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentMetadata;
    use crate::tokens::{count_tokens, normalize};

    fn words(prefix: &str, n: usize) -> String {
        (0..n)
            .map(|i| format!("{prefix}{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn config(max: usize, overlap: usize, min: usize) -> ChunkerConfig {
        ChunkerConfig {
            max_tokens: max,
            overlap_tokens: overlap,
            min_tokens: min,
        }
    }

    fn document(text: &str) -> Document {
        Document {
            id: "spiritual_power-of-now_presence".into(),
            title: "Presence".into(),
            category: "Spiritual".into(),
            book: Some("The Power of Now".into()),
            chapter: None,
            full_text: text.to_string(),
            outbound_links: Default::default(),
            metadata: DocumentMetadata {
                source_path: "Spiritual/The Power of Now/Presence.md".into(),
                modified_at: None,
                word_count: count_tokens(text),
            },
        }
    }

    #[test]
    fn test_validate_config() {
        assert!(ChunkerConfig::default().validate().is_ok());
        assert!(config(0, 0, 0).validate().is_err());
        assert!(config(100, 100, 10).validate().is_err());
        assert!(config(100, 10, 51).validate().is_err());
        assert!(config(100, 10, 50).validate().is_ok());
    }

    #[test]
    fn test_empty_and_whitespace_yield_nothing() {
        assert!(chunk_text("", &ChunkerConfig::default()).is_empty());
        assert!(chunk_text("  \n\n\t ", &ChunkerConfig::default()).is_empty());
    }

    #[test]
    fn test_small_text_single_chunk() {
        let pieces = chunk_text("Hello, world!", &config(50, 10, 20));
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].text, "Hello, world!");
        assert_eq!(pieces[0].token_count, 2);
        assert_eq!(pieces[0].overlap_token_count, 0);
    }

    #[test]
    fn test_headed_sections_with_overlap() {
        // Each section: "# Title" (2 tokens) + 198 body words.
        let text = (0..3)
            .map(|s| format!("# Section{s}\n{}", words(&format!("s{s}w"), 198)))
            .collect::<Vec<_>>()
            .join("\n\n");
        let doc = document(&text);
        let chunks = chunk_document(&doc, &config(250, 50, 100));

        assert_eq!(chunks.len(), 3);
        for pair in chunks.windows(2) {
            let prev_primary = pair[0].primary_text();
            let prev: Vec<&str> = prev_primary.split_whitespace().collect();
            let head: Vec<&str> = pair[1].text.split_whitespace().take(50).collect();
            assert_eq!(head, prev[prev.len() - 50..].to_vec());
            assert_eq!(pair[1].overlap_token_count, 50);
            assert_eq!(pair[1].token_count, 250);
        }
        assert!(chunks[1].primary_text().starts_with("# Section1"));
    }

    #[test]
    fn test_large_section_split_on_paragraphs() {
        let text = format!(
            "{}\n\n{}\n\n{}",
            words("a", 40),
            words("b", 40),
            words("c", 40)
        );
        let pieces = chunk_text(&text, &config(90, 0, 20));
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].token_count, 80);
        assert_eq!(pieces[1].token_count, 40);
        assert!(pieces[1].text.starts_with("c0"));
        assert!(pieces.iter().all(|p| !p.hard_split));
    }

    #[test]
    fn test_oversized_paragraph_is_hard_split() {
        let text = words("w", 250);
        let pieces = chunk_text(&text, &config(100, 0, 10));
        assert_eq!(pieces.len(), 3);
        assert!(pieces.iter().all(|p| p.hard_split));
        assert_eq!(pieces[0].token_count, 100);
        assert_eq!(pieces[2].token_count, 50);
        let joined = pieces
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(normalize(&joined), normalize(&text));
    }

    #[test]
    fn test_small_tail_merges_into_previous() {
        let text = format!("# A\n{}\n\n# B\n{}", words("a", 30), words("b", 3));
        let pieces = chunk_text(&text, &config(100, 0, 10));
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].token_count, 37);
    }

    #[test]
    fn test_small_tail_rebalanced_when_merge_overflows() {
        let text = format!("{}\n\n{}", words("a", 95), words("b", 10));
        let pieces = chunk_text(&text, &config(100, 0, 20));
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[0].token_count, 85);
        assert_eq!(pieces[1].token_count, 20);
        assert!(pieces[1].text.starts_with("a85"));
    }

    #[test]
    fn test_small_head_merges_into_next() {
        let text = format!("# Intro\n\n# Body\n{}", words("b", 30));
        let pieces = chunk_text(&text, &config(100, 0, 10));
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].text.starts_with("# Intro"));
    }

    #[test]
    fn test_overlap_clamped_to_max() {
        let text = format!("# A\n{}\n\n# B\n{}", words("a", 48), words("b", 48));
        let pieces = chunk_text(&text, &config(55, 20, 10));
        assert_eq!(pieces.len(), 2);
        assert_eq!(pieces[1].overlap_token_count, 5);
        assert_eq!(pieces[1].token_count, 55);
    }

    #[test]
    fn test_heading_requires_line_start() {
        let text = "Use # sparingly in prose.";
        let layout = Layout::new(text);
        assert!((0..layout.spans.len()).all(|i| !layout.is_heading(i)));
        let layout = Layout::new("intro\n## Next part");
        assert!(layout.is_heading(1));
    }

    #[test]
    fn test_chunk_ids_contiguous_and_hashed() {
        let text = (0..20)
            .map(|i| words(&format!("p{i}x"), 15))
            .collect::<Vec<_>>()
            .join("\n\n");
        let doc = document(&text);
        let chunks = chunk_document(&doc, &config(40, 5, 10));
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.sequence_index, i);
            assert_eq!(c.id, format!("{}#{i}", doc.id));
            assert_eq!(c.hash, content_hash(&c.text));
            assert_eq!(c.metadata.book.as_deref(), Some("The Power of Now"));
        }
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────┐\n│ Hello wörld │\n└──────┘";
        let pieces = chunk_text(text, &config(2, 0, 1));
        assert!(!pieces.is_empty());
        let joined = pieces
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(normalize(&joined), normalize(text));
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let c1 = chunk_text(text, &config(2, 1, 1));
        let c2 = chunk_text(text, &config(2, 1, 1));
        assert_eq!(c1, c2);
    }
}
