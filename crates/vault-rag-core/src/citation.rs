//! Citation markers: parsing and resolution.
//!
//! Generated answers cite sources inline as `[Source: <title>]`. Markers
//! are read with a small hand-written parser instead of a regex so nested
//! or broken brackets fail predictably:
//!
//! ```text
//! marker := "[" ws* "source" ws* ":" ws* labels "]"    keyword is case-insensitive
//! labels := label (";" label)*
//! label  := text with balanced "[" "]", no newline
//! ```
//!
//! A marker that is unterminated, spans a newline, or carries no non-empty
//! label is skipped, and scanning resumes right after its opening bracket.
//!
//! Each label resolves against the chunks that were actually in the
//! context, in context order: an exact match on the normalized title or
//! source label first, then a whole-word containment match in either
//! direction. Containment is checked on word boundaries, not as a raw
//! substring, so `Pow` does not resolve to `Power` while `Ego` still
//! resolves to `Notes - Ego`. Labels that match nothing are dropped; each
//! chunk is cited at most once.

use std::collections::HashSet;

use crate::index::ChunkStore;
use crate::models::{Citation, RetrievedChunk};

const KEYWORD: &str = "source";

/// Character budget for [`Citation::snippet`].
pub const SNIPPET_CHARS: usize = 200;

/// One parsed marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker<'a> {
    /// Byte offset of the opening `[`.
    pub offset: usize,
    pub labels: Vec<&'a str>,
}

/// Find every well-formed marker in `text`, in order.
pub fn parse_markers(text: &str) -> Vec<Marker<'_>> {
    let mut markers = Vec::new();
    let mut pos = 0;
    while let Some(rel) = text[pos..].find('[') {
        let open = pos + rel;
        match parse_marker(text, open) {
            Some((marker, end)) => {
                markers.push(marker);
                pos = end;
            }
            None => pos = open + 1,
        }
    }
    markers
}

/// Parse a marker whose `[` sits at `open`. Returns it with the byte offset
/// just past its closing `]`.
fn parse_marker(text: &str, open: usize) -> Option<(Marker<'_>, usize)> {
    let mut at = skip_inline_ws(text, open + 1);
    let keyword = text.get(at..at + KEYWORD.len())?;
    if !keyword.eq_ignore_ascii_case(KEYWORD) {
        return None;
    }
    at = skip_inline_ws(text, at + KEYWORD.len());
    if !text[at..].starts_with(':') {
        return None;
    }
    let body_start = at + 1;

    let mut depth = 1usize;
    let mut body_end = None;
    for (i, ch) in text[body_start..].char_indices() {
        match ch {
            '\n' => return None,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    body_end = Some(body_start + i);
                    break;
                }
            }
            _ => {}
        }
    }
    let body_end = body_end?;

    let labels: Vec<&str> = text[body_start..body_end]
        .split(';')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if labels.is_empty() {
        return None;
    }
    Some((
        Marker {
            offset: open,
            labels,
        },
        body_end + 1,
    ))
}

fn skip_inline_ws(text: &str, mut at: usize) -> usize {
    while let Some(ch) = text[at..].chars().next() {
        if ch == '\n' || !ch.is_whitespace() {
            break;
        }
        at += ch.len_utf8();
    }
    at
}

/// Lowercase, drop punctuation, collapse whitespace.
pub fn normalize_label(label: &str) -> String {
    label
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn contains_words(haystack: &str, needle: &str) -> bool {
    !needle.is_empty() && format!(" {haystack} ").contains(&format!(" {needle} "))
}

/// First words of `text` with whitespace collapsed, at most `max_chars`
/// characters plus a trailing `...` when anything was cut.
pub fn snippet(text: &str, max_chars: usize) -> String {
    let mut out = String::new();
    let mut len = 0;
    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        let needed = if out.is_empty() { word_len } else { word_len + 1 };
        if len + needed > max_chars {
            if out.is_empty() {
                out.extend(word.chars().take(max_chars));
            }
            out.push_str("...");
            return out;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
        len += needed;
    }
    out
}

/// Resolve one label to a context chunk index.
fn resolve(label: &str, keys: &[(String, String)]) -> Option<usize> {
    let wanted = normalize_label(label);
    if wanted.is_empty() {
        return None;
    }
    keys.iter()
        .position(|(title, source)| *title == wanted || *source == wanted)
        .or_else(|| {
            keys.iter().position(|(title, source)| {
                contains_words(title, &wanted)
                    || contains_words(source, &wanted)
                    || contains_words(&wanted, title)
                    || contains_words(&wanted, source)
            })
        })
}

/// Extract citations from `generated` against the chunks that were in the
/// prompt. Citations come out in order of first mention.
pub fn extract(generated: &str, context_used: &[RetrievedChunk]) -> Vec<Citation> {
    let keys: Vec<(String, String)> = context_used
        .iter()
        .map(|rc| {
            (
                normalize_label(&rc.chunk.metadata.title),
                normalize_label(&rc.chunk.source_label()),
            )
        })
        .collect();

    let mut seen: HashSet<&str> = HashSet::new();
    let mut citations = Vec::new();
    for marker in parse_markers(generated) {
        for label in marker.labels {
            let Some(i) = resolve(label, &keys) else {
                tracing::debug!(label, "citation label matches no context chunk");
                continue;
            };
            let rc = &context_used[i];
            if !seen.insert(rc.chunk.id.as_str()) {
                continue;
            }
            let meta = &rc.chunk.metadata;
            citations.push(Citation {
                source_title: meta.title.clone(),
                document_id: rc.chunk.document_id.clone(),
                chunk_id: rc.chunk.id.clone(),
                category: meta.category.clone(),
                book: meta.book.clone(),
                source_path: meta.source_path.clone(),
                relevance_score: rc.final_score,
                snippet: snippet(&rc.chunk.text, SNIPPET_CHARS),
                resolved: false,
            });
        }
    }
    citations
}

/// Keep only citations whose chunk is still in the store, marking them
/// resolved. Lookup failures drop the citation rather than failing.
pub async fn verify_citations(
    citations: Vec<Citation>,
    store: &dyn ChunkStore,
) -> Vec<Citation> {
    let mut verified = Vec::with_capacity(citations.len());
    for mut c in citations {
        match store.contains_chunk(&c.chunk_id).await {
            Ok(true) => {
                c.resolved = true;
                verified.push(c);
            }
            Ok(false) => {
                tracing::debug!(chunk_id = %c.chunk_id, "cited chunk no longer stored");
            }
            Err(e) => {
                tracing::debug!(chunk_id = %c.chunk_id, error = %e, "citation lookup failed");
            }
        }
    }
    verified
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, ChunkMetadata};
    use std::sync::Arc;

    fn rc(title: &str, book: Option<&str>, score: f64) -> RetrievedChunk {
        let doc = normalize_label(title).replace(' ', "-");
        RetrievedChunk {
            chunk: Arc::new(Chunk {
                id: format!("{doc}#0"),
                document_id: doc,
                sequence_index: 0,
                text: "body".into(),
                token_count: 1,
                overlap_token_count: 0,
                hard_split: false,
                hash: String::new(),
                metadata: ChunkMetadata {
                    title: title.into(),
                    book: book.map(Into::into),
                    category: "Spiritual".into(),
                    ..Default::default()
                },
            }),
            semantic_score: 0.5,
            keyword_score: 0.5,
            combined_score: 0.5,
            final_score: score,
        }
    }

    fn labels(text: &str) -> Vec<Vec<&str>> {
        parse_markers(text).into_iter().map(|m| m.labels).collect()
    }

    #[test]
    fn test_parse_simple_and_multi_label() {
        assert_eq!(labels("see [Source: Presence]."), vec![vec!["Presence"]]);
        assert_eq!(
            labels("[source : Ego ; Pain-Body] and [SOURCE:Now]"),
            vec![vec!["Ego", "Pain-Body"], vec!["Now"]]
        );
    }

    #[test]
    fn test_parse_balanced_nested_brackets() {
        assert_eq!(
            labels("[Source: Notes [draft] on Presence] tail"),
            vec![vec!["Notes [draft] on Presence"]]
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(labels("[Source: never closed").is_empty());
        assert!(labels("[Source: split\nacross lines]").is_empty());
        assert!(labels("[Source: ]").is_empty());
        assert!(labels("[Sources: Presence]").is_empty());
        assert!(labels("[Origin: Presence]").is_empty());
    }

    #[test]
    fn test_parse_resumes_after_malformed_open() {
        assert_eq!(
            labels("[[Source: Presence]"),
            vec![vec!["Presence"]]
        );
        assert_eq!(
            labels("[Source: broken\n[Source: Ego]"),
            vec![vec!["Ego"]]
        );
    }

    #[test]
    fn test_normalize_label() {
        assert_eq!(normalize_label("  A New-Earth:  Presence! "), "a new earth presence");
    }

    #[test]
    fn test_exact_title_resolves_with_final_score() {
        let ctx = vec![rc("A New Earth", None, 0.82)];
        let citations = extract("Be here now [Source: A New Earth].", &ctx);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].source_title, "A New Earth");
        assert_eq!(citations[0].relevance_score, 0.82);
    }

    #[test]
    fn test_unknown_label_yields_nothing() {
        let ctx = vec![rc("A New Earth", None, 0.82)];
        assert!(extract("[Source: Unknown Book]", &ctx).is_empty());
    }

    #[test]
    fn test_exact_beats_earlier_containment() {
        let ctx = vec![rc("The Ego Trap", None, 0.9), rc("Ego", None, 0.7)];
        let citations = extract("[Source: Ego]", &ctx);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].source_title, "Ego");
    }

    #[test]
    fn test_book_label_and_containment() {
        let ctx = vec![rc("Presence", Some("The Power of Now"), 0.6)];
        let full = extract("[Source: The Power of Now - Presence]", &ctx);
        assert_eq!(full.len(), 1);
        let book_only = extract("[Source: The Power of Now]", &ctx);
        assert_eq!(book_only.len(), 1);
        let partial_word = extract("[Source: Pow]", &ctx);
        assert!(partial_word.is_empty());
    }

    #[test]
    fn test_containment_needs_whole_words() {
        let ctx = vec![rc("Power", None, 0.9), rc("Notes - Ego", None, 0.5)];
        assert!(extract("[Source: Pow]", &ctx).is_empty());
        let citations = extract("[Source: Ego]", &ctx);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].source_title, "Notes - Ego");
    }

    #[test]
    fn test_snippet_cuts_on_word_boundary() {
        assert_eq!(snippet("  be\n here   now ", 40), "be here now");
        assert_eq!(snippet("the present moment is all", 15), "the present...");
        assert_eq!(snippet("unbreakable", 4), "unbr...");
        assert_eq!(snippet("", 10), "");
    }

    #[test]
    fn test_citation_carries_chunk_snippet() {
        let ctx = vec![rc("Presence", None, 0.6)];
        let citations = extract("[Source: Presence]", &ctx);
        assert_eq!(citations[0].snippet, "body");
    }

    #[test]
    fn test_duplicates_collapse_to_first_mention() {
        let ctx = vec![rc("Ego", None, 0.7), rc("Presence", None, 0.6)];
        let citations = extract(
            "[Source: Presence] then [Source: Ego] and [Source: presence]",
            &ctx,
        );
        let titles: Vec<&str> = citations.iter().map(|c| c.source_title.as_str()).collect();
        assert_eq!(titles, vec!["Presence", "Ego"]);
    }

    #[tokio::test]
    async fn test_verify_drops_missing_chunks() {
        use crate::index::{IndexWriter, InMemoryIndex};
        use crate::models::{Document, DocumentMetadata};

        let store = InMemoryIndex::new();
        let doc = Document {
            id: "ego".into(),
            title: "Ego".into(),
            category: "Spiritual".into(),
            book: None,
            chapter: None,
            full_text: "body".into(),
            outbound_links: Default::default(),
            metadata: DocumentMetadata {
                source_path: "Spiritual/Ego.md".into(),
                ..Default::default()
            },
        };
        let chunk = (*rc("Ego", None, 0.7).chunk).clone();
        store.replace_document(&doc, &[chunk], None).await.unwrap();

        let ctx = vec![rc("Ego", None, 0.7), rc("Presence", None, 0.6)];
        let citations = extract("[Source: Ego; Presence]", &ctx);
        assert_eq!(citations.len(), 2);

        let verified = verify_citations(citations, &store).await;
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].chunk_id, "ego#0");
        assert!(verified[0].resolved);
    }
}
