//! Token-budgeted prompt context.
//!
//! Ranked chunks are rendered as
//!
//! ```text
//! [Source: <book> - <title>]
//! <chunk text>
//!
//! ---
//!
//! [Source: <title>]
//! <chunk text>
//! ```
//!
//! and included whole, in rank order, until the next one would overflow the
//! budget. Assembly stops there; a smaller chunk further down is never
//! pulled forward, so the context stays a prefix of the ranking.

use crate::models::{AssembledContext, Chunk, RetrievedChunk};
use crate::tokens::count_tokens;

/// Placed between context entries. Its tokens count against the budget.
pub const SOURCE_SEPARATOR: &str = "\n\n---\n\n";

/// Render one chunk with its source header.
pub fn format_entry(chunk: &Chunk) -> String {
    format!("[Source: {}]\n{}", chunk.source_label(), chunk.text)
}

#[derive(Debug, Clone, Copy)]
pub struct ContextAssembler {
    token_budget: usize,
}

impl ContextAssembler {
    pub fn new(token_budget: usize) -> Self {
        Self { token_budget }
    }

    pub fn token_budget(&self) -> usize {
        self.token_budget
    }

    pub fn assemble(&self, ranked: &[RetrievedChunk]) -> AssembledContext {
        assemble(ranked, self.token_budget)
    }
}

/// Greedily pack `ranked` into at most `token_budget` tokens.
pub fn assemble(ranked: &[RetrievedChunk], token_budget: usize) -> AssembledContext {
    let separator_tokens = count_tokens(SOURCE_SEPARATOR);
    let mut used = 0usize;
    let mut entries: Vec<String> = Vec::new();
    let mut chunks: Vec<RetrievedChunk> = Vec::new();

    for rc in ranked {
        let entry = format_entry(&rc.chunk);
        let cost = count_tokens(&entry) + if entries.is_empty() { 0 } else { separator_tokens };
        if used + cost > token_budget {
            tracing::debug!(
                included = chunks.len(),
                remaining = ranked.len() - chunks.len(),
                used,
                token_budget,
                "context budget reached"
            );
            break;
        }
        used += cost;
        entries.push(entry);
        chunks.push(rc.clone());
    }

    let text = entries.join(SOURCE_SEPARATOR);
    let token_count = count_tokens(&text);
    AssembledContext {
        chunks,
        text,
        token_count,
    }
}
