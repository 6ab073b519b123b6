//! Data models that flow through ingestion and retrieval.
//!
//! [`Document`] and [`Chunk`] are persisted; [`Query`], [`RetrievedChunk`],
//! [`AssembledContext`] and [`Citation`] live for a single request.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::IngestionError;

/// Category assigned to notes stored at the vault root.
pub const DEFAULT_CATEGORY: &str = "General";

/// A parsed note. Immutable once ingested; re-ingesting the same source
/// path replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable ID derived from the note's position in the vault.
    pub id: String,
    pub title: String,
    pub category: String,
    pub book: Option<String>,
    pub chapter: Option<String>,
    pub full_text: String,
    /// Titles referenced through `[[wiki links]]`.
    pub outbound_links: BTreeSet<String>,
    pub metadata: DocumentMetadata,
}

/// Fixed metadata schema recorded for every document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Path relative to the vault root, `/`-separated.
    pub source_path: String,
    /// File modification time (Unix seconds), when known.
    pub modified_at: Option<i64>,
    pub word_count: usize,
}

impl Document {
    /// Reject documents that would produce unusable chunks.
    pub fn validate(&self) -> Result<(), IngestionError> {
        let path = &self.metadata.source_path;
        if self.id.trim().is_empty() {
            return Err(IngestionError::new(path, "document id is empty"));
        }
        if self.title.trim().is_empty() {
            return Err(IngestionError::new(path, "title is empty"));
        }
        if self.category.trim().is_empty() {
            return Err(IngestionError::new(path, "category is empty"));
        }
        if path.trim().is_empty() {
            return Err(IngestionError::new(&self.id, "source path is empty"));
        }
        if self.book.as_deref().is_some_and(|b| b.trim().is_empty()) {
            return Err(IngestionError::new(path, "book is present but empty"));
        }
        Ok(())
    }

    /// Metadata every chunk of this document inherits.
    pub fn chunk_metadata(&self) -> ChunkMetadata {
        ChunkMetadata {
            title: self.title.clone(),
            category: self.category.clone(),
            book: self.book.clone(),
            chapter: self.chapter.clone(),
            source_path: self.metadata.source_path.clone(),
            outbound_link_count: self.outbound_links.len(),
        }
    }
}

/// A token-bounded segment of one [`Document`].
///
/// Vectors are not stored here; the vector index owns them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// `{document_id}#{sequence_index}`.
    pub id: String,
    pub document_id: String,
    pub sequence_index: usize,
    /// Text including the overlap prefix.
    pub text: String,
    pub token_count: usize,
    /// Leading tokens repeated from the previous chunk.
    pub overlap_token_count: usize,
    /// Set when the chunk came from cutting one oversized paragraph.
    pub hard_split: bool,
    /// SHA-256 of `text`.
    pub hash: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Build the canonical chunk ID.
    pub fn make_id(document_id: &str, sequence_index: usize) -> String {
        format!("{document_id}#{sequence_index}")
    }

    /// Normalized text without the overlap prefix.
    pub fn primary_text(&self) -> String {
        self.text
            .split_whitespace()
            .skip(self.overlap_token_count)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn source_label(&self) -> String {
        self.metadata.source_label()
    }
}

/// Metadata a chunk inherits from its document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub title: String,
    pub category: String,
    pub book: Option<String>,
    pub chapter: Option<String>,
    pub source_path: String,
    pub outbound_link_count: usize,
}

impl ChunkMetadata {
    /// Label used in context headers: `"<book> - <title>"`, or the title
    /// alone for notes outside a book.
    pub fn source_label(&self) -> String {
        match &self.book {
            Some(book) => format!("{book} - {}", self.title),
            None => self.title.clone(),
        }
    }
}

/// Metadata restriction applied by both indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub category: Option<String>,
    pub book: Option<String>,
}

impl SearchFilter {
    pub fn category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            book: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.category.is_none() && self.book.is_none()
    }

    pub fn matches(&self, meta: &ChunkMetadata) -> bool {
        if let Some(category) = &self.category {
            if &meta.category != category {
                return false;
            }
        }
        if let Some(book) = &self.book {
            if meta.book.as_ref() != Some(book) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One prior message of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

/// A user question plus everything retrieval needs to answer it.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub raw_text: String,
    /// Pre-computed embedding; when absent the retriever embeds `raw_text`.
    pub derived_embedding: Option<Vec<f32>>,
    pub filter: SearchFilter,
    pub conversation_context: Vec<Turn>,
}

impl Query {
    pub fn new(raw_text: impl Into<String>) -> Self {
        Self {
            raw_text: raw_text.into(),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: SearchFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_history(mut self, turns: Vec<Turn>) -> Self {
        self.conversation_context = turns;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.derived_embedding = Some(embedding);
        self
    }
}

/// A chunk with its retrieval scores. All scores lie in `[0, 1]` except
/// `final_score`, which adds re-ranking bonuses on top of `combined_score`.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Arc<Chunk>,
    pub semantic_score: f64,
    pub keyword_score: f64,
    pub combined_score: f64,
    /// Equal to `combined_score` until the re-ranker runs.
    pub final_score: f64,
}

impl RetrievedChunk {
    pub fn document_id(&self) -> &str {
        &self.chunk.document_id
    }

    /// Ordering key that makes equal scores reproducible.
    pub fn tie_break_key(&self) -> (&str, usize) {
        (&self.chunk.document_id, self.chunk.sequence_index)
    }
}

/// Prompt-ready context built from the top ranked chunks.
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    /// Chunks actually included, in rank order.
    pub chunks: Vec<RetrievedChunk>,
    pub text: String,
    pub token_count: usize,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// A source reference extracted from generated text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub source_title: String,
    pub document_id: String,
    pub chunk_id: String,
    pub category: String,
    pub book: Option<String>,
    pub source_path: String,
    /// The cited chunk's `final_score`.
    pub relevance_score: f64,
    /// Leading excerpt of the cited chunk, cut on a word boundary.
    #[serde(default)]
    pub snippet: String,
    pub resolved: bool,
}
