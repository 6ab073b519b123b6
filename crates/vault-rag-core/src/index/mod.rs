//! Collaborator interfaces for retrieval storage.
//!
//! The pipeline reads through three traits and writes through one:
//!
//! | Trait | Used by | Purpose |
//! |-------|---------|---------|
//! | [`VectorIndex`] | retriever, ingestion | Nearest-neighbour search over chunk vectors |
//! | [`KeywordIndex`] | retriever | Lexical search over chunk text |
//! | [`ChunkStore`] | retriever, assembler, citation check | `chunk_id → chunk` lookup |
//! | [`IndexWriter`] | ingestion only | Atomic per-document replacement |
//!
//! Implementations must be `Send + Sync`. A document replacement must be
//! atomic with respect to readers: a concurrent query observes either the
//! old chunks or the new ones, never a mix.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::IndexError;
use crate::models::{Chunk, Document, SearchFilter};

pub use memory::InMemoryIndex;

/// A search hit before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunkId {
    pub chunk_id: String,
    pub document_id: String,
    /// Backend-specific score (cosine similarity, BM25, …). Higher is better.
    pub raw_score: f64,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// The `top_k` nearest chunks to `vector` that pass `filter`.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunkId>, IndexError>;

    /// Insert or replace the vector for one chunk.
    async fn upsert(&self, chunk: &Chunk, vector: &[f32]) -> Result<(), IndexError>;

    async fn delete(&self, chunk_id: &str) -> Result<(), IndexError>;
}

#[async_trait]
pub trait KeywordIndex: Send + Sync {
    /// The `top_k` best lexical matches for `text` that pass `filter`.
    async fn query(
        &self,
        text: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunkId>, IndexError>;
}

/// Read side of the persisted chunk store.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Fetch chunks by ID. Unknown IDs are skipped; order follows `ids`.
    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>, IndexError>;

    async fn contains_chunk(&self, id: &str) -> Result<bool, IndexError>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>, IndexError>;

    async fn document_ids(&self) -> Result<Vec<String>, IndexError>;

    async fn stats(&self) -> Result<IndexStats, IndexError>;
}

/// Write side, used only by the ingestion path.
#[async_trait]
pub trait IndexWriter: Send + Sync {
    /// Replace a document, its chunks and their vectors in one step.
    ///
    /// `vectors`, when present, holds one vector per chunk in order. When
    /// absent the document stays keyword-searchable only.
    async fn replace_document(
        &self,
        doc: &Document,
        chunks: &[Chunk],
        vectors: Option<&[Vec<f32>]>,
    ) -> Result<(), IndexError>;

    /// Remove a document and everything derived from it. Returns whether it
    /// existed.
    async fn delete_document(&self, id: &str) -> Result<bool, IndexError>;
}

/// Counts reported by `vrag stats` and `GET /api/stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub chunks: usize,
    pub embedded_chunks: usize,
    /// Document count per category.
    pub categories: BTreeMap<String, usize>,
    /// Document count per book.
    pub books: BTreeMap<String, usize>,
}

/// Check a replacement's vectors line up with its chunks.
pub fn check_vectors(chunks: &[Chunk], vectors: Option<&[Vec<f32>]>) -> Result<(), IndexError> {
    match vectors {
        Some(v) if v.len() != chunks.len() => Err(IndexError::VectorCountMismatch {
            chunks: chunks.len(),
            vectors: v.len(),
        }),
        _ => Ok(()),
    }
}

/// Lowercased alphanumeric terms, as used for keyword matching.
pub fn search_terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}
