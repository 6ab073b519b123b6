//! # vault-rag core
//!
//! Shared retrieval logic for vault-rag: data models, chunking, the
//! collaborator traits (embedder, indexes, chunk store, generator), hybrid
//! retrieval, re-ranking, context assembly, prompt construction, and
//! citation extraction.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or HTTP clients.
//! Concrete collaborators (SQLite index, HTTP embedders and generators)
//! and the request orchestrator live in the `vault-rag` app crate.
//!
//! # Pipeline
//!
//! ```text
//! Query ─► Embedder ─► HybridRetriever ─► ReRanker ─► ContextAssembler ─► prompt
//!                      (VectorIndex +                                       │
//!                       KeywordIndex +                                      ▼
//!                       ChunkStore)            Citations ◄─ CitationExtractor ◄─ Generator
//! ```

pub mod assemble;
pub mod chunk;
pub mod citation;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod index;
pub mod models;
pub mod prompt;
pub mod rerank;
pub mod retrieve;
pub mod tokens;
