//! Error taxonomy for the retrieval pipeline.
//!
//! Each variant maps to one recovery policy:
//!
//! | Error | Policy |
//! |-------|--------|
//! | [`IngestionError`] | Skip the document, log, continue the batch |
//! | [`EmbeddingError::Disabled`] | Skip semantic search, keyword results only |
//! | other [`EmbeddingError`]s | Retried by the provider; then the request fails (retryable) |
//! | [`RagError::IndexUnavailable`] | Only raised when *both* indexes failed |
//! | [`GenerationError`] | Fatal before the first token; truncates the answer after it |
//!
//! Generation timeouts and unresolved citations are not errors: the former
//! yields a truncated response, the latter are dropped.

use thiserror::Error;

/// Top-level error for pipeline operations.
#[derive(Debug, Error)]
pub enum RagError {
    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    /// Both the vector and keyword index failed for one query.
    #[error("no index available: {0}")]
    IndexUnavailable(String),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RagError {
    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RagError::Embedding(e) => e.is_retryable(),
            RagError::IndexUnavailable(_) => true,
            RagError::Index(IndexError::Backend(_)) => true,
            _ => false,
        }
    }
}

/// A document that could not be parsed or validated.
#[derive(Debug, Clone, Error)]
#[error("cannot ingest {path}: {reason}")]
pub struct IngestionError {
    pub path: String,
    pub reason: String,
}

impl IngestionError {
    pub fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// No embedding provider is configured.
    #[error("embeddings are disabled")]
    Disabled,

    #[error("embedding request failed: {0}")]
    Request(String),

    #[error("embedding provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed embedding response: {0}")]
    InvalidResponse(String),

    #[error("expected {expected}-dimensional embedding, got {actual}")]
    Dimensions { expected: usize, actual: usize },
}

impl EmbeddingError {
    /// Transport failures, rate limits (429) and server errors (5xx) are
    /// transient; everything else is permanent for the given input.
    pub fn is_retryable(&self) -> bool {
        match self {
            EmbeddingError::Request(_) => true,
            EmbeddingError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index backend error: {0}")]
    Backend(String),

    #[error("index state lock poisoned")]
    Poisoned,

    #[error("vector for chunk {chunk_id} has {actual} dimensions, index holds {expected}")]
    DimensionMismatch {
        chunk_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("{vectors} vectors supplied for {chunks} chunks")]
    VectorCountMismatch { chunks: usize, vectors: usize },
}

#[derive(Debug, Error)]
pub enum GenerationError {
    /// No generation provider is configured.
    #[error("generation is disabled")]
    Disabled,

    #[error("generation request failed: {0}")]
    Request(String),

    #[error("generation provider returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The token stream broke after it started.
    #[error("generation stream failed: {0}")]
    Stream(String),
}

/// Invalid tuning parameters.
#[derive(Debug, Clone, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);
