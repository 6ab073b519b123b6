//! Hybrid retrieval: semantic and keyword candidates merged into one
//! scored, duplicate-free list.
//!
//! # Scoring
//!
//! 1. Fetch `N_semantic` vector candidates and `N_keyword` keyword
//!    candidates, `N = max(top_k + 1, ceil(top_k × multiplier))`.
//! 2. Normalize each source to `[0, 1]` with min-max normalization over that
//!    source's own result set. A set whose scores are all equal maps to `1.0`.
//! 3. Union by `chunk_id`. A chunk missing from one source scores `0` there.
//! 4. `combined = w_semantic × semantic + w_keyword × keyword`.
//! 5. Sort by `combined` (desc), then `(document_id, sequence_index)` (asc).
//!
//! The order is only for reproducibility; ranking is the re-ranker's job.
//!
//! # Degradation
//!
//! If one index fails, or embeddings are disabled, the other source's
//! results are returned alone together with a [`RetrievalWarning`]. Only
//! when both sources are unavailable does retrieval fail with
//! [`RagError::IndexUnavailable`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embedding::Embedder;
use crate::error::{ConfigError, EmbeddingError, IndexError, RagError};
use crate::index::{ChunkStore, KeywordIndex, ScoredChunkId, VectorIndex};
use crate::models::{Query, RetrievedChunk};

/// Weights and candidate pool sizes for hybrid merging.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalParams {
    pub semantic_weight: f64,
    pub keyword_weight: f64,
    pub semantic_candidate_multiplier: f64,
    pub keyword_candidate_multiplier: f64,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            semantic_weight: 0.7,
            keyword_weight: 0.3,
            semantic_candidate_multiplier: 2.0,
            keyword_candidate_multiplier: 2.0,
        }
    }
}

impl RetrievalParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, w) in [
            ("semantic_weight", self.semantic_weight),
            ("keyword_weight", self.keyword_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(ConfigError(format!(
                    "retrieval.{name} must be in [0.0, 1.0], got {w}"
                )));
            }
        }
        let sum = self.semantic_weight + self.keyword_weight;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError(format!(
                "retrieval.semantic_weight + keyword_weight must equal 1.0, got {sum}"
            )));
        }
        for (name, m) in [
            (
                "semantic_candidate_multiplier",
                self.semantic_candidate_multiplier,
            ),
            (
                "keyword_candidate_multiplier",
                self.keyword_candidate_multiplier,
            ),
        ] {
            if !m.is_finite() || m < 1.0 {
                return Err(ConfigError(format!(
                    "retrieval.{name} must be >= 1.0, got {m}"
                )));
            }
        }
        Ok(())
    }
}

/// Candidates to request from one source for a final `top_k`.
pub fn candidate_count(top_k: usize, multiplier: f64) -> usize {
    let scaled = (top_k as f64 * multiplier).ceil() as usize;
    scaled.max(top_k + 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalSource {
    Semantic,
    Keyword,
}

impl fmt::Display for RetrievalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievalSource::Semantic => f.write_str("semantic"),
            RetrievalSource::Keyword => f.write_str("keyword"),
        }
    }
}

/// Non-fatal problems surfaced alongside results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetrievalWarning {
    /// One source was unavailable; results come from the other only.
    PartialResults {
        source: RetrievalSource,
        reason: String,
    },
}

impl fmt::Display for RetrievalWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievalWarning::PartialResults { source, reason } => {
                write!(f, "{source} search unavailable ({reason}); partial results")
            }
        }
    }
}

/// Output of one retrieval.
#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    pub chunks: Vec<RetrievedChunk>,
    pub warnings: Vec<RetrievalWarning>,
    pub semantic_candidates: usize,
    pub keyword_candidates: usize,
}

pub struct HybridRetriever {
    embedder: Arc<dyn Embedder>,
    vector_index: Arc<dyn VectorIndex>,
    keyword_index: Arc<dyn KeywordIndex>,
    store: Arc<dyn ChunkStore>,
    params: RetrievalParams,
}

impl HybridRetriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vector_index: Arc<dyn VectorIndex>,
        keyword_index: Arc<dyn KeywordIndex>,
        store: Arc<dyn ChunkStore>,
        params: RetrievalParams,
    ) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(Self {
            embedder,
            vector_index,
            keyword_index,
            store,
            params,
        })
    }

    pub fn params(&self) -> &RetrievalParams {
        &self.params
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    /// Embed the query text. `Ok(None)` means embeddings are disabled.
    pub async fn embed_query(&self, query: &Query) -> Result<Option<Vec<f32>>, EmbeddingError> {
        if let Some(v) = &query.derived_embedding {
            return Ok(Some(v.clone()));
        }
        match self.embedder.embed(&query.raw_text).await {
            Ok(v) => Ok(Some(v)),
            Err(EmbeddingError::Disabled) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Retrieve merged candidates for `query`, sized for a final `top_k`.
    pub async fn retrieve(&self, query: &Query, top_k: usize) -> Result<Retrieval, RagError> {
        if query.raw_text.trim().is_empty() || top_k == 0 {
            return Ok(Retrieval::default());
        }

        let embedding = self.embed_query(query).await?;
        let n_semantic = candidate_count(top_k, self.params.semantic_candidate_multiplier);
        let n_keyword = candidate_count(top_k, self.params.keyword_candidate_multiplier);

        let semantic = async {
            match &embedding {
                Some(v) => Some(self.vector_index.query(v, n_semantic, &query.filter).await),
                None => None,
            }
        };
        let keyword = self
            .keyword_index
            .query(&query.raw_text, n_keyword, &query.filter);
        let (semantic, keyword) = futures_util::future::join(semantic, keyword).await;

        let mut warnings = Vec::new();
        let semantic_hits = match semantic {
            Some(Ok(hits)) => Some(hits),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "vector index failed; continuing with keyword results");
                warnings.push(partial(RetrievalSource::Semantic, &e.to_string()));
                None
            }
            None => {
                tracing::debug!("embeddings disabled; keyword results only");
                warnings.push(partial(RetrievalSource::Semantic, "embeddings disabled"));
                None
            }
        };
        let keyword_hits = match keyword {
            Ok(hits) => Some(hits),
            Err(e) => {
                tracing::warn!(error = %e, "keyword index failed; continuing with vector results");
                warnings.push(partial(RetrievalSource::Keyword, &e.to_string()));
                None
            }
        };

        if semantic_hits.is_none() && keyword_hits.is_none() {
            let reasons: Vec<String> = warnings.iter().map(ToString::to_string).collect();
            return Err(RagError::IndexUnavailable(reasons.join("; ")));
        }

        let semantic_hits = dedup_best(semantic_hits.unwrap_or_default());
        let keyword_hits = dedup_best(keyword_hits.unwrap_or_default());
        let chunks = self.merge(&semantic_hits, &keyword_hits).await?;

        Ok(Retrieval {
            chunks,
            warnings,
            semantic_candidates: semantic_hits.len(),
            keyword_candidates: keyword_hits.len(),
        })
    }

    async fn merge(
        &self,
        semantic_hits: &[ScoredChunkId],
        keyword_hits: &[ScoredChunkId],
    ) -> Result<Vec<RetrievedChunk>, IndexError> {
        let mut scores: HashMap<&str, (f64, f64)> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for (hit, s) in normalize_scores(semantic_hits) {
            if scores.insert(&hit.chunk_id, (s, 0.0)).is_none() {
                order.push(hit.chunk_id.clone());
            }
        }
        for (hit, k) in normalize_scores(keyword_hits) {
            let entry = scores.entry(&hit.chunk_id).or_insert_with(|| {
                order.push(hit.chunk_id.clone());
                (0.0, 0.0)
            });
            entry.1 = k;
        }
        if order.is_empty() {
            return Ok(Vec::new());
        }

        let found = self.store.get_chunks(&order).await?;
        if found.len() < order.len() {
            tracing::debug!(
                stale = order.len() - found.len(),
                "dropping index hits with no stored chunk"
            );
        }

        let mut merged: Vec<RetrievedChunk> = found
            .into_iter()
            .filter_map(|chunk| {
                let (semantic, keyword) = scores.get(chunk.id.as_str()).copied()?;
                let combined =
                    self.params.semantic_weight * semantic + self.params.keyword_weight * keyword;
                Some(RetrievedChunk {
                    chunk: Arc::new(chunk),
                    semantic_score: semantic,
                    keyword_score: keyword,
                    combined_score: combined,
                    final_score: combined,
                })
            })
            .collect();

        merged.sort_by(|a, b| {
            b.combined_score
                .total_cmp(&a.combined_score)
                .then_with(|| a.tie_break_key().cmp(&b.tie_break_key()))
        });
        Ok(merged)
    }
}

fn partial(source: RetrievalSource, reason: &str) -> RetrievalWarning {
    RetrievalWarning::PartialResults {
        source,
        reason: reason.to_string(),
    }
}

/// Keep the best-scoring hit per chunk, preserving first-seen order.
fn dedup_best(hits: Vec<ScoredChunkId>) -> Vec<ScoredChunkId> {
    let mut best: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<ScoredChunkId> = Vec::with_capacity(hits.len());
    for hit in hits {
        match best.get(&hit.chunk_id) {
            Some(&i) => {
                if hit.raw_score > out[i].raw_score {
                    out[i] = hit;
                }
            }
            None => {
                best.insert(hit.chunk_id.clone(), out.len());
                out.push(hit);
            }
        }
    }
    out
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal (including a single hit), they normalize to `1.0`.
pub fn normalize_scores(candidates: &[ScoredChunkId]) -> Vec<(&ScoredChunkId, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_document, ChunkerConfig};
    use crate::index::{IndexWriter, InMemoryIndex};
    use crate::models::{Document, DocumentMetadata, SearchFilter};
    use async_trait::async_trait;

    struct FixedIndex(Result<Vec<ScoredChunkId>, String>);

    impl FixedIndex {
        fn hits(hits: &[(&str, f64)]) -> Self {
            FixedIndex(Ok(hits
                .iter()
                .map(|(id, s)| ScoredChunkId {
                    chunk_id: format!("{id}#0"),
                    document_id: id.to_string(),
                    raw_score: *s,
                })
                .collect()))
        }

        fn down() -> Self {
            FixedIndex(Err("connection refused".into()))
        }

        fn result(&self) -> Result<Vec<ScoredChunkId>, IndexError> {
            self.0.clone().map_err(IndexError::Backend)
        }
    }

    #[async_trait]
    impl VectorIndex for FixedIndex {
        async fn query(
            &self,
            _vector: &[f32],
            _top_k: usize,
            _filter: &SearchFilter,
        ) -> Result<Vec<ScoredChunkId>, IndexError> {
            self.result()
        }
        async fn upsert(&self, _chunk: &crate::models::Chunk, _v: &[f32]) -> Result<(), IndexError> {
            Ok(())
        }
        async fn delete(&self, _chunk_id: &str) -> Result<(), IndexError> {
            Ok(())
        }
    }

    #[async_trait]
    impl KeywordIndex for FixedIndex {
        async fn query(
            &self,
            _text: &str,
            _top_k: usize,
            _filter: &SearchFilter,
        ) -> Result<Vec<ScoredChunkId>, IndexError> {
            self.result()
        }
    }

    struct UnitEmbedder {
        enabled: bool,
    }

    #[async_trait]
    impl Embedder for UnitEmbedder {
        fn model_name(&self) -> &str {
            "unit"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            if !self.enabled {
                return Err(EmbeddingError::Disabled);
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    async fn store_with(ids: &[&str]) -> Arc<InMemoryIndex> {
        let store = Arc::new(InMemoryIndex::new());
        for id in ids {
            let doc = Document {
                id: id.to_string(),
                title: format!("Title {id}"),
                category: "Spiritual".into(),
                book: None,
                chapter: None,
                full_text: format!("text of {id}"),
                outbound_links: Default::default(),
                metadata: DocumentMetadata {
                    source_path: format!("Spiritual/{id}.md"),
                    ..Default::default()
                },
            };
            let chunks = chunk_document(&doc, &ChunkerConfig::default());
            store.replace_document(&doc, &chunks, None).await.unwrap();
        }
        store
    }

    fn retriever(
        store: Arc<InMemoryIndex>,
        vector: FixedIndex,
        keyword: FixedIndex,
        embeddings: bool,
    ) -> HybridRetriever {
        HybridRetriever::new(
            Arc::new(UnitEmbedder {
                enabled: embeddings,
            }),
            Arc::new(vector),
            Arc::new(keyword),
            store,
            RetrievalParams::default(),
        )
        .unwrap()
    }

    fn find<'a>(r: &'a Retrieval, doc: &str) -> &'a RetrievedChunk {
        r.chunks.iter().find(|c| c.document_id() == doc).unwrap()
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_range_and_all_equal() {
        let hits = FixedIndex::hits(&[("a", 10.0), ("b", 5.0), ("c", 0.0)]).0.unwrap();
        let norm: Vec<f64> = normalize_scores(&hits).iter().map(|(_, s)| *s).collect();
        assert_eq!(norm, vec![1.0, 0.5, 0.0]);

        let equal = FixedIndex::hits(&[("a", 3.0), ("b", 3.0)]).0.unwrap();
        assert!(normalize_scores(&equal).iter().all(|(_, s)| *s == 1.0));
    }

    #[test]
    fn test_candidate_count() {
        assert_eq!(candidate_count(10, 2.0), 20);
        assert_eq!(candidate_count(10, 1.0), 11);
        assert_eq!(candidate_count(3, 1.5), 5);
    }

    #[test]
    fn test_params_validation() {
        assert!(RetrievalParams::default().validate().is_ok());
        let bad_sum = RetrievalParams {
            semantic_weight: 0.6,
            keyword_weight: 0.3,
            ..Default::default()
        };
        assert!(bad_sum.validate().is_err());
        let bad_mult = RetrievalParams {
            keyword_candidate_multiplier: 0.5,
            ..Default::default()
        };
        assert!(bad_mult.validate().is_err());
    }

    #[tokio::test]
    async fn test_weighted_merge_and_missing_component() {
        // Semantic: x normalizes to 0.9. Keyword: x -> 0.5, y -> 0.8.
        let store = store_with(&["w", "x", "z", "u", "y", "v"]).await;
        let vector = FixedIndex::hits(&[("w", 1.0), ("x", 0.9), ("z", 0.0)]);
        let keyword = FixedIndex::hits(&[("u", 10.0), ("y", 8.0), ("x", 5.0), ("v", 0.0)]);
        let r = retriever(store, vector, keyword, true);

        let out = r.retrieve(&Query::new("mindfulness"), 5).await.unwrap();
        assert!(out.warnings.is_empty());

        let x = find(&out, "x");
        assert!((x.semantic_score - 0.9).abs() < 1e-9);
        assert!((x.keyword_score - 0.5).abs() < 1e-9);
        assert!((x.combined_score - (0.7 * 0.9 + 0.3 * 0.5)).abs() < 1e-9);

        let y = find(&out, "y");
        assert_eq!(y.semantic_score, 0.0);
        assert!((y.combined_score - 0.3 * 0.8).abs() < 1e-9);

        let mut ids: Vec<&str> = out.chunks.iter().map(|c| c.chunk.id.as_str()).collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
        assert_eq!(total, 6);
        assert!(out
            .chunks
            .windows(2)
            .all(|w| w[0].combined_score >= w[1].combined_score));
    }

    #[tokio::test]
    async fn test_vector_down_degrades_to_keyword() {
        let store = store_with(&["a", "b"]).await;
        let r = retriever(
            store,
            FixedIndex::down(),
            FixedIndex::hits(&[("a", 2.0), ("b", 1.0)]),
            true,
        );
        let out = r.retrieve(&Query::new("presence"), 5).await.unwrap();
        assert_eq!(out.chunks.len(), 2);
        assert!(matches!(
            out.warnings[0],
            RetrievalWarning::PartialResults {
                source: RetrievalSource::Semantic,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_disabled_embeddings_skip_semantic() {
        let store = store_with(&["a"]).await;
        let r = retriever(
            store,
            FixedIndex::hits(&[("a", 1.0)]),
            FixedIndex::hits(&[("a", 1.0)]),
            false,
        );
        let out = r.retrieve(&Query::new("presence"), 5).await.unwrap();
        assert_eq!(out.chunks.len(), 1);
        assert_eq!(out.chunks[0].semantic_score, 0.0);
        assert_eq!(out.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_both_down_is_index_unavailable() {
        let store = store_with(&["a"]).await;
        let r = retriever(store, FixedIndex::down(), FixedIndex::down(), true);
        let err = r.retrieve(&Query::new("presence"), 5).await.unwrap_err();
        assert!(matches!(err, RagError::IndexUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_stale_hits_dropped() {
        let store = store_with(&["a"]).await;
        let r = retriever(
            store,
            FixedIndex::hits(&[("a", 1.0), ("gone", 0.5)]),
            FixedIndex::hits(&[]),
            true,
        );
        let out = r.retrieve(&Query::new("presence"), 5).await.unwrap();
        assert_eq!(out.chunks.len(), 1);
        assert_eq!(out.semantic_candidates, 2);
    }

    #[tokio::test]
    async fn test_blank_query_returns_nothing() {
        let store = store_with(&["a"]).await;
        let r = retriever(
            store,
            FixedIndex::hits(&[("a", 1.0)]),
            FixedIndex::hits(&[("a", 1.0)]),
            true,
        );
        let out = r.retrieve(&Query::new("   "), 5).await.unwrap();
        assert!(out.chunks.is_empty());
    }

    #[test]
    fn test_dedup_best_keeps_higher() {
        let hits = vec![
            ScoredChunkId {
                chunk_id: "a#0".into(),
                document_id: "a".into(),
                raw_score: 0.2,
            },
            ScoredChunkId {
                chunk_id: "a#0".into(),
                document_id: "a".into(),
                raw_score: 0.7,
            },
        ];
        let out = dedup_best(hits);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].raw_score, 0.7);
    }
}
