//! In-memory index implementing every storage trait.
//!
//! All state sits behind one `RwLock`, so a document replacement is a single
//! write-locked swap and readers never see it half applied. Vector search is
//! brute-force cosine similarity; keyword search is BM25 over
//! [`search_terms`] computed at query time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::{
    check_vectors, search_terms, ChunkStore, IndexStats, IndexWriter, KeywordIndex, ScoredChunkId,
    VectorIndex,
};
use crate::embedding::cosine_similarity;
use crate::error::IndexError;
use crate::models::{Chunk, Document, SearchFilter};

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

#[derive(Default)]
struct State {
    docs: HashMap<String, Document>,
    chunks: HashMap<String, Chunk>,
    doc_chunks: HashMap<String, Vec<String>>,
    vectors: HashMap<String, Vec<f32>>,
}

impl State {
    fn remove_document(&mut self, id: &str) -> bool {
        let existed = self.docs.remove(id).is_some();
        for chunk_id in self.doc_chunks.remove(id).unwrap_or_default() {
            self.chunks.remove(&chunk_id);
            self.vectors.remove(&chunk_id);
        }
        existed
    }
}

/// In-memory index for tests and library embedding.
#[derive(Default)]
pub struct InMemoryIndex {
    state: RwLock<State>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, IndexError> {
        self.state.read().map_err(|_| IndexError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, IndexError> {
        self.state.write().map_err(|_| IndexError::Poisoned)
    }
}

fn rank(mut hits: Vec<ScoredChunkId>, top_k: usize) -> Vec<ScoredChunkId> {
    hits.sort_by(|a, b| {
        b.raw_score
            .total_cmp(&a.raw_score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(top_k);
    hits
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunkId>, IndexError> {
        let state = self.read()?;
        let hits = state
            .vectors
            .iter()
            .filter_map(|(chunk_id, v)| {
                let chunk = state.chunks.get(chunk_id)?;
                if !filter.matches(&chunk.metadata) {
                    return None;
                }
                Some(ScoredChunkId {
                    chunk_id: chunk_id.clone(),
                    document_id: chunk.document_id.clone(),
                    raw_score: cosine_similarity(vector, v) as f64,
                })
            })
            .collect();
        Ok(rank(hits, top_k))
    }

    async fn upsert(&self, chunk: &Chunk, vector: &[f32]) -> Result<(), IndexError> {
        let mut state = self.write()?;
        if let Some(existing) = state.vectors.values().next() {
            if existing.len() != vector.len() {
                return Err(IndexError::DimensionMismatch {
                    chunk_id: chunk.id.clone(),
                    expected: existing.len(),
                    actual: vector.len(),
                });
            }
        }
        state.vectors.insert(chunk.id.clone(), vector.to_vec());
        Ok(())
    }

    async fn delete(&self, chunk_id: &str) -> Result<(), IndexError> {
        self.write()?.vectors.remove(chunk_id);
        Ok(())
    }
}

#[async_trait]
impl KeywordIndex for InMemoryIndex {
    async fn query(
        &self,
        text: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunkId>, IndexError> {
        let terms: HashSet<String> = search_terms(text).into_iter().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let state = self.read()?;
        let candidates: Vec<(&Chunk, Vec<String>)> = state
            .chunks
            .values()
            .filter(|c| filter.matches(&c.metadata))
            .map(|c| (c, search_terms(&c.text)))
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let n = candidates.len() as f64;
        let avg_len = candidates.iter().map(|(_, t)| t.len()).sum::<usize>() as f64 / n;
        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for (_, chunk_terms) in &candidates {
            let unique: HashSet<&str> = chunk_terms.iter().map(String::as_str).collect();
            for term in terms.iter().filter(|t| unique.contains(t.as_str())) {
                *doc_freq.entry(term.as_str()).or_default() += 1;
            }
        }

        let hits = candidates
            .iter()
            .filter_map(|(chunk, chunk_terms)| {
                let len = chunk_terms.len() as f64;
                let mut score = 0.0;
                for term in &terms {
                    let tf = chunk_terms.iter().filter(|t| *t == term).count() as f64;
                    if tf == 0.0 {
                        continue;
                    }
                    let df = doc_freq.get(term.as_str()).copied().unwrap_or(0) as f64;
                    let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                    let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * len / avg_len.max(1.0));
                    score += idf * tf * (BM25_K1 + 1.0) / (tf + norm);
                }
                (score > 0.0).then(|| ScoredChunkId {
                    chunk_id: chunk.id.clone(),
                    document_id: chunk.document_id.clone(),
                    raw_score: score,
                })
            })
            .collect();
        Ok(rank(hits, top_k))
    }
}

#[async_trait]
impl ChunkStore for InMemoryIndex {
    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>, IndexError> {
        let state = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.chunks.get(id).cloned())
            .collect())
    }

    async fn contains_chunk(&self, id: &str) -> Result<bool, IndexError> {
        Ok(self.read()?.chunks.contains_key(id))
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>, IndexError> {
        Ok(self.read()?.docs.get(id).cloned())
    }

    async fn document_ids(&self) -> Result<Vec<String>, IndexError> {
        let mut ids: Vec<String> = self.read()?.docs.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn stats(&self) -> Result<IndexStats, IndexError> {
        let state = self.read()?;
        let mut categories = BTreeMap::new();
        let mut books = BTreeMap::new();
        for doc in state.docs.values() {
            *categories.entry(doc.category.clone()).or_insert(0) += 1;
            if let Some(book) = &doc.book {
                *books.entry(book.clone()).or_insert(0) += 1;
            }
        }
        Ok(IndexStats {
            documents: state.docs.len(),
            chunks: state.chunks.len(),
            embedded_chunks: state.vectors.len(),
            categories,
            books,
        })
    }
}

#[async_trait]
impl IndexWriter for InMemoryIndex {
    async fn replace_document(
        &self,
        doc: &Document,
        chunks: &[Chunk],
        vectors: Option<&[Vec<f32>]>,
    ) -> Result<(), IndexError> {
        check_vectors(chunks, vectors)?;
        let chunk_ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();

        let mut state = self.write()?;
        if let (Some(vs), Some(existing)) = (vectors, state.vectors.values().next()) {
            let expected = existing.len();
            if let Some((c, v)) = chunks.iter().zip(vs).find(|(_, v)| v.len() != expected) {
                return Err(IndexError::DimensionMismatch {
                    chunk_id: c.id.clone(),
                    expected,
                    actual: v.len(),
                });
            }
        }

        state.remove_document(&doc.id);
        state.docs.insert(doc.id.clone(), doc.clone());
        for chunk in chunks {
            state.chunks.insert(chunk.id.clone(), chunk.clone());
        }
        if let Some(vs) = vectors {
            for (chunk, v) in chunks.iter().zip(vs) {
                state.vectors.insert(chunk.id.clone(), v.clone());
            }
        }
        state.doc_chunks.insert(doc.id.clone(), chunk_ids);
        Ok(())
    }

    async fn delete_document(&self, id: &str) -> Result<bool, IndexError> {
        Ok(self.write()?.remove_document(id))
    }
}
