//! SQLite-backed implementation of the index traits.
//!
//! One [`SqliteIndex`] serves as vector index, keyword index, chunk store
//! and writer over the schema created by [`crate::migrate`]. Keyword search
//! uses FTS5 BM25 ranking; vector search is brute-force cosine similarity
//! over every stored vector that passes the filter.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use vault_rag_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use vault_rag_core::error::IndexError;
use vault_rag_core::index::{
    check_vectors, search_terms, ChunkStore, IndexStats, IndexWriter, KeywordIndex, ScoredChunkId,
    VectorIndex,
};
use vault_rag_core::models::{Chunk, ChunkMetadata, Document, DocumentMetadata, SearchFilter};

const CHUNK_COLUMNS: &str = "id, document_id, sequence_index, text, token_count, \
    overlap_token_count, hard_split, hash, title, category, book, chapter, source_path, \
    outbound_link_count";

pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn backend(e: sqlx::Error) -> IndexError {
    IndexError::Backend(e.to_string())
}

/// Turn free text into an FTS5 query: each term quoted, joined with OR.
/// Returns `None` when nothing searchable remains.
pub fn fts_query(text: &str) -> Option<String> {
    let terms = search_terms(text);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

fn row_to_chunk(row: &SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        sequence_index: row.get::<i64, _>("sequence_index") as usize,
        text: row.get("text"),
        token_count: row.get::<i64, _>("token_count") as usize,
        overlap_token_count: row.get::<i64, _>("overlap_token_count") as usize,
        hard_split: row.get("hard_split"),
        hash: row.get("hash"),
        metadata: ChunkMetadata {
            title: row.get("title"),
            category: row.get("category"),
            book: row.get("book"),
            chapter: row.get("chapter"),
            source_path: row.get("source_path"),
            outbound_link_count: row.get::<i64, _>("outbound_link_count") as usize,
        },
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunkId>, IndexError> {
        let rows = sqlx::query(
            r#"
            SELECT v.chunk_id, v.document_id, v.embedding
            FROM chunk_vectors v
            JOIN chunks c ON c.id = v.chunk_id
            WHERE (? IS NULL OR c.category = ?)
              AND (? IS NULL OR c.book = ?)
            "#,
        )
        .bind(&filter.category)
        .bind(&filter.category)
        .bind(&filter.book)
        .bind(&filter.book)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let mut hits: Vec<ScoredChunkId> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                ScoredChunkId {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    raw_score: cosine_similarity(vector, &blob_to_vec(&blob)) as f64,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.raw_score
                .total_cmp(&a.raw_score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn upsert(&self, chunk: &Chunk, vector: &[f32]) -> Result<(), IndexError> {
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT dims FROM chunk_vectors WHERE chunk_id != ? LIMIT 1",
        )
        .bind(&chunk.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        if let Some(dims) = existing {
            if dims as usize != vector.len() {
                return Err(IndexError::DimensionMismatch {
                    chunk_id: chunk.id.clone(),
                    expected: dims as usize,
                    actual: vector.len(),
                });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, document_id, dims, embedding)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                document_id = excluded.document_id,
                dims = excluded.dims,
                embedding = excluded.embedding
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, chunk_id: &str) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl KeywordIndex for SqliteIndex {
    async fn query(
        &self,
        text: &str,
        top_k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredChunkId>, IndexError> {
        let Some(fts) = fts_query(text) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT f.chunk_id AS chunk_id, f.document_id AS document_id, f.rank AS rank
            FROM chunks_fts f
            JOIN chunks c ON c.id = f.chunk_id
            WHERE chunks_fts MATCH ?
              AND (? IS NULL OR c.category = ?)
              AND (? IS NULL OR c.book = ?)
            ORDER BY f.rank
            LIMIT ?
            "#,
        )
        .bind(&fts)
        .bind(&filter.category)
        .bind(&filter.category)
        .bind(&filter.book)
        .bind(&filter.book)
        .bind(top_k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                ScoredChunkId {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    raw_score: -rank,
                }
            })
            .collect())
    }
}

#[async_trait]
impl ChunkStore for SqliteIndex {
    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>, IndexError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(backend)?;

        let mut by_id: HashMap<String, Chunk> = rows
            .iter()
            .map(row_to_chunk)
            .map(|c| (c.id.clone(), c))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn contains_chunk(&self, id: &str) -> Result<bool, IndexError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM chunks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(found.is_some())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>, IndexError> {
        let row = sqlx::query(
            r#"
            SELECT id, title, category, book, chapter, source_path, full_text,
                   outbound_links, modified_at, word_count
            FROM documents WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let links: String = row.get("outbound_links");
        let outbound_links = serde_json::from_str(&links)
            .map_err(|e| IndexError::Backend(format!("corrupt link list for {id}: {e}")))?;
        Ok(Some(Document {
            id: row.get("id"),
            title: row.get("title"),
            category: row.get("category"),
            book: row.get("book"),
            chapter: row.get("chapter"),
            full_text: row.get("full_text"),
            outbound_links,
            metadata: DocumentMetadata {
                source_path: row.get("source_path"),
                modified_at: row.get("modified_at"),
                word_count: row.get::<i64, _>("word_count") as usize,
            },
        }))
    }

    async fn document_ids(&self) -> Result<Vec<String>, IndexError> {
        sqlx::query_scalar("SELECT id FROM documents ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)
    }

    async fn stats(&self) -> Result<IndexStats, IndexError> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
        let embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;

        let categories = sqlx::query(
            "SELECT category AS name, COUNT(*) AS n FROM documents GROUP BY category",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        let books = sqlx::query(
            "SELECT book AS name, COUNT(*) AS n FROM documents WHERE book IS NOT NULL GROUP BY book",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let tally = |rows: &[SqliteRow]| -> BTreeMap<String, usize> {
            rows.iter()
                .map(|r| (r.get::<String, _>("name"), r.get::<i64, _>("n") as usize))
                .collect()
        };

        Ok(IndexStats {
            documents: documents as usize,
            chunks: chunks as usize,
            embedded_chunks: embedded as usize,
            categories: tally(&categories),
            books: tally(&books),
        })
    }
}

#[async_trait]
impl IndexWriter for SqliteIndex {
    async fn replace_document(
        &self,
        doc: &Document,
        chunks: &[Chunk],
        vectors: Option<&[Vec<f32>]>,
    ) -> Result<(), IndexError> {
        check_vectors(chunks, vectors)?;
        if let Some(vectors) = vectors {
            let stored: Option<i64> = sqlx::query_scalar(
                "SELECT dims FROM chunk_vectors WHERE document_id != ? LIMIT 1",
            )
            .bind(&doc.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
            let expected = stored
                .map(|d| d as usize)
                .or_else(|| vectors.first().map(Vec::len));
            if let Some(expected) = expected {
                for (chunk, v) in chunks.iter().zip(vectors) {
                    if v.len() != expected {
                        return Err(IndexError::DimensionMismatch {
                            chunk_id: chunk.id.clone(),
                            expected,
                            actual: v.len(),
                        });
                    }
                }
            }
        }

        let links = serde_json::to_string(&doc.outbound_links)
            .map_err(|e| IndexError::Backend(e.to_string()))?;
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await.map_err(backend)?;
        delete_rows(&mut tx, &doc.id).await?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, title, category, book, chapter, source_path, full_text,
                                   outbound_links, modified_at, word_count, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.title)
        .bind(&doc.category)
        .bind(&doc.book)
        .bind(&doc.chapter)
        .bind(&doc.metadata.source_path)
        .bind(&doc.full_text)
        .bind(&links)
        .bind(doc.metadata.modified_at)
        .bind(doc.metadata.word_count as i64)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        for (i, chunk) in chunks.iter().enumerate() {
            let meta = &chunk.metadata;
            sqlx::query(&format!(
                "INSERT INTO chunks ({CHUNK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.sequence_index as i64)
            .bind(&chunk.text)
            .bind(chunk.token_count as i64)
            .bind(chunk.overlap_token_count as i64)
            .bind(chunk.hard_split)
            .bind(&chunk.hash)
            .bind(&meta.title)
            .bind(&meta.category)
            .bind(&meta.book)
            .bind(&meta.chapter)
            .bind(&meta.source_path)
            .bind(meta.outbound_link_count as i64)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

            sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, text) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.document_id)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;

            if let Some(v) = vectors.map(|vs| &vs[i]) {
                sqlx::query(
                    "INSERT INTO chunk_vectors (chunk_id, document_id, dims, embedding) VALUES (?, ?, ?, ?)",
                )
                .bind(&chunk.id)
                .bind(&chunk.document_id)
                .bind(v.len() as i64)
                .bind(vec_to_blob(v))
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            }
        }

        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    async fn delete_document(&self, id: &str) -> Result<bool, IndexError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let existed = delete_rows(&mut tx, id).await?;
        tx.commit().await.map_err(backend)?;
        Ok(existed)
    }
}

async fn delete_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    document_id: &str,
) -> Result<bool, IndexError> {
    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    let removed = sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await
        .map_err(backend)?;
    Ok(removed.rows_affected() > 0)
}
