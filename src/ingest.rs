//! Ingestion pipeline: vault → chunking → embedding → index.
//!
//! Ingestion is the only writer. An [`IngestLock`] (an advisory file lock
//! next to the database) lets at most one run proceed per database across
//! processes, an [`Ingestor`] serializes runs within a process behind a
//! mutex, and each document is swapped in with one atomic
//! [`IndexWriter::replace_document`] call, so concurrent searches see a
//! note either before or after its update. Embedding is inline and
//! non-fatal: if the provider fails, the note is stored keyword-only and
//! counted as pending.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use fd_lock::{RwLock, RwLockWriteGuard};
use serde::Serialize;
use tokio::sync::Mutex;

use vault_rag_core::chunk::{chunk_document, ChunkerConfig};
use vault_rag_core::embedding::Embedder;
use vault_rag_core::error::{EmbeddingError, RagError};
use vault_rag_core::index::{ChunkStore, IndexWriter};
use vault_rag_core::models::Document;

use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, embed_in_batches};
use crate::sqlite_index::SqliteIndex;
use crate::vault;

/// Counts for one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub documents: usize,
    pub chunks: usize,
    /// Chunks stored with a vector.
    pub embedded: usize,
    /// Chunks stored without a vector because embedding failed.
    pub pending: usize,
    pub skipped: usize,
    pub removed: usize,
}

/// Exclusive lock on ingestion into one database file.
pub struct IngestLock {
    path: PathBuf,
    file: RwLock<File>,
}

impl IngestLock {
    pub fn open(db_path: &Path) -> Result<Self> {
        let path = lock_path(db_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("opening lock file {}", path.display()))?;
        Ok(Self {
            path,
            file: RwLock::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock, or fail at once if another run holds it. Released
    /// when the guard drops or the process exits.
    pub fn try_acquire(&mut self) -> Result<RwLockWriteGuard<'_, File>> {
        match self.file.try_write() {
            Ok(guard) => Ok(guard),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => bail!(
                "another ingestion is already running (lock held on {})",
                self.path.display()
            ),
            Err(e) => Err(e).with_context(|| format!("locking {}", self.path.display())),
        }
    }
}

/// `<db>.ingest.lock`, beside the database.
pub fn lock_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".ingest.lock");
    PathBuf::from(name)
}

pub struct Ingestor {
    embedder: Arc<dyn Embedder>,
    writer: Arc<dyn IndexWriter>,
    store: Arc<dyn ChunkStore>,
    chunker: ChunkerConfig,
    batch_size: usize,
    lock: Mutex<()>,
}

impl Ingestor {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        writer: Arc<dyn IndexWriter>,
        store: Arc<dyn ChunkStore>,
        chunker: ChunkerConfig,
        batch_size: usize,
    ) -> Result<Self, RagError> {
        chunker.validate()?;
        Ok(Self {
            embedder,
            writer,
            store,
            chunker,
            batch_size: batch_size.max(1),
            lock: Mutex::new(()),
        })
    }

    /// Index `documents`, replacing any previous version of each. With
    /// `prune`, stored documents absent from `documents` are deleted.
    pub async fn ingest(&self, documents: &[Document], prune: bool) -> Result<IngestReport, RagError> {
        let _guard = self.lock.lock().await;
        let mut report = IngestReport::default();
        let mut seen: HashSet<&str> = HashSet::new();

        for doc in documents {
            if let Err(e) = doc.validate() {
                tracing::warn!(error = %e, "skipping document");
                report.skipped += 1;
                continue;
            }
            if !seen.insert(doc.id.as_str()) {
                tracing::warn!(
                    document_id = %doc.id,
                    path = %doc.metadata.source_path,
                    "skipping document with duplicate id"
                );
                report.skipped += 1;
                continue;
            }

            let chunks = chunk_document(doc, &self.chunker);
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let vectors = match embed_in_batches(self.embedder.as_ref(), &texts, self.batch_size).await {
                Ok(v) => Some(v),
                Err(EmbeddingError::Disabled) => None,
                Err(e) => {
                    tracing::warn!(document_id = %doc.id, error = %e, "embedding failed, storing keyword-only");
                    report.pending += chunks.len();
                    None
                }
            };

            self.writer
                .replace_document(doc, &chunks, vectors.as_deref())
                .await?;

            tracing::debug!(document_id = %doc.id, chunks = chunks.len(), "document indexed");
            report.documents += 1;
            report.chunks += chunks.len();
            if vectors.is_some() {
                report.embedded += chunks.len();
            }
        }

        if prune {
            let keep: HashSet<&str> = documents.iter().map(|d| d.id.as_str()).collect();
            for id in self.store.document_ids().await? {
                if !keep.contains(id.as_str()) && self.writer.delete_document(&id).await? {
                    tracing::info!(document_id = %id, "pruned document");
                    report.removed += 1;
                }
            }
        }

        Ok(report)
    }
}

/// What an ingestion run would write, without touching the index.
pub fn plan(documents: &[Document], chunker: &ChunkerConfig) -> IngestReport {
    let mut report = IngestReport::default();
    for doc in documents {
        if doc.validate().is_err() {
            report.skipped += 1;
            continue;
        }
        report.documents += 1;
        report.chunks += chunk_document(doc, chunker).len();
    }
    report
}

/// `vrag ingest`: scan the vault and index it.
pub async fn run_ingest(config: &Config, prune: bool, dry_run: bool, limit: Option<usize>) -> Result<()> {
    let scan = vault::scan_vault(&config.vault)?;
    let mut documents = scan.documents;
    if let Some(lim) = limit {
        documents.truncate(lim);
    }
    let unreadable = scan.failures.len();

    if dry_run {
        let report = plan(&documents, &config.chunking.chunker());
        println!("ingest {} (dry-run)", config.vault.root.display());
        println!("  notes found: {}", documents.len() + unreadable);
        println!("  notes to index: {}", report.documents);
        println!("  estimated chunks: {}", report.chunks);
        println!("  skipped: {}", report.skipped + unreadable);
        return Ok(());
    }

    let mut lock = IngestLock::open(&config.db.path)?;
    let _guard = lock.try_acquire()?;

    let pool = db::connect(config).await?;
    let index = Arc::new(SqliteIndex::new(pool.clone()));
    let ingestor = Ingestor::new(
        create_embedder(&config.embedding)?,
        index.clone(),
        index,
        config.chunking.chunker(),
        config.embedding.batch_size,
    )?;

    // A limited run sees only part of the vault, so it never prunes.
    let prune = prune && limit.is_none();
    let report = ingestor.ingest(&documents, prune).await?;

    println!("ingest {}", config.vault.root.display());
    println!("  documents indexed: {}", report.documents);
    println!("  chunks written: {}", report.chunks);
    if config.embedding.is_enabled() {
        println!("  embeddings written: {}", report.embedded);
        println!("  embeddings pending: {}", report.pending);
    }
    println!("  skipped: {}", report.skipped + unreadable);
    if prune {
        println!("  removed: {}", report.removed);
    }
    println!("ok");

    pool.close().await;
    Ok(())
}
