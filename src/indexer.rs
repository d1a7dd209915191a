//! Semantic index façade.
//!
//! Owns the vector table for the configured (model, vault) pair and exposes
//! the operations the UI layer consumes: search, full reconciliation,
//! single-file re-indexing, and path deletion and renaming.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::chunker::Chunker;
use crate::config::MAX_SEARCH_QUERY_LENGTH;
use crate::embedder::EmbeddingFunction;
use crate::error::{AppError, AppResult};
use crate::reconcile::{ReconcileSummary, ReconciliationEngine};
use crate::rerank::{Reranker, rerank_by};
use crate::state::ServerEvent;
use crate::table::{IndexEntry, VectorDb, VectorTable, get_or_create_table, notepath_in, notepath_under};
use crate::vault::Vault;

/// Results fetched per requested result when a re-ranker refines them.
const RERANK_OVERFETCH: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub entry: IndexEntry,
    /// Cosine distance to the query, lower is closer.
    pub distance: f32,
    /// Cross-encoder relevance, when re-ranking is enabled.
    pub rerank_score: Option<f32>,
}

/// Structured search restriction, turned into an escaped predicate.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchFilter {
    /// Only these notes.
    #[serde(default)]
    pub paths: Option<Vec<String>>,
    /// Only notes inside this directory.
    #[serde(default)]
    pub under: Option<String>,
}

impl SearchFilter {
    pub fn to_predicate(&self) -> Option<String> {
        let mut clauses = Vec::new();
        if let Some(paths) = self.paths.as_ref().filter(|p| !p.is_empty()) {
            clauses.push(notepath_in(paths));
        }
        if let Some(dir) = self.under.as_deref().filter(|d| !d.is_empty()) {
            clauses.push(notepath_under(dir));
        }
        (!clauses.is_empty()).then(|| clauses.join(" AND "))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub is_indexing: bool,
    pub table: String,
    pub model: String,
    pub dimensionality: usize,
    pub row_count: usize,
    pub last_summary: Option<ReconcileSummary>,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct LastPass {
    summary: Option<ReconcileSummary>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

pub struct IndexManager {
    vault: Arc<Vault>,
    table: VectorTable,
    engine: ReconciliationEngine,
    reranker: Option<Arc<dyn Reranker>>,
    events: broadcast::Sender<ServerEvent>,
    is_indexing: AtomicBool,
    /// Serializes table writers: a full pass and single-file updates never interleave.
    writer_lock: tokio::sync::Mutex<()>,
    last_pass: RwLock<LastPass>,
}

impl IndexManager {
    /// Open (or create, or rebuild on schema drift) the table for this
    /// model and vault.
    pub async fn open(
        db: &VectorDb,
        vault: Arc<Vault>,
        embedding: Arc<EmbeddingFunction>,
        chunker: Chunker,
        insert_batch_size: usize,
        reranker: Option<Arc<dyn Reranker>>,
        events: broadcast::Sender<ServerEvent>,
    ) -> AppResult<Self> {
        let table = get_or_create_table(db, &embedding, vault.root()).await?;
        Ok(Self {
            vault,
            table,
            engine: ReconciliationEngine::new(chunker, embedding, insert_batch_size),
            reranker,
            events,
            is_indexing: AtomicBool::new(false),
            writer_lock: tokio::sync::Mutex::new(()),
            last_pass: RwLock::new(LastPass::default()),
        })
    }

    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    pub fn table(&self) -> &VectorTable {
        &self.table
    }

    pub fn is_indexing(&self) -> bool {
        self.is_indexing.load(Ordering::Acquire)
    }

    /// Nearest chunks to `query`, optionally restricted by a SQL predicate.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: Option<&str>,
    ) -> AppResult<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::BadRequest("Search query is empty".into()));
        }
        if query.chars().count() > MAX_SEARCH_QUERY_LENGTH {
            return Err(AppError::BadRequest(format!(
                "Search query exceeds {} characters",
                MAX_SEARCH_QUERY_LENGTH
            )));
        }
        let limit = limit.max(1);

        let vector = self.engine.embedding().embed_query(query).await?;
        let fetch = match self.reranker {
            Some(_) => limit * RERANK_OVERFETCH,
            None => limit,
        };
        let hits = self.table.vector_search(vector, fetch, filter).await?;

        let Some(reranker) = self.reranker.clone() else {
            return Ok(hits
                .into_iter()
                .map(|hit| SearchResult {
                    entry: hit.entry,
                    distance: hit.distance,
                    rerank_score: None,
                })
                .collect());
        };

        let query = query.to_string();
        let ranked = tokio::task::spawn_blocking(move || {
            rerank_by(reranker.as_ref(), &query, hits, |hit| hit.entry.content.clone())
        })
        .await
        .map_err(|e| AppError::SearchError(format!("Re-ranking task failed: {}", e)))??;

        Ok(ranked
            .into_iter()
            .take(limit)
            .map(|(hit, score)| SearchResult {
                entry: hit.entry,
                distance: hit.distance,
                rerank_score: Some(score),
            })
            .collect())
    }

    /// Reconcile the whole vault. Returns `None` when a pass is already
    /// running; the running pass covers the request.
    pub async fn index_directory(
        &self,
        on_progress: impl Fn(f32) + Send + Sync,
    ) -> AppResult<Option<ReconcileSummary>> {
        if self
            .is_indexing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("Indexing already in progress, skipping duplicate request");
            return Ok(None);
        }

        // Reset the flag on every exit path, panics included.
        struct IndexGuard<'a>(&'a AtomicBool);
        impl Drop for IndexGuard<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::SeqCst);
            }
        }
        let _guard = IndexGuard(&self.is_indexing);

        let _writer = self.writer_lock.lock().await;
        let start = std::time::Instant::now();
        let _ = self.events.send(ServerEvent::IndexingStarted);

        let events = self.events.clone();
        let result = self
            .engine
            .repopulate(&self.table, &self.vault, |fraction| {
                on_progress(fraction);
                let _ = events.send(ServerEvent::IndexingProgress { fraction });
            })
            .await;

        let duration_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(summary) => {
                info!(
                    deleted = summary.deleted_paths,
                    indexed = summary.indexed_files,
                    rows = summary.inserted_rows,
                    unchanged = summary.unchanged_files,
                    "Indexing complete in {}ms",
                    duration_ms
                );
                *self.last_pass.write() = LastPass {
                    summary: Some(summary.clone()),
                    finished_at: Some(Utc::now()),
                    error: None,
                };
                let _ = self.events.send(ServerEvent::IndexingCompleted {
                    deleted_paths: summary.deleted_paths,
                    indexed_files: summary.indexed_files,
                    inserted_rows: summary.inserted_rows,
                    duration_ms,
                });
                let _ = self.events.send(ServerEvent::SearchReady);
                Ok(Some(summary))
            }
            Err(e) => {
                warn!("Indexing failed after {}ms: {}", duration_ms, e);
                // The pass always ends at 1.0, failed or not.
                on_progress(1.0);
                let _ = self.events.send(ServerEvent::IndexingProgress { fraction: 1.0 });
                self.last_pass.write().error = Some(e.to_string());
                let _ = self.events.send(ServerEvent::IndexingError {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Replace one note's rows. Paths that are not indexable notes (or no
    /// longer exist) just lose their rows.
    pub async fn index_single_file(&self, path: &Path) -> AppResult<usize> {
        let _writer = self.writer_lock.lock().await;

        if !self.vault.is_indexable(path) {
            debug!("{} is not an indexable note, dropping its rows", path.display());
            let path = path.to_string_lossy().into_owned();
            self.table.delete(&notepath_in(&[path])).await?;
            return Ok(0);
        }

        let file = self.vault.file_info(path)?;
        let rows = self.engine.index_file(&self.table, &file).await?;
        let _ = self.events.send(ServerEvent::FileIndexed {
            path: file.relative_path.clone(),
            chunks: rows,
        });
        Ok(rows)
    }

    /// Remove rows for each path and, for directories, everything below it.
    pub async fn delete_file_paths(&self, paths: &[PathBuf]) -> AppResult<usize> {
        if paths.is_empty() {
            return Ok(0);
        }
        let predicate = paths
            .iter()
            .map(|p| notepath_under(&p.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" OR ");

        let _writer = self.writer_lock.lock().await;
        let rows = self.table.delete(&predicate).await?;
        info!(paths = paths.len(), rows, "Deleted index rows");
        Ok(rows)
    }

    /// Point rows at a note's (or directory's) new location.
    pub async fn rename_file_path(&self, old: &Path, new: &Path) -> AppResult<usize> {
        let _writer = self.writer_lock.lock().await;
        let rows = self
            .table
            .rename_path(&old.to_string_lossy(), &new.to_string_lossy())
            .await?;
        info!(rows, "Renamed index rows {} -> {}", old.display(), new.display());
        Ok(rows)
    }

    pub async fn status(&self) -> AppResult<IndexStatus> {
        let row_count = self.table.count_rows(None).await?;
        let embedding = self.engine.embedding();
        let last = self.last_pass.read();
        Ok(IndexStatus {
            is_indexing: self.is_indexing(),
            table: self.table.name().to_string(),
            model: embedding.name().to_string(),
            dimensionality: embedding.dimensionality(),
            row_count,
            last_summary: last.summary.clone(),
            last_indexed_at: last.finished_at,
            last_error: last.error.clone(),
        })
    }
}
