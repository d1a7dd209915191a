//! Filesystem ⇄ vector table reconciliation.
//!
//! A pass diffs the notes on disk against the per-note projection of the
//! table, removes rows for notes that no longer exist and fully replaces the
//! rows of every new or changed note. Inserts run sequentially in fixed-size
//! batches with progress reported after each one.

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chunker::{Chunk, Chunker};
use crate::embedder::{EmbedInput, EmbeddingFunction};
use crate::error::{AppError, AppResult};
use crate::table::{IndexEntry, IndexedFile, VectorTable, notepath_in};
use crate::vault::{FileInfo, Vault};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    /// Notes whose rows were removed because the file is gone or empty.
    pub deleted_paths: usize,
    /// Notes (re-)inserted during the pass.
    pub indexed_files: usize,
    pub inserted_rows: usize,
    /// Notes left alone because they were up to date.
    pub unchanged_files: usize,
}

impl ReconcileSummary {
    pub fn is_noop(&self) -> bool {
        self.deleted_paths == 0 && self.indexed_files == 0 && self.inserted_rows == 0
    }
}

/// A row waiting for its vector.
struct PendingRow {
    entry: IndexEntry,
}

pub struct ReconciliationEngine {
    chunker: Chunker,
    embedding: Arc<EmbeddingFunction>,
    insert_batch_size: usize,
}

impl ReconciliationEngine {
    pub fn new(chunker: Chunker, embedding: Arc<EmbeddingFunction>, insert_batch_size: usize) -> Self {
        Self {
            chunker,
            embedding,
            insert_batch_size: insert_batch_size.max(1),
        }
    }

    pub fn embedding(&self) -> &Arc<EmbeddingFunction> {
        &self.embedding
    }

    /// Bring `table` in line with every note under `vault`.
    ///
    /// `on_progress` receives the inserted fraction after every committed
    /// batch and a final `1.0`. An insert failure stops the pass; rows from
    /// earlier batches stay.
    pub async fn repopulate(
        &self,
        table: &VectorTable,
        vault: &Arc<Vault>,
        on_progress: impl Fn(f32),
    ) -> AppResult<ReconcileSummary> {
        let files = {
            let vault = vault.clone();
            tokio::task::spawn_blocking(move || vault.list_flat())
                .await
                .map_err(|e| AppError::IndexError(format!("Vault walk failed: {}", e)))??
        };
        let indexed: HashMap<String, IndexedFile> = table
            .indexed_files()
            .await?
            .into_iter()
            .map(|f| (f.notepath.clone(), f))
            .collect();

        let mut summary = ReconcileSummary::default();

        // Deletions: indexed notes with no file on disk.
        let on_disk: HashSet<String> = files.iter().map(notepath).collect();
        let missing: Vec<&String> = indexed.keys().filter(|p| !on_disk.contains(*p)).collect();
        if !missing.is_empty() {
            summary.deleted_paths = missing.len();
            match table.delete(&notepath_in(&missing)).await {
                Ok(rows) => info!(paths = missing.len(), rows, "Removed rows for deleted notes"),
                Err(e) => warn!("Failed to remove rows for {} deleted notes: {}", missing.len(), e),
            }
        }

        // Additions and updates.
        let mut pending = Vec::new();
        for file in &files {
            let content = read_note(file).await?;
            let chunks = self.chunker.chunk(&content);
            let path = notepath(file);
            if !is_indexable(&chunks) {
                if indexed.contains_key(&path) {
                    info!("Note {} was emptied, removing its rows", file.relative_path);
                    delete_rows_best_effort(table, &path).await;
                    summary.deleted_paths += 1;
                } else {
                    debug!("Skipping empty note {}", file.relative_path);
                }
                continue;
            }

            let hash = content_hash(&content);
            let existing = indexed.get(&path);
            if !is_stale(existing, file, &hash) {
                summary.unchanged_files += 1;
                continue;
            }
            if existing.is_some() {
                delete_rows_best_effort(table, &path).await;
            }
            summary.indexed_files += 1;
            pending.extend(pending_rows(file, chunks, &hash));
        }

        let total = pending.len();
        info!(
            files = files.len(),
            stale = summary.indexed_files,
            unchanged = summary.unchanged_files,
            deleted = summary.deleted_paths,
            rows = total,
            "Reconciling vector table {}",
            table.name()
        );

        let mut rows = pending.into_iter().peekable();
        while rows.peek().is_some() {
            let batch: Vec<PendingRow> = rows.by_ref().take(self.insert_batch_size).collect();
            summary.inserted_rows += self.insert_batch(table, batch).await?;
            on_progress(summary.inserted_rows as f32 / total as f32);
        }

        on_progress(1.0);
        Ok(summary)
    }

    /// Replace the rows of one note. Returns the number of rows inserted.
    pub async fn index_file(&self, table: &VectorTable, file: &FileInfo) -> AppResult<usize> {
        let content = read_note(file).await?;
        let path = notepath(file);
        delete_rows_best_effort(table, &path).await;

        let chunks = self.chunker.chunk(&content);
        if !is_indexable(&chunks) {
            debug!("Note {} is empty, nothing to index", file.relative_path);
            return Ok(0);
        }

        let hash = content_hash(&content);
        let rows: Vec<PendingRow> = pending_rows(file, chunks, &hash).collect();
        let mut inserted = 0;
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            let batch: Vec<PendingRow> = rows.by_ref().take(self.insert_batch_size).collect();
            inserted += self.insert_batch(table, batch).await?;
        }
        debug!(rows = inserted, "Indexed {}", file.relative_path);
        Ok(inserted)
    }

    async fn insert_batch(&self, table: &VectorTable, batch: Vec<PendingRow>) -> AppResult<usize> {
        let inputs = batch
            .iter()
            .map(|row| EmbedInput::Text(row.entry.content.clone()))
            .collect();
        let vectors = self.embedding.compute_embeddings(inputs).await?;
        let entries: Vec<IndexEntry> = batch
            .into_iter()
            .zip(vectors)
            .map(|(row, vector)| IndexEntry { vector, ..row.entry })
            .collect();
        table.add(entries).await
    }
}

/// Path string stored in `notepath`.
pub fn notepath(file: &FileInfo) -> String {
    file.path.to_string_lossy().to_string()
}

/// SHA-256 of the note text, hex encoded.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Unindexed, modified after indexing, or different text than indexed.
fn is_stale(indexed: Option<&IndexedFile>, file: &FileInfo, hash: &str) -> bool {
    match indexed {
        None => true,
        Some(row) => {
            file.modified.timestamp_millis() > row.file_modified_ms
                || row.content_hash.as_deref().is_some_and(|h| h != hash)
        }
    }
}

fn is_indexable(chunks: &[Chunk]) -> bool {
    chunks.first().is_some_and(|c| !c.content.trim().is_empty())
}

async fn read_note(file: &FileInfo) -> AppResult<String> {
    let bytes = tokio::fs::read(&file.path).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn delete_rows_best_effort(table: &VectorTable, path: &str) {
    if let Err(e) = table.delete(&notepath_in(&[path])).await {
        warn!("Failed to delete stale rows for {}: {}", path, e);
    }
}

fn pending_rows<'a>(
    file: &'a FileInfo,
    chunks: Vec<Chunk>,
    hash: &'a str,
) -> impl Iterator<Item = PendingRow> + 'a {
    let now = Utc::now();
    chunks.into_iter().enumerate().map(move |(i, chunk)| PendingRow {
        entry: IndexEntry {
            name: file.name.clone(),
            notepath: notepath(file),
            content: chunk.content,
            subnote_index: i,
            time_added: now,
            file_modified: file.modified,
            file_created: file.created,
            block_starting_pos: Some(chunk.start_offset),
            heading_context: chunk.heading_context,
            content_hash: Some(hash.to_string()),
            vector: Vec::new(),
        },
    })
}
