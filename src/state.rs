use crate::chunker::Chunker;
use crate::config::AppConfig;
use crate::embedder::{EmbeddingFunction, EmbeddingOptions, FastEmbedLoader};
use crate::error::{AppError, AppResult};
use crate::file_ops::{FileOperation, FileOperationsManager};
use crate::file_state::{FileStateManager, FileStatus};
use crate::indexer::IndexManager;
use crate::rerank::{FastEmbedReranker, Reranker};
use crate::table::VectorDb;
use crate::vault::Vault;
use crate::watcher::FileWatcherManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Events broadcast to all connected WebSocket clients
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "index_started")]
    IndexingStarted,
    #[serde(rename = "index_progress")]
    IndexingProgress { fraction: f32 },
    #[serde(rename = "index_complete")]
    IndexingCompleted {
        deleted_paths: usize,
        indexed_files: usize,
        inserted_rows: usize,
        duration_ms: u64,
    },
    #[serde(rename = "index_error")]
    IndexingError { error: String },
    #[serde(rename = "file_indexed")]
    FileIndexed { path: String, chunks: usize },
    #[serde(rename = "file_changed")]
    FileChanged { path: String, change_type: String },
    #[serde(rename = "file_state_changed")]
    FileStateChanged {
        path: String,
        status: FileStatus,
        error: Option<String>,
    },
    #[serde(rename = "file_state_removed")]
    FileStateRemoved { path: String },
    #[serde(rename = "file_state_renamed")]
    FileStateRenamed { old_path: String, new_path: String },
    #[serde(rename = "file_operation_started")]
    FileOperationStarted { operation: FileOperation, path: String },
    #[serde(rename = "file_operation_completed")]
    FileOperationCompleted {
        operation: FileOperation,
        path: String,
        error: Option<String>,
    },
    #[serde(rename = "search_ready")]
    SearchReady,
}

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub vault: Arc<Vault>,
    pub index_manager: Arc<IndexManager>,
    pub file_ops: Arc<FileOperationsManager>,
    pub watcher_manager: Arc<FileWatcherManager>,
    pub event_tx: broadcast::Sender<ServerEvent>,
}

impl AppState {
    /// Load the embedding model (and the re-ranker when enabled), open the
    /// vector table and start tracking every note as clean.
    pub async fn new(config: AppConfig) -> AppResult<Self> {
        let (event_tx, _) = broadcast::channel(256);

        let data_dir = std::path::PathBuf::from(&config.data_dir);
        tokio::fs::create_dir_all(&data_dir).await.map_err(AppError::Io)?;

        let vault = Arc::new(Vault::open(
            &config.vault_dir,
            &config.exclude_patterns,
            config.max_file_size_bytes,
        )?);

        let embedding = {
            let source = config.embedding_model.clone();
            let options = EmbeddingOptions::from_config(&config);
            let loader = FastEmbedLoader::new(config.model_cache_dir()).with_download_progress(true);
            tokio::task::spawn_blocking(move || EmbeddingFunction::load(&loader, &source, options))
                .await
                .map_err(|e| AppError::ModelLoad(format!("Model load task failed: {}", e)))??
        };

        let reranker: Option<Arc<dyn Reranker>> = if config.rerank {
            let cache_dir = config.model_cache_dir();
            let reranker: Arc<dyn Reranker> = Arc::new(
                tokio::task::spawn_blocking(move || FastEmbedReranker::load(cache_dir))
                    .await
                    .map_err(|e| AppError::ModelLoad(format!("Re-ranker load task failed: {}", e)))??,
            );
            Some(reranker)
        } else {
            None
        };

        let db = VectorDb::open(&config.db_path())?;
        let index_manager = Arc::new(
            IndexManager::open(
                &db,
                vault.clone(),
                Arc::new(embedding),
                Chunker::new(config.chunk_size),
                config.insert_batch_size,
                reranker,
                event_tx.clone(),
            )
            .await?,
        );

        let states = Arc::new(FileStateManager::new(vault.root(), event_tx.clone()));
        {
            let vault = vault.clone();
            let files = tokio::task::spawn_blocking(move || vault.list_flat())
                .await
                .map_err(|e| AppError::Internal(anyhow::anyhow!("Vault walk failed: {}", e)))??;
            tracing::info!(files = files.len(), "Tracking vault notes");
            states.track_all(files);
        }

        let file_ops = Arc::new(FileOperationsManager::new(
            vault.root(),
            states,
            event_tx.clone(),
            Duration::from_millis(config.autosave_debounce_ms),
        ));

        let watcher_manager = Arc::new(FileWatcherManager::new(
            config.watcher_debounce_ms,
            event_tx.clone(),
        ));

        Ok(Self {
            config,
            vault,
            index_manager,
            file_ops,
            watcher_manager,
            event_tx,
        })
    }
}
