//! Local semantic index for a markdown vault.
//!
//! Notes are split into chunks, embedded and kept in a per-model vector
//! table that a reconciliation pass keeps in step with the files on disk.
//! Editor file I/O goes through a per-path queue with a small state machine
//! tracking unsaved changes. The `vault-sync` binary serves all of it over
//! HTTP and WebSocket.

pub mod chunker;
pub mod config;
pub mod embedder;
pub mod error;
pub mod file_ops;
pub mod file_queue;
pub mod file_state;
pub mod indexer;
pub mod reconcile;
pub mod rerank;
pub mod routes;
pub mod server;
pub mod state;
pub mod table;
pub mod vault;
pub mod watcher;

pub use chunker::{Chunk, ChunkKind, Chunker};
pub use config::{AppConfig, ModelSource};
pub use embedder::{EmbedInput, EmbeddingBackend, EmbeddingFunction, EmbeddingOptions};
pub use error::{AppError, AppResult};
pub use file_ops::{FileOperation, FileOperationsManager};
pub use file_queue::FileOperationsQueue;
pub use file_state::{FileState, FileStateManager, FileStatus};
pub use indexer::{IndexManager, SearchFilter, SearchResult};
pub use reconcile::{ReconcileSummary, ReconciliationEngine};
pub use state::ServerEvent;
pub use table::{VectorDb, VectorTable};
pub use vault::{FileInfo, Vault};
