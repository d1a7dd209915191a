use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Maximum allowed length for search queries (characters).
pub const MAX_SEARCH_QUERY_LENGTH: usize = 1000;

/// Default named embedding model.
pub const DEFAULT_EMBED_MODEL: &str = "Xenova/bge-small-en-v1.5";

/// Note file extensions that belong to the vault.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["md", "markdown", "mdx", "txt"];

/// Directory names that never hold user notes.
const EXCLUDED_DIRECTORIES: &[&str] = &[
    ".git",
    ".obsidian",
    ".trash",
    ".vault-sync",
    "node_modules",
    "__pycache__",
    ".cache",
    ".idea",
    ".vscode",
];

/// Check whether a file extension (without leading dot) is a note extension.
pub fn is_supported_extension(ext: &str) -> bool {
    let ext = ext.to_ascii_lowercase();
    SUPPORTED_EXTENSIONS.contains(&ext.as_str())
}

pub fn is_excluded_directory(name: &str) -> bool {
    EXCLUDED_DIRECTORIES.contains(&name)
}

/// Where the embedding model comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelSource {
    /// A directory holding `model.onnx` and tokenizer files.
    LocalPath { path: PathBuf },
    /// A named Hugging Face repository, e.g. `Xenova/bge-small-en-v1.5`.
    Repository { repo_id: String },
}

impl ModelSource {
    /// A local path wins over a repository name when both are given.
    pub fn from_parts(local_path: Option<String>, repo_id: Option<String>) -> Self {
        match (local_path.filter(|p| !p.trim().is_empty()), repo_id) {
            (Some(path), _) => ModelSource::LocalPath {
                path: PathBuf::from(path),
            },
            (None, Some(repo_id)) if !repo_id.trim().is_empty() => ModelSource::Repository {
                repo_id: repo_id.trim().to_string(),
            },
            _ => ModelSource::Repository {
                repo_id: DEFAULT_EMBED_MODEL.to_string(),
            },
        }
    }

    /// Human-readable model name; part of the vector table identity.
    pub fn display_name(&self) -> String {
        match self {
            ModelSource::LocalPath { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.to_string_lossy().to_string()),
            ModelSource::Repository { repo_id } => repo_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen_addr: String,
    pub data_dir: String,
    pub vault_dir: String,
    pub embedding_model: ModelSource,
    pub rerank: bool,
    pub chunk_size: usize,
    pub autosave_debounce_ms: u64,
    pub insert_batch_size: usize,
    pub embed_batch_size: usize,
    pub embed_parallelism: usize,
    pub watcher_debounce_ms: u64,
    pub max_file_size_bytes: usize,
    pub exclude_patterns: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("VAULT_SYNC_PORT").unwrap_or_else(|_| "9731".to_string());

        let data_dir = std::env::var("VAULT_SYNC_DATA_DIR").unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join("vault-sync").to_string_lossy().to_string())
                .unwrap_or_else(|| ".vault-sync".to_string())
        });

        let vault_dir = std::env::var("VAULT_SYNC_VAULT_DIR").unwrap_or_else(|_| ".".to_string());

        let embedding_model = ModelSource::from_parts(
            std::env::var("VAULT_SYNC_EMBED_MODEL_PATH").ok(),
            std::env::var("VAULT_SYNC_EMBED_MODEL").ok(),
        );

        let exclude_patterns = std::env::var("VAULT_SYNC_EXCLUDE")
            .map(|v| parse_list(&v))
            .unwrap_or_default();

        Self {
            listen_addr: format!("127.0.0.1:{}", port),
            data_dir,
            vault_dir,
            embedding_model,
            rerank: std::env::var("VAULT_SYNC_RERANK")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            chunk_size: env_or("VAULT_SYNC_CHUNK_SIZE", 500),
            autosave_debounce_ms: env_or("VAULT_SYNC_AUTOSAVE_DEBOUNCE_MS", 5000),
            insert_batch_size: env_or("VAULT_SYNC_INSERT_BATCH_SIZE", default_insert_batch_size()),
            embed_batch_size: env_or("VAULT_SYNC_EMBED_BATCH_SIZE", default_embed_batch_size()),
            embed_parallelism: env_or("VAULT_SYNC_EMBED_PARALLELISM", default_embed_parallelism()),
            watcher_debounce_ms: env_or("VAULT_SYNC_WATCHER_DEBOUNCE_MS", 300),
            max_file_size_bytes: env_or("VAULT_SYNC_MAX_FILE_SIZE", 10 * 1024 * 1024), // 10MB
            exclude_patterns,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("vectors.sqlite3")
    }

    pub fn model_cache_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("models")
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// Non-Unix hosts get smaller batches and less embedding concurrency.

pub fn default_insert_batch_size() -> usize {
    if cfg!(unix) { 100 } else { 40 }
}

pub fn default_embed_batch_size() -> usize {
    if cfg!(unix) { 32 } else { 8 }
}

pub fn default_embed_parallelism() -> usize {
    if cfg!(unix) { 4 } else { 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_source_prefers_local_path() {
        let source = ModelSource::from_parts(
            Some("/models/minilm".into()),
            Some("Xenova/all-MiniLM-L6-v2".into()),
        );
        assert_eq!(
            source,
            ModelSource::LocalPath {
                path: PathBuf::from("/models/minilm")
            }
        );
        assert_eq!(source.display_name(), "minilm");
    }

    #[test]
    fn test_model_source_defaults_to_repository() {
        let source = ModelSource::from_parts(Some("  ".into()), None);
        assert_eq!(
            source,
            ModelSource::Repository {
                repo_id: DEFAULT_EMBED_MODEL.to_string()
            }
        );
    }

    #[test]
    fn test_parse_list_skips_blanks() {
        assert_eq!(
            parse_list("drafts/**, ,*.tmp.md"),
            vec!["drafts/**".to_string(), "*.tmp.md".to_string()]
        );
    }

    #[test]
    fn test_supported_extension_is_case_insensitive() {
        assert!(is_supported_extension("MD"));
        assert!(!is_supported_extension("rs"));
    }
}
