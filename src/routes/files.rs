use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use tracing::{debug, info, instrument, warn};

use crate::error::{AppError, AppResult};
use crate::file_state::FileState;
use crate::state::AppState;
use crate::vault::{FileInfo, FileTreeNode};

#[derive(Debug, Deserialize)]
pub struct FilePathRequest {
    pub path: String,
}

/// Query-based file read (for GET requests)
#[derive(Debug, Deserialize)]
pub struct ReadFileQuery {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct FileStateQuery {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WriteFileRequest {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub old_path: String,
    pub new_path: String,
}

#[derive(Debug, Serialize)]
pub struct ReadFileResponse {
    pub path: String,
    pub content: String,
    pub size: u64,
    pub encoding: String,
}

pub async fn file_tree(State(state): State<AppState>) -> AppResult<Json<Vec<FileTreeNode>>> {
    let vault = state.vault.clone();
    let tree = tokio::task::spawn_blocking(move || vault.list_files())
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Vault walk failed: {}", e)))??;
    debug!(entries = tree.len(), "Listed vault tree");
    Ok(Json(tree))
}

pub async fn read_file(
    State(state): State<AppState>,
    Json(req): Json<FilePathRequest>,
) -> AppResult<Json<ReadFileResponse>> {
    read_file_inner(state, &req.path).await
}

/// GET handler for reading files via query parameter
pub async fn read_file_query(
    State(state): State<AppState>,
    Query(query): Query<ReadFileQuery>,
) -> AppResult<Json<ReadFileResponse>> {
    read_file_inner(state, &query.path).await
}

async fn read_file_inner(state: AppState, file_path: &str) -> AppResult<Json<ReadFileResponse>> {
    let full_path = state.vault.validate_path(file_path)?;

    if !full_path.is_file() {
        warn!(path = file_path, "File not found");
        return Err(AppError::FileNotFound(file_path.to_string()));
    }

    let metadata = std::fs::metadata(&full_path)?;
    if metadata.len() > state.config.max_file_size_bytes as u64 {
        warn!(path = file_path, size = metadata.len(), max = state.config.max_file_size_bytes, "File too large to read");
        return Err(AppError::BadRequest("File too large to read".into()));
    }

    let content = state.file_ops.read_file(&full_path).await?;
    debug!(path = file_path, size = metadata.len(), "File read");

    Ok(Json(ReadFileResponse {
        path: file_path.to_string(),
        content,
        size: metadata.len(),
        encoding: "utf-8".into(),
    }))
}

/// Record an unsaved edit in the editor.
pub async fn mark_dirty(
    State(state): State<AppState>,
    Json(req): Json<FilePathRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let full_path = state.vault.validate_path(&req.path)?;
    state.file_ops.mark_dirty(&full_path);
    Ok(Json(serde_json::json!({
        "success": true,
        "path": req.path,
        "status": state.file_ops.states().status(&full_path),
    })))
}

#[instrument(skip(state, req), fields(path = %req.path))]
pub async fn write_file(
    State(state): State<AppState>,
    Json(req): Json<WriteFileRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let full_path = state.vault.validate_path(&req.path)?;
    let size = req.content.len();
    let written = state.file_ops.write_file(&full_path, req.content).await?;

    if written {
        info!(path = %req.path, size, "File written");
    }

    Ok(Json(serde_json::json!({
        "success": true,
        "written": written,
        "path": req.path,
        "size": size
    })))
}

/// Like `write_file`, but only once the edit has aged past the autosave window.
pub async fn auto_save(
    State(state): State<AppState>,
    Json(req): Json<WriteFileRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let full_path = state.vault.validate_path(&req.path)?;
    let written = state.file_ops.auto_save(&full_path, req.content).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "written": written,
        "path": req.path,
    })))
}

#[instrument(skip(state, req), fields(path = %req.path))]
pub async fn create_file(
    State(state): State<AppState>,
    Json(req): Json<WriteFileRequest>,
) -> AppResult<Json<FileInfo>> {
    let full_path = state.vault.validate_path(&req.path)?;

    if full_path.exists() {
        warn!(path = %req.path, "Cannot create file: already exists");
        return Err(AppError::BadRequest(format!(
            "File already exists: {}",
            req.path
        )));
    }

    let size = req.content.len();
    let info = state.file_ops.create_file(&full_path, req.content).await?;
    info!(path = %req.path, size, "File created");
    Ok(Json(info))
}

#[instrument(skip(state), fields(path = %req.path))]
pub async fn delete_file(
    State(state): State<AppState>,
    Json(req): Json<FilePathRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let full_path = state.vault.validate_path(&req.path)?;

    if !full_path.exists() {
        warn!(path = %req.path, "Cannot delete: file not found");
        return Err(AppError::FileNotFound(req.path));
    }

    state.file_ops.delete_file(&full_path).await?;
    let rows = state
        .index_manager
        .delete_file_paths(std::slice::from_ref(&full_path))
        .await?;

    info!(path = %req.path, rows, "File deleted");

    Ok(Json(serde_json::json!({
        "success": true,
        "path": req.path,
        "index_rows_removed": rows,
    })))
}

#[instrument(skip(state))]
pub async fn rename_file(
    State(state): State<AppState>,
    Json(req): Json<RenameRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let old_path = state.vault.validate_path(&req.old_path)?;
    let new_path = state.vault.validate_path(&req.new_path)?;

    if !old_path.exists() {
        warn!(old_path = %req.old_path, "Cannot rename: source not found");
        return Err(AppError::FileNotFound(req.old_path));
    }

    if !state.file_ops.rename_file(&old_path, &new_path).await? {
        return Err(AppError::RenameRejected(format!(
            "{} -> {}: source is not tracked or destination is in use",
            req.old_path, req.new_path
        )));
    }

    let rows = state
        .index_manager
        .rename_file_path(&old_path, &new_path)
        .await?;

    info!(old_path = %req.old_path, new_path = %req.new_path, rows, "File renamed");

    Ok(Json(serde_json::json!({
        "success": true,
        "old_path": req.old_path,
        "new_path": req.new_path,
        "index_rows_moved": rows,
    })))
}

/// Lifecycle state of one file, or of every tracked file.
pub async fn file_state(
    State(state): State<AppState>,
    Query(query): Query<FileStateQuery>,
) -> AppResult<Json<Vec<FileState>>> {
    let states = state.file_ops.states();
    match query.path {
        Some(path) => {
            let full_path = state.vault.validate_path(&path)?;
            let file = states
                .get(&full_path)
                .ok_or_else(|| AppError::FileNotFound(path.clone()))?;
            Ok(Json(vec![file]))
        }
        None => Ok(Json(states.snapshot())),
    }
}
