use axum::{extract::State, Json};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::indexer::{IndexManager, IndexStatus, SearchFilter, SearchResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub filter: Option<SearchFilter>,
}

fn default_limit() -> usize {
    10
}

#[derive(Debug, Deserialize)]
pub struct IndexFileRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct DeletePathsRequest {
    pub paths: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct RenamePathRequest {
    pub old_path: String,
    pub new_path: String,
}

/// Run a full reconciliation pass in the background.
///
/// Returns `false` without spawning when a pass is already running; the
/// manager would coalesce it anyway.
pub fn spawn_background_indexing(index_manager: Arc<IndexManager>) -> bool {
    if index_manager.is_indexing() {
        tracing::info!("Skipping background indexing: a pass is already in progress");
        return false;
    }

    tokio::spawn(async move {
        // Progress and failures are broadcast by the manager itself.
        match index_manager.index_directory(|_| {}).await {
            Ok(Some(summary)) => {
                tracing::debug!(?summary, "Background indexing finished");
            }
            Ok(None) => {}
            Err(e) => tracing::error!("Background indexing failed: {}", e),
        }
    });
    true
}

pub async fn index_vault(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    if !spawn_background_indexing(state.index_manager.clone()) {
        return Ok(Json(serde_json::json!({
            "status": "already_indexing",
        })));
    }

    Ok(Json(serde_json::json!({
        "status": "indexing_started",
    })))
}

pub async fn index_file(
    State(state): State<AppState>,
    Json(req): Json<IndexFileRequest>,
) -> AppResult<Json<serde_json::Value>> {
    // The note may be gone already; that just drops its rows.
    let full_path = state.vault.resolve_path(&req.path)?;
    let chunks = state.index_manager.index_single_file(&full_path).await?;
    Ok(Json(serde_json::json!({
        "path": req.path,
        "chunks": chunks,
    })))
}

pub async fn delete_paths(
    State(state): State<AppState>,
    Json(req): Json<DeletePathsRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let paths = req
        .paths
        .iter()
        .map(|p| state.vault.resolve_path(p))
        .collect::<AppResult<Vec<PathBuf>>>()?;
    let rows = state.index_manager.delete_file_paths(&paths).await?;
    Ok(Json(serde_json::json!({
        "paths": paths.len(),
        "rows": rows,
    })))
}

pub async fn rename_path(
    State(state): State<AppState>,
    Json(req): Json<RenamePathRequest>,
) -> AppResult<Json<serde_json::Value>> {
    let old_path = state.vault.resolve_path(&req.old_path)?;
    let new_path = state.vault.resolve_path(&req.new_path)?;
    let rows = state
        .index_manager
        .rename_file_path(&old_path, &new_path)
        .await?;
    Ok(Json(serde_json::json!({
        "old_path": req.old_path,
        "new_path": req.new_path,
        "rows": rows,
    })))
}

pub async fn index_status(State(state): State<AppState>) -> AppResult<Json<IndexStatus>> {
    Ok(Json(state.index_manager.status().await?))
}

pub async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> AppResult<Json<Vec<SearchResult>>> {
    if req.limit == 0 {
        return Err(AppError::BadRequest("limit must be at least 1".into()));
    }
    // Clamp limit to a reasonable upper bound
    let limit = req.limit.min(200);

    // Filter literals are stored as absolute note paths.
    let filter = match req.filter {
        Some(filter) => Some(resolve_filter(&state, filter)?),
        None => None,
    };
    let predicate = filter.as_ref().and_then(SearchFilter::to_predicate);

    let results = state
        .index_manager
        .search(&req.query, limit, predicate.as_deref())
        .await?;
    tracing::debug!(results = results.len(), "Semantic search completed");
    Ok(Json(results))
}

fn resolve_filter(state: &AppState, filter: SearchFilter) -> AppResult<SearchFilter> {
    let resolve = |p: &str| -> AppResult<String> {
        Ok(state.vault.resolve_path(p)?.to_string_lossy().to_string())
    };
    Ok(SearchFilter {
        paths: filter
            .paths
            .map(|paths| paths.iter().map(|p| resolve(p)).collect::<AppResult<Vec<_>>>())
            .transpose()?,
        under: filter.under.map(|dir| resolve(&dir)).transpose()?,
    })
}
