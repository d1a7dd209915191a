//! Router-level tests: requests go through the full axum stack with a
//! deterministic embedding backend behind the index.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tower::ServiceExt;

use vault_sync::config::AppConfig;
use vault_sync::embedder::{EmbeddingBackend, EmbeddingFunction, EmbeddingOptions};
use vault_sync::error::AppResult;
use vault_sync::server::create_app;
use vault_sync::state::AppState;
use vault_sync::watcher::FileWatcherManager;
use vault_sync::{Chunker, FileOperationsManager, FileStateManager, FileStatus, IndexManager, Vault, VectorDb};

/// Letter-frequency vectors: identical texts embed identically.
struct LetterBackend;

impl EmbeddingBackend for LetterBackend {
    fn embed(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.01f32; 26];
                for b in text.to_ascii_lowercase().bytes().filter(u8::is_ascii_lowercase) {
                    vector[(b - b'a') as usize] += 1.0;
                }
                vector
            })
            .collect())
    }
}

async fn test_state(dir: &tempfile::TempDir) -> AppState {
    let (event_tx, _) = broadcast::channel(256);
    let vault = Arc::new(Vault::open(dir.path(), &[], 1024 * 1024).unwrap());
    let embedding =
        EmbeddingFunction::from_backend("letters", Arc::new(LetterBackend), EmbeddingOptions::default())
            .unwrap();
    let db = VectorDb::open_in_memory().unwrap();
    let index_manager = Arc::new(
        IndexManager::open(
            &db,
            vault.clone(),
            Arc::new(embedding),
            Chunker::new(200),
            10,
            None,
            event_tx.clone(),
        )
        .await
        .unwrap(),
    );

    let states = Arc::new(FileStateManager::new(vault.root(), event_tx.clone()));
    states.track_all(vault.list_flat().unwrap());
    let file_ops = Arc::new(FileOperationsManager::new(
        vault.root(),
        states,
        event_tx.clone(),
        Duration::ZERO,
    ));

    AppState {
        config: AppConfig::from_env(),
        vault,
        index_manager,
        file_ops,
        watcher_manager: Arc::new(FileWatcherManager::new(100, event_tx.clone())),
        event_tx,
    }
}

async fn call(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = create_app(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn vault_with(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (rel, content) in files {
        std::fs::write(dir.path().join(rel), content).unwrap();
    }
    dir
}

#[tokio::test]
async fn test_health_reports_service() {
    let dir = vault_with(&[]);
    let state = test_state(&dir).await;

    let (status, body) = call(&state, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "vault-sync");
    assert_eq!(body["indexing"], false);
}

#[tokio::test]
async fn test_index_file_then_search() {
    let dir = vault_with(&[("a.md", "zebra quartz"), ("b.md", "banana bread")]);
    let state = test_state(&dir).await;

    for path in ["a.md", "b.md"] {
        let (status, body) = call(&state, "POST", "/api/index/file", Some(json!({ "path": path }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["chunks"], 1);
    }

    let (status, body) = call(
        &state,
        "POST",
        "/api/search",
        Some(json!({ "query": "zebra quartz", "limit": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let hits = body.as_array().unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0]["name"], "a.md");
    assert_eq!(hits[0]["content"], "zebra quartz");

    let (status, body) = call(
        &state,
        "POST",
        "/api/search",
        Some(json!({ "query": "zebra", "filter": { "paths": ["b.md"] } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let hits = body.as_array().unwrap();
    assert!(hits.iter().all(|h| h["name"] == "b.md"));

    let (status, body) = call(&state, "GET", "/api/index/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["row_count"], 2);
    assert_eq!(body["model"], "letters");
}

#[tokio::test]
async fn test_empty_search_is_bad_request() {
    let dir = vault_with(&[]);
    let state = test_state(&dir).await;

    let (status, body) = call(&state, "POST", "/api/search", Some(json!({ "query": "  " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);
}

#[tokio::test]
async fn test_write_only_happens_after_dirty() {
    let dir = vault_with(&[("note.md", "old")]);
    let state = test_state(&dir).await;
    let write = json!({ "path": "note.md", "content": "new" });

    let (status, body) = call(&state, "POST", "/api/files/write", Some(write.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["written"], false);

    let (status, body) = call(&state, "POST", "/api/files/dirty", Some(json!({ "path": "note.md" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "dirty");

    let (_, body) = call(&state, "POST", "/api/files/write", Some(write)).await;
    assert_eq!(body["written"], true);
    assert_eq!(std::fs::read_to_string(dir.path().join("note.md")).unwrap(), "new");

    let note = state.vault.root().join("note.md");
    assert_eq!(state.file_ops.states().status(&note), Some(FileStatus::Clean));

    let (status, body) = call(&state, "GET", "/api/files/state?path=note.md", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["status"], "clean");
}

#[tokio::test]
async fn test_rename_moves_rows_and_refuses_tracked_destination() {
    let dir = vault_with(&[("a.md", "alpha words"), ("b.md", "beta words")]);
    let state = test_state(&dir).await;
    call(&state, "POST", "/api/index/file", Some(json!({ "path": "a.md" }))).await;

    let (status, body) = call(
        &state,
        "POST",
        "/api/files/rename",
        Some(json!({ "old_path": "a.md", "new_path": "b.md" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], 409);
    assert!(dir.path().join("a.md").exists());

    let (status, body) = call(
        &state,
        "POST",
        "/api/files/rename",
        Some(json!({ "old_path": "a.md", "new_path": "c.md" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["index_rows_moved"], 1);
    assert!(dir.path().join("c.md").exists());
    assert!(!dir.path().join("a.md").exists());
}

#[tokio::test]
async fn test_delete_removes_file_and_rows() {
    let dir = vault_with(&[("gone.md", "temporary words")]);
    let state = test_state(&dir).await;
    call(&state, "POST", "/api/index/file", Some(json!({ "path": "gone.md" }))).await;

    let (status, body) = call(&state, "POST", "/api/files/delete", Some(json!({ "path": "gone.md" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["index_rows_removed"], 1);
    assert!(!dir.path().join("gone.md").exists());

    let (status, _) = call(&state, "POST", "/api/files/delete", Some(json!({ "path": "gone.md" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
