use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::routes;
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Public routes: no auth required (health probes only)
    let public_routes = Router::new()
        .route("/health", get(routes::health::health_check));

    // Protected routes: require VAULT_SYNC_AUTH_TOKEN when configured
    let protected_routes = Router::new()
        // Graceful shutdown (requires auth to prevent unauthorized termination)
        .route("/shutdown", post(routes::health::shutdown_handler))
        // Vault files
        .route("/api/files/tree", get(routes::files::file_tree))
        .route(
            "/api/files/read",
            post(routes::files::read_file).get(routes::files::read_file_query),
        )
        .route("/api/files/write", post(routes::files::write_file))
        .route("/api/files/autosave", post(routes::files::auto_save))
        .route("/api/files/dirty", post(routes::files::mark_dirty))
        .route("/api/files/create", post(routes::files::create_file))
        .route("/api/files/delete", post(routes::files::delete_file))
        .route("/api/files/rename", post(routes::files::rename_file))
        .route("/api/files/state", get(routes::files::file_state))
        // Semantic index
        .route("/api/index", post(routes::index::index_vault))
        .route("/api/index/file", post(routes::index::index_file))
        .route("/api/index/status", get(routes::index::index_status))
        .route("/api/index/delete", post(routes::index::delete_paths))
        .route("/api/index/rename", post(routes::index::rename_path))
        .route("/api/search", post(routes::index::search))
        // WebSocket for real-time events
        .route("/ws", get(ws_handler))
        .layer(axum::middleware::from_fn(auth_middleware));

    public_routes
        .merge(protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}

/// Middleware that validates `Authorization: Bearer <token>` against the
/// `VAULT_SYNC_AUTH_TOKEN` environment variable.  If the env var is not set
/// or empty, auth is skipped (development mode).
async fn auth_middleware(req: Request, next: Next) -> Result<Response, (StatusCode, axum::Json<serde_json::Value>)> {
    use std::sync::OnceLock;
    static AUTH_TOKEN: OnceLock<Option<String>> = OnceLock::new();
    let expected = AUTH_TOKEN.get_or_init(|| {
        std::env::var("VAULT_SYNC_AUTH_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
    });

    let expected_token = match expected {
        Some(t) => t.as_str(),
        None => return Ok(next.run(req).await),
    };

    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    match auth_header.and_then(bearer_token) {
        Some(token) if token == expected_token => Ok(next.run(req).await),
        Some(_) => {
            tracing::warn!("Auth token mismatch, rejecting request");
            Err(unauthorized())
        }
        None => {
            tracing::warn!("Missing or malformed Authorization header, rejecting request");
            Err(unauthorized())
        }
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let prefix = header.get(..7)?;
    prefix
        .eq_ignore_ascii_case("bearer ")
        .then(|| &header[7..])
        .filter(|token| !token.is_empty())
}

fn unauthorized() -> (StatusCode, axum::Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({"error": "Unauthorized", "status": 401})),
    )
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Bidirectional WebSocket handler
/// Server → Client: broadcasts ServerEvents as JSON
/// Client → Server: accepts `trigger_index`, `reindex_file` and `mark_dirty`
async fn handle_socket(socket: WebSocket, state: AppState) {
    tracing::info!("WebSocket client connected");
    let mut rx = state.event_tx.subscribe();
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    // Channel backpressure: skip missed events and continue
                    tracing::warn!("WebSocket client lagged, skipped {} events", n);
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                let text_str: &str = &text;
                if let Ok(cmd) = serde_json::from_str::<serde_json::Value>(text_str) {
                    handle_command(&state, &cmd).await;
                }
            }
        }
    });

    // Wait for either task to finish, then abort the other to prevent leaks
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        },
        _ = &mut recv_task => {
            send_task.abort();
        },
    }
    tracing::info!("WebSocket client disconnected");
}

async fn handle_command(state: &AppState, cmd: &serde_json::Value) {
    let cmd_type = cmd.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let path = cmd.get("path").and_then(|v| v.as_str()).unwrap_or("");
    tracing::debug!(command = cmd_type, "WebSocket command received");

    match cmd_type {
        "trigger_index" => {
            routes::index::spawn_background_indexing(state.index_manager.clone());
        }
        "reindex_file" if !path.is_empty() => match state.vault.resolve_path(path) {
            Ok(full_path) => {
                if let Err(e) = state.index_manager.index_single_file(&full_path).await {
                    tracing::warn!("Incremental reindex failed: {}", e);
                }
            }
            Err(e) => tracing::warn!("WebSocket reindex_file path validation failed: {}", e),
        },
        "mark_dirty" if !path.is_empty() => match state.vault.validate_path(path) {
            Ok(full_path) => state.file_ops.mark_dirty(&full_path),
            Err(e) => tracing::warn!("WebSocket mark_dirty path validation failed: {}", e),
        },
        _ => {
            tracing::debug!("Unknown WS command: {}", cmd_type);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("short"), None);
    }
}
