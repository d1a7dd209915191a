use anyhow::Result;
use std::net::SocketAddr;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use vault_sync::{config, routes, server, state};

#[tokio::main]
async fn main() -> Result<()> {
    // Resolve log directory (same parent as data_dir or from env)
    let log_dir = std::env::var("VAULT_SYNC_LOG_DIR").unwrap_or_else(|_| {
        dirs::data_local_dir()
            .map(|d| d.join("vault-sync").join("logs").to_string_lossy().to_string())
            .unwrap_or_else(|| ".vault-sync/logs".to_string())
    });
    std::fs::create_dir_all(&log_dir).ok();

    // File appender: daily rotated log files
    let file_appender = tracing_appender::rolling::daily(&log_dir, "vault-sync.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vault_sync=info,tower_http=info".into());

    // Stdout layer (captured by the host process)
    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    // File layer (daily rotated, non-blocking)
    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Install panic hook that logs before aborting
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info.location().map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())).unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "vault_sync::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    // Initialize health check uptime counter
    routes::health::init_start_time();

    let config = config::AppConfig::from_env();
    let addr: SocketAddr = config.listen_addr.parse()?;

    info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir,
        vault_dir = %config.vault_dir,
        model = %config.embedding_model.display_name(),
        rerank = config.rerank,
        chunk_size = config.chunk_size,
        insert_batch_size = config.insert_batch_size,
        watcher_debounce_ms = config.watcher_debounce_ms,
        log_dir = %log_dir,
        "vault-sync starting"
    );

    let app_state = state::AppState::new(config).await?;

    // Keep the index in step with edits made outside the app.
    if let Err(e) = app_state.watcher_manager.start_watching(
        app_state.vault.clone(),
        app_state.index_manager.clone(),
        Some(app_state.file_ops.states().clone()),
    ) {
        warn!("Failed to start vault watcher: {}", e);
    }

    // Catch up with whatever changed while we were not running.
    routes::index::spawn_background_indexing(app_state.index_manager.clone());

    // Initialize the shutdown notify channel for graceful HTTP-based shutdown
    routes::health::init_shutdown_notify();

    let watcher_manager = app_state.watcher_manager.clone();
    let app = server::create_app(app_state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("vault-sync listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    watcher_manager.stop_watching();
    info!("vault-sync shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    // No SIGTERM off Unix; the HTTP /shutdown endpoint covers that case.
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let http_shutdown = routes::health::wait_for_shutdown();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("Received terminate signal, initiating shutdown"); },
        _ = http_shutdown => { info!("Received HTTP shutdown request, initiating shutdown"); },
    }

    info!("Shutdown signal received");
}
