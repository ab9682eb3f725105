use std::net::SocketAddr;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

mod agentic;
mod chunker;
mod config;
mod embedding;
mod error;
mod file_tracker;
mod hybrid_search;
mod llm;
mod reranker;
mod registry;
mod retriever;
mod routes;
mod scanner;
mod server;
mod state;
mod syncer;
mod vector_store;

#[tokio::main]
async fn main() -> ExitCode {
    // Resolve log directory (same parent as data_dir or from env)
    let log_dir = std::env::var("VAULT_RAG_LOG_DIR").unwrap_or_else(|_| {
        dirs::data_local_dir()
            .map(|d| d.join("vault-rag").join("logs").to_string_lossy().to_string())
            .unwrap_or_else(|| ".vault-rag-data/logs".to_string())
    });
    std::fs::create_dir_all(&log_dir).ok();

    // File appender: daily rotated log files
    let file_appender = tracing_appender::rolling::daily(&log_dir, "vault-rag.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Build tracing subscriber with both stdout + file output using layers
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "vault_rag=info,tower_http=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

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
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "vault_rag::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    routes::health::init_start_time();

    // §6 exit codes: 0 normal, 1 config error, 2 registry corruption beyond
    // auto-recovery (the Registry itself tolerates corruption by returning
    // an empty map on load, per §4.4 — this code path is for failures that
    // surface only as a fatal `AppError` during startup).
    let config = match config::AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    let addr: SocketAddr = match config.listen_addr.parse() {
        Ok(a) => a,
        Err(e) => {
            error!("Invalid listen address '{}': {e}", config.listen_addr);
            return ExitCode::from(1);
        }
    };

    info!(
        listen_addr = %config.listen_addr,
        vault_root = %config.vault_root.display(),
        data_dir = %config.data_dir,
        embedder = %config.embedder.model_name(),
        llm = %config.llm.model_name(),
        log_dir = %log_dir,
        "vault-rag starting"
    );

    let app_state = match state::AppState::new(config).await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to initialize application state: {e}");
            return match e {
                error::AppError::RegistryCorruption(_) => ExitCode::from(2),
                _ => ExitCode::from(1),
            };
        }
    };

    routes::health::init_shutdown_notify();
    let app = server::create_app(app_state.clone());

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {}: {e}", addr);
            return ExitCode::from(1);
        }
    };
    info!("vault-rag listening on {}", addr);

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        error!("Server error: {e}");
        return ExitCode::from(1);
    }

    info!("vault-rag shutdown complete");
    ExitCode::from(0)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install secondary Ctrl+C handler");
    };

    let http_shutdown = routes::health::wait_for_shutdown();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("Received terminate signal, initiating shutdown"); },
        _ = http_shutdown => { info!("Received HTTP shutdown request, initiating shutdown"); },
    }

    info!("Shutdown signal received");
}
