use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wikimd::config::Config;
use wikimd::content::ContentService;
use wikimd::search;
use wikimd::server;
use wikimd::tree::BuildOptions;

const GRACEFUL_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_tracing(config.verbose);

    search::check_binary_available().context(
        "search binary `rg` not found on PATH; install ripgrep or a compatible substitute",
    )?;

    let root = config
        .root
        .canonicalize()
        .with_context(|| format!("wiki root {:?} does not exist", config.root))?;

    let service = ContentService::new(root, BuildOptions::default())
        .await
        .context("failed to initialize content service")?;

    let app = server::build_router(service.clone(), &config);

    let listener = tokio::net::TcpListener::bind(config.socket_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.socket_addr()))?;
    let bound_port = listener.local_addr()?.port();
    let url = config.server_url(bound_port);
    tracing::info!(url = %url, root = %service.root().display(), "wikimd listening");

    if config.auto_open {
        if let Err(e) = webbrowser::open(&url) {
            tracing::warn!(error = %e, "failed to open browser");
        }
    }

    let shutdown = CancellationToken::new();
    let shutdown_for_server = shutdown.clone();
    let server_handle = tokio::spawn(
        axum::serve(listener, app).with_graceful_shutdown(async move {
            shutdown_for_server.cancelled().await;
        }),
    );

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining connections");
    shutdown.cancel();
    service.close();

    match tokio::time::timeout(GRACEFUL_SHUTDOWN_DEADLINE, server_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("shutdown complete"),
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => tracing::error!(error = %e, "server task panicked during shutdown"),
        Err(_) => tracing::warn!("graceful shutdown deadline exceeded, exiting anyway"),
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_directive = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        signal.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
