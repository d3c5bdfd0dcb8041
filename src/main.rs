use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use media_relay::config::ServerConfig;
use media_relay::http::{AppState, relay_routes};
use media_relay::jobs::{DownloaderLauncher, JobRegistry, JobSupervisor, artifact};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;

    // Held for the life of the process so buffered log lines are flushed.
    let _log_guard = init_tracing(config.log_dir.as_deref())?;

    eprintln!("📼 Media Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Listening: http://{}", config.socket_addr());
    eprintln!("   Downloader: {}", config.downloader.display());
    eprintln!("   Downloads: {}", config.downloads_dir.display());
    eprintln!(
        "   Jobs: max {} concurrent, evicted {}s after finishing",
        config.max_jobs,
        config.eviction_grace.as_secs()
    );

    if let Err(e) = artifact::ensure_dir(&config.downloads_dir).await {
        eprintln!("   Warning: Could not create downloads dir: {}", e);
    }

    // ── Jobs ─────────────────────────────────────────────────────────────
    let registry = Arc::new(JobRegistry::from_config(&config));
    let launcher = Arc::new(DownloaderLauncher::from_config(&config));
    let supervisor = Arc::new(JobSupervisor::new(
        Arc::clone(&registry),
        launcher,
        config.downloads_dir.clone(),
    ));

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = relay_routes(AppState {
        registry,
        supervisor,
        downloads_dir: config.downloads_dir.clone(),
    });

    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, max_jobs = config.max_jobs, "Media relay started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    tracing::info!("Media relay stopped");
    Ok(())
}

/// Console logging, plus a daily-rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log dir {}", dir.display()))?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "media-relay.log"));
    let file = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();
    Ok(Some(guard))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
