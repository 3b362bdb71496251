//! Vigil Daemon (`vigild`)
//!
//! Serves the contest session coordinator over WebSocket and keeps the
//! session store on disk.

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use vigil_daemon::actor::{self, TICK_INTERVAL};
use vigil_daemon::config::Args;
use vigil_daemon::transport;
use vigil_server::Coordinator;
use vigil_server::gate::SharedSecretGate;
use vigil_store::SessionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    tracing::info!("vigild v{} starting...", env!("CARGO_PKG_VERSION"));

    let settings = args.settings().context("invalid configuration")?;
    if settings.admin_secret.is_empty() {
        tracing::warn!("no admin secret configured, admin login disabled");
    }

    let mut store = SessionStore::open_dir(&settings.data_dir)
        .with_context(|| format!("failed to open store in {}", settings.data_dir.display()))?;
    settings.apply_overrides(&mut store);

    let coordinator = Coordinator::new(
        settings.server_config(),
        store,
        Box::new(SharedSecretGate::new(&settings.admin_secret)),
    );
    let (handle, task) = actor::spawn(coordinator, TICK_INTERVAL);

    let listener = tokio::net::TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen))?;
    tracing::info!(addr = %settings.listen, "listening for connections");

    axum::serve(listener, transport::router(handle.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    tracing::info!("Shutdown signal received...");

    match handle.shutdown().await {
        Some(durability) if !durability.is_healthy() => {
            tracing::error!(?durability, "stopped with unwritten session changes");
        }
        _ => {}
    }
    task.await.context("coordinator task failed")?;

    tracing::info!("Daemon stopped");
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let mut filter = EnvFilter::from_default_env();

    // Only apply defaults if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        if let Ok(directive) = level.parse() {
            filter = filter.add_directive(directive);
        }
    }

    const SILENCE: &[&str] = &["hyper=warn", "tungstenite=warn"];
    for d in SILENCE {
        if let Ok(directive) = d.parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for Ctrl+C");
    }
}
