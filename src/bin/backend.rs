#![forbid(unsafe_code)]

//! vidrelay HTTP API server.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{signal, time};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vidrelay::{
    capability::CapabilityProvider,
    config::{BIN_SUBDIR, load_settings},
    pipeline::Acquirer,
    security::ensure_not_root,
    server::{AppState, router},
    storage::DEFAULT_MAX_AGE,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the vidrelay download API.")]
struct Cli {
    #[arg(long = "host", value_name = "ADDR", help = "Address to bind (overrides VIDRELAY_HOST)")]
    host: Option<String>,
    #[arg(long = "port", value_name = "PORT", help = "Port to bind (overrides VIDRELAY_PORT)")]
    port: Option<u16>,
    #[arg(
        long = "scratch-dir",
        value_name = "PATH",
        help = "Directory for downloads in flight and finished files"
    )]
    scratch_dir: Option<PathBuf>,
    #[arg(
        long = "backend-url",
        value_name = "URL",
        help = "Delegate acquisition to another vidrelay instance"
    )]
    backend_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vidrelay=info,backend=info")),
        )
        .init();

    ensure_not_root("backend")?;
    let cli = Cli::parse();

    let mut settings = load_settings().context("loading configuration")?;
    if let Some(scratch_dir) = cli.scratch_dir {
        settings.bin_dir = scratch_dir.join(BIN_SUBDIR);
        settings.scratch_dir = scratch_dir;
    }
    if let Some(host) = cli.host {
        settings.vidrelay_host = host;
    }
    if let Some(port) = cli.port {
        settings.vidrelay_port = port;
    }
    if cli.backend_url.is_some() {
        settings.backend_url = cli.backend_url;
    }

    let provider = Arc::new(CapabilityProvider::from_settings(&settings));
    info!(
        scratch = %settings.scratch_dir.display(),
        strategies = ?provider.strategy_names(),
        max_quality = %settings.max_quality,
        "starting vidrelay"
    );

    let addr = SocketAddr::new(
        settings
            .vidrelay_host
            .parse()
            .with_context(|| format!("parsing host {}", settings.vidrelay_host))?,
        settings.vidrelay_port,
    );

    let acquirer = Acquirer::new(settings, provider);
    acquirer.prepare()?;
    let state = AppState::new(acquirer);

    let sweeper = state.acquirer.clone();
    tokio::spawn(async move {
        let mut ticker = time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            sweeper.sweep(DEFAULT_MAX_AGE).await;
        }
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("API server listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("shutting down"),
        Err(err) => warn!("failed to install Ctrl+C handler: {err}"),
    }
}
