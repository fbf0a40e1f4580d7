#![forbid(unsafe_code)]

//! One-shot command-line download through the same pipeline the server uses.
//! Prints the metadata or download summary as JSON on stdout.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use vidrelay::{
    capability::CapabilityProvider,
    config::{BIN_SUBDIR, load_settings},
    pipeline::{Acquirer, DownloadRequest},
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Download a single video into the scratch directory.")]
struct Cli {
    /// Video URL (watch, youtu.be, embed, shorts or live link).
    url: String,
    #[arg(
        short = 'q',
        long = "quality",
        value_name = "QUALITY",
        help = "best, 2160p, 1440p, 1080p, 720p, 480p or 360p"
    )]
    quality: Option<String>,
    #[arg(short = 'f', long = "format", value_name = "CONTAINER", help = "mp4, webm or mkv")]
    format: Option<String>,
    #[arg(long = "scratch-dir", value_name = "PATH", help = "Where the finished file is written")]
    scratch_dir: Option<PathBuf>,
    #[arg(long = "cookie", value_name = "HEADER", help = "Cookie header forwarded to the backend")]
    cookie: Option<String>,
    #[arg(long = "info-only", help = "Print metadata without downloading")]
    info_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vidrelay=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings().context("loading configuration")?;
    if let Some(scratch_dir) = cli.scratch_dir {
        settings.bin_dir = scratch_dir.join(BIN_SUBDIR);
        settings.scratch_dir = scratch_dir;
    }

    let provider = Arc::new(CapabilityProvider::from_settings(&settings));
    let acquirer = Acquirer::new(settings, provider);
    acquirer.prepare()?;

    let json = if cli.info_only {
        let metadata = acquirer.describe(&cli.url).await?;
        serde_json::to_string_pretty(&metadata)?
    } else {
        let request = DownloadRequest {
            url: cli.url,
            quality: cli.quality,
            format: cli.format,
            cookie: cli.cookie,
        };
        let summary = acquirer.acquire(&request).await?;
        let path = acquirer.store().root().join(&summary.filename);
        eprintln!("Saved {}", path.display());
        serde_json::to_string_pretty(&summary)?
    };
    println!("{json}");
    Ok(())
}
