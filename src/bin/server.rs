#![forbid(unsafe_code)]

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tubezip::{
    api::{AppState, router},
    archive::sweep_leftovers,
    config::{ConfigOverrides, resolve_config},
    extractor::YtDlp,
    notifier::Notifier,
    runner::JobRunner,
    store::JobStore,
};

/// Queue video downloads, zip them and hand the archives out once.
#[derive(Parser, Debug)]
#[command(name = "tubezip-server", version)]
struct ServerArgs {
    /// Directory that receives scratch folders and finished archives.
    #[arg(long)]
    download_root: Option<PathBuf>,
    /// Optional directory with a web frontend served on unmatched paths.
    #[arg(long)]
    www_root: Option<PathBuf>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    host: Option<String>,
    /// yt-dlp executable to invoke.
    #[arg(long)]
    ytdlp_bin: Option<PathBuf>,
    /// Alternate `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl From<ServerArgs> for ConfigOverrides {
    fn from(args: ServerArgs) -> Self {
        Self {
            download_root: args.download_root,
            www_root: args.www_root,
            port: args.port,
            host: args.host,
            ytdlp_bin: args.ytdlp_bin,
            env_path: args.env_file,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = resolve_config(ServerArgs::parse().into())?;
    tokio::fs::create_dir_all(&config.download_root)
        .await
        .with_context(|| format!("creating {}", config.download_root.display()))?;
    let sweep_root = config.download_root.clone();
    let swept = tokio::task::spawn_blocking(move || sweep_leftovers(&sweep_root))
        .await
        .context("sweep task aborted")??;
    if swept > 0 {
        info!(removed = swept, "removed leftovers from a previous run");
    }

    let host: IpAddr = config
        .host
        .parse()
        .with_context(|| format!("invalid listen host {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);

    let runner = JobRunner::new(
        JobStore::new(),
        Notifier::new(),
        Arc::new(YtDlp::new(config.ytdlp_bin.clone())),
        config.download_root.clone(),
    );
    let state = AppState::new(runner, config.www_root.clone(), config.archive_delete_delay);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(
        %addr,
        download_root = %config.download_root.display(),
        ytdlp = %config.ytdlp_bin.display(),
        "server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    // the process still exits on Ctrl+C without a handler
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}
