use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use nefi::config::ServerConfig;
use nefi::server::Server;

/// Cluster collector: event ingestion, metric aggregation, dependency
/// graph computation, and the storage adapter.
#[derive(Parser)]
#[command(name = "nefi-server", about)]
struct Cli {
    /// Path to an optional YAML configuration file. Environment variables
    /// (GRPC_PORT, HTTP_PORT, ES_ADDRESSES) override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("nefi-server {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = ServerConfig::load(cli.config.as_deref()).context("loading configuration")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        grpc_port = cfg.grpc_port,
        http_port = cfg.http_port,
        es_addresses = ?cfg.es_addresses,
        "starting nefi-server",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: ServerConfig) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let mut server = Server::new(cfg);
    server.start().await?;

    let _ = shutdown_rx.await;

    tracing::info!(accepted = server.total_accepted(), "initiating graceful shutdown");
    server.stop().await;

    tracing::info!("nefi-server stopped");
    Ok(())
}
