use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use nefi::agent::Agent;
use nefi::config::AgentConfig;

/// Per-node observability agent: kernel probes, workload identity
/// enrichment, and event streaming to the collector.
#[derive(Parser)]
#[command(name = "nefi-agent", about)]
struct Cli {
    /// Path to an optional YAML configuration file. Environment variables
    /// (NODE_NAME, SERVER_ADDR, EBPF_OBJECT_PATH, KUBECONFIG) override it.
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
        println!("nefi-agent {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = AgentConfig::load(cli.config.as_deref()).context("loading configuration")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %cfg.node_name,
        server = %cfg.server_addr,
        probe_objects = %cfg.probe_object_path,
        "starting nefi-agent",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: AgentConfig) -> Result<()> {
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

    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    let _ = shutdown_rx.await;

    agent.stop().await;

    tracing::info!("nefi-agent stopped");
    Ok(())
}
