//! ClosedLoop node binary.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use closedloop_node::{LogFormat, Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "closedloop", about = "Closed-loop stablecoin ledger node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node and its settlement sweep until Ctrl+C
    Serve {
        /// Override SETTLEMENT_SWEEP_INTERVAL_SECS
        #[arg(long)]
        sweep_interval_secs: Option<u64>,

        /// Load the central bank directory before starting
        #[arg(long, default_value_t = false)]
        seed: bool,
    },
    /// Load the central bank directory
    Seed,
    /// Check that every posted transaction has balanced entries
    Verify,
}

fn init_tracing(config: &NodeConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = NodeConfig::from_env()?;
    if let Command::Serve {
        sweep_interval_secs: Some(secs),
        ..
    } = cli.command
    {
        config.sweep_interval = Duration::from_secs(secs);
    }
    init_tracing(&config);

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    let node = Arc::new(Node::connect(config).await?);

    match cli.command {
        Command::Serve { seed, .. } => serve(node, seed).await,
        Command::Seed => {
            let report = node.seed_institutions().await?;
            info!(created = report.created, skipped = report.skipped, "Seeding complete");
            Ok(())
        }
        Command::Verify => {
            let unbalanced = node.verify_ledger().await?;
            if unbalanced.is_empty() {
                return Ok(());
            }
            for id in &unbalanced {
                error!(transaction_id = %id, "Unbalanced transaction");
            }
            anyhow::bail!("{} unbalanced transaction(s)", unbalanced.len())
        }
    }
}

async fn serve(node: Arc<Node>, seed: bool) -> anyhow::Result<()> {
    info!("Starting ClosedLoop node");
    if seed {
        node.seed_institutions().await?;
    }

    let shutdown_node = Arc::clone(&node);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Shutdown signal received");
        if let Err(e) = shutdown_node.stop().await {
            error!(error = %e, "Error during shutdown");
        }
    });

    node.start().await?;

    while !node.state().is_terminal() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let snapshot = node.metrics().snapshot();
    info!(
        transfers = snapshot.transfers_total,
        batches = snapshot.batches_created,
        sweeps = snapshot.sweeps_run,
        "Node shutdown complete"
    );
    Ok(())
}
