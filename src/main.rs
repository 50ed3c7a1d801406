//! `streamlet-node`: runs a single participant in a Streamlet-style BFT
//! consensus run. Mirrors `bach-node`'s `main.rs` — parse CLI, init
//! logging, build the node, run until the signal or the epoch budget ends.

use clap::Parser;
use streamlet::config::Cli;
use streamlet::error::EngineError;
use streamlet::node::StreamletNode;

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let mut node = StreamletNode::new(cli)?;

    tokio::select! {
        result = node.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            node.shutdown().await?;
        }
    }

    Ok(())
}
