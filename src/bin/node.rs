//! src/bin/node.rs
//!
//! Node entry point. Responsible for initializing tracing, loading
//! configuration, instantiating the `NodeApp`, and running it.

use anyhow::Context;
use gossip_fd::{NodeApp, NodeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize the tracing subscriber.
    // RUST_LOG=info will be the default.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load configuration.
    let config = NodeConfig::load().context("Failed to load configuration")?;

    // Create and run the application.
    if let Err(e) = NodeApp::new(config)?.run().await {
        tracing::error!(error = %e, "💥 Node failed");
        std::process::exit(1);
    }

    Ok(())
}
