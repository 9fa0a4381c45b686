//! BetGenius node binary.

use anyhow::Result;
use betg_node::{Args, LogListener, Node, NodeConfig};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.version_info {
        print_version();
        return Ok(());
    }

    let config = NodeConfig::load(&args.config, &args)?;

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting BetGenius node v{}", env!("CARGO_PKG_VERSION"));
    info!("Network: {}", config.network);
    info!("Data directory: {:?}", config.data_dir);

    let node = Node::new(config)?;
    node.register(Arc::new(LogListener));

    let runner = tokio::spawn({
        let node = Arc::clone(&node);
        async move { node.run().await }
    });

    tokio::select! {
        result = runner => {
            match result {
                Ok(Err(e)) => error!("Node error: {}", e),
                Err(e) => error!("Node task failed: {}", e),
                Ok(Ok(())) => {}
            }
            node.shutdown();
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            node.shutdown();
        }
    }

    info!("BetGenius node stopped");
    Ok(())
}

fn print_version() {
    println!("BetGenius Node");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Built with:");
    println!("  KawPow proof of work");
    println!("  Tokio for async runtime");
}
