//! Command line arguments.

use clap::Parser;
use std::path::PathBuf;

/// BetGenius consensus node.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "betg-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "betg-node.toml")]
    pub config: PathBuf,

    /// Data directory
    #[arg(short, long)]
    pub data_dir: Option<PathBuf>,

    /// Network: main, testnet or regtest
    #[arg(short, long)]
    pub network: Option<String>,

    /// Enable the internal CPU miner
    #[arg(long)]
    pub mining: bool,

    /// Number of mining threads (0 = keep configured value)
    #[arg(long, default_value = "0")]
    pub mining_threads: usize,

    /// Coinbase output script, hex encoded
    #[arg(long)]
    pub coinbase_script: Option<String>,

    /// Log level
    #[arg(long)]
    pub log_level: Option<String>,

    /// Print version and exit
    #[arg(long)]
    pub version_info: bool,
}
