//! Node configuration.

use crate::cli::Args;
use anyhow::{Context, Result};
use betg_consensus::{Amount, Network, Script};
use betg_mempool::{
    FeeRate, MempoolConfig, DEFAULT_ANCESTOR_LIMIT, DEFAULT_ANCESTOR_SIZE_LIMIT,
    DEFAULT_DESCENDANT_LIMIT, DEFAULT_DESCENDANT_SIZE_LIMIT, DEFAULT_MAX_REPLACEMENT_EVICTIONS,
};
use betg_mining::{AssemblerOptions, MinerConfig, DEFAULT_BLOCK_MAX_WEIGHT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub network: Network,
    pub data_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub mempool: MempoolSection,
    #[serde(default)]
    pub mining: MiningSection,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Mempool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolSection {
    /// Maximum total virtual size in megabytes.
    pub max_size_mb: u64,
    pub expiry_hours: i64,
    pub ancestor_limit: u64,
    /// Ancestor package limit in kvB.
    pub ancestor_size_limit_kvb: u64,
    pub descendant_limit: u64,
    /// Descendant package limit in kvB.
    pub descendant_size_limit_kvb: u64,
    /// Sat per kvB.
    pub min_relay_fee: Amount,
    /// Sat per kvB.
    pub incremental_relay_fee: Amount,
    /// Allow replacement without the opt-in signal.
    pub full_rbf: bool,
    /// Dump on shutdown and reload on start.
    pub persist: bool,
}

impl Default for MempoolSection {
    fn default() -> Self {
        Self {
            max_size_mb: 300,
            expiry_hours: 336,
            ancestor_limit: DEFAULT_ANCESTOR_LIMIT,
            ancestor_size_limit_kvb: DEFAULT_ANCESTOR_SIZE_LIMIT / 1000,
            descendant_limit: DEFAULT_DESCENDANT_LIMIT,
            descendant_size_limit_kvb: DEFAULT_DESCENDANT_SIZE_LIMIT / 1000,
            min_relay_fee: 1000,
            incremental_relay_fee: 1000,
            full_rbf: false,
            persist: true,
        }
    }
}

impl MempoolSection {
    pub fn to_mempool_config(&self) -> MempoolConfig {
        MempoolConfig {
            max_size: self.max_size_mb * 1_000_000,
            expiry_secs: self.expiry_hours * 60 * 60,
            ancestor_limit: self.ancestor_limit,
            ancestor_size_limit: self.ancestor_size_limit_kvb * 1000,
            descendant_limit: self.descendant_limit,
            descendant_size_limit: self.descendant_size_limit_kvb * 1000,
            min_relay_fee: FeeRate::per_kvb(self.min_relay_fee),
            incremental_relay_fee: FeeRate::per_kvb(self.incremental_relay_fee),
            full_rbf: self.full_rbf,
            max_replacement_evictions: DEFAULT_MAX_REPLACEMENT_EVICTIONS,
        }
    }
}

/// Mining configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningSection {
    pub enabled: bool,
    /// Worker threads, 0 for one per core.
    pub threads: usize,
    /// Coinbase output script, hex encoded.
    pub coinbase_script: String,
    pub block_max_weight: u64,
    /// Sat per kvB.
    pub block_min_fee_rate: Amount,
}

impl Default for MiningSection {
    fn default() -> Self {
        Self {
            enabled: false,
            threads: 0,
            // OP_TRUE
            coinbase_script: "51".to_string(),
            block_max_weight: DEFAULT_BLOCK_MAX_WEIGHT,
            block_min_fee_rate: 1000,
        }
    }
}

impl MiningSection {
    pub fn to_miner_config(&self) -> Result<MinerConfig> {
        let script = hex::decode(&self.coinbase_script).context("Invalid coinbase script hex")?;
        let threads = if self.threads == 0 {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        } else {
            self.threads
        };
        Ok(MinerConfig {
            enabled: self.enabled,
            threads,
            coinbase_script: Script::from_bytes(script),
            assembler: AssemblerOptions {
                block_max_weight: self.block_max_weight,
                block_min_fee_rate: FeeRate::per_kvb(self.block_min_fee_rate),
            },
        })
    }
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            let network = match &args.network {
                Some(name) => parse_network(name)?,
                None => Network::Main,
            };
            Self::default_for_network(network)
        };

        if let Some(name) = &args.network {
            config.network = parse_network(name)?;
        }
        if let Some(data_dir) = &args.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(level) = &args.log_level {
            config.log_level = level.clone();
        }
        if args.mining {
            config.mining.enabled = true;
        }
        if args.mining_threads > 0 {
            config.mining.threads = args.mining_threads;
        }
        if let Some(script) = &args.coinbase_script {
            config.mining.coinbase_script = script.clone();
        }

        Ok(config)
    }

    /// Default config for a network.
    pub fn default_for_network(network: Network) -> Self {
        let data_dir = match network {
            Network::Main => PathBuf::from(".betgenius"),
            Network::Testnet => PathBuf::from(".betgenius-testnet"),
            Network::Regtest => PathBuf::from(".betgenius-regtest"),
        };
        Self {
            network,
            data_dir,
            log_level: default_log_level(),
            mempool: MempoolSection::default(),
            mining: MiningSection::default(),
        }
    }

    pub fn mempool_path(&self) -> PathBuf {
        self.data_dir.join("mempool.json")
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn parse_network(name: &str) -> Result<Network> {
    name.parse::<Network>()
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Unknown network '{}'", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============ Config Tests ============

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default_for_network(Network::Main);
        assert_eq!(config.network, Network::Main);
        assert_eq!(config.log_level, "info");
        let pool = config.mempool.to_mempool_config();
        assert_eq!(pool.max_size, 300_000_000);
        assert_eq!(pool.ancestor_size_limit, DEFAULT_ANCESTOR_SIZE_LIMIT);
        assert_eq!(pool.expiry_secs, betg_mempool::DEFAULT_EXPIRY_SECS);
    }

    #[test]
    fn test_regtest_config() {
        let config = NodeConfig::default_for_network(Network::Regtest);
        assert!(config.data_dir.to_string_lossy().contains("regtest"));
    }

    #[test]
    fn test_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args {
            network: Some("regtest".to_string()),
            data_dir: Some(dir.path().to_path_buf()),
            mining: true,
            mining_threads: 3,
            ..Default::default()
        };
        let config = NodeConfig::load(&dir.path().join("absent.toml"), &args).unwrap();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.data_dir, dir.path());
        assert!(config.mining.enabled);
        assert_eq!(config.mining.to_miner_config().unwrap().threads, 3);

        let bad = Args {
            network: Some("moon".to_string()),
            ..Default::default()
        };
        assert!(NodeConfig::load(&dir.path().join("absent.toml"), &bad).is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("betg-node.toml");
        let mut config = NodeConfig::default_for_network(Network::Testnet);
        config.mempool.full_rbf = true;
        config.mining.coinbase_script = "0014".to_string();
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path, &Args::default()).unwrap();
        assert_eq!(loaded.network, Network::Testnet);
        assert!(loaded.mempool.full_rbf);
        let miner = loaded.mining.to_miner_config().unwrap();
        assert_eq!(miner.coinbase_script.as_bytes(), &[0x00, 0x14]);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("betg-node.toml");
        std::fs::write(
            &path,
            "network = \"regtest\"\ndata_dir = \"/tmp/x\"\n[mining]\nenabled = true\n",
        )
        .unwrap();
        let config = NodeConfig::load(&path, &Args::default()).unwrap();
        assert!(config.mining.enabled);
        assert_eq!(config.mining.coinbase_script, "51");
        assert!(config.mempool.persist);

        config.mining.to_miner_config().unwrap();
        let mut broken = config.clone();
        broken.mining.coinbase_script = "zz".to_string();
        assert!(broken.mining.to_miner_config().is_err());
    }
}
