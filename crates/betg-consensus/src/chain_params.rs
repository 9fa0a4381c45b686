//! Chain parameters for the BetGenius networks.
//!
//! Parameters are fixed per network and never change at runtime. Every soft
//! fork (BIP16, BIP34, BIP65, BIP66, CSV, segwit) is active from genesis, so
//! there are no activation heights to carry.

use crate::block::{block_merkle_root, Block, BlockHeader};
use crate::params::INITIAL_SUBSIDY;
use crate::script::Script;
use crate::transaction::{OutPoint, Transaction, TxIn, TxOut};
use betg_pow::Hash256;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Genesis coinbase message.
pub const GENESIS_TIMESTAMP_MESSAGE: &str =
    "BBC - 15/Aug/2024 - The World Health Organization declares MPOX a global health emergency.";

/// Genesis block time on every network.
pub const GENESIS_TIME: u32 = 1_723_680_000;

/// Network selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Main,
    Testnet,
    Regtest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Main => "main",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        };
        f.write_str(name)
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Ok(Network::Main),
            "test" | "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network '{}'", other)),
        }
    }
}

/// Immutable consensus parameters of one network.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: Network,
    /// Easiest permitted target.
    pub pow_limit: BigUint,
    /// Blocks averaged by the retarget.
    pub pow_target_window: u32,
    /// Target seconds between blocks.
    pub pow_target_spacing: i64,
    /// Relax the target after a long gap (test networks).
    pub pow_allow_min_difficulty_blocks: bool,
    /// Never retarget (regtest).
    pub pow_no_retargeting: bool,
    /// Blocks between subsidy halvings.
    pub subsidy_halving_interval: u32,
    /// Chain work below which a tip is not trusted for initial sync.
    pub minimum_chain_work: BigUint,
    /// Output script paid by the genesis coinbase.
    pub genesis_output_script: Script,
    pub genesis: Block,
    pub genesis_hash: Hash256,
}

struct GenesisFields {
    nonce: u64,
    bits: u32,
    mix_hash: &'static str,
    output_script: &'static str,
}

impl ChainParams {
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Main => Self::main(),
            Network::Testnet => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    pub fn main() -> Self {
        Self::build(
            Network::Main,
            "000affffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
            false,
            false,
            2_102_400,
            0x1745,
            GenesisFields {
                nonce: 0x59F5,
                bits: 0x1f0affff,
                mix_hash: "1947407f2e772c6fb5717556ca23fe8aea17ece9a0595ba870dae3f60b6f98a3",
                output_script: "00142f2469c0f81ccd53e6046cf2153868c2ec42f0e5",
            },
        )
    }

    pub fn testnet() -> Self {
        Self::build(
            Network::Testnet,
            "000affffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
            true,
            false,
            2_102_400,
            0x1745,
            GenesisFields {
                nonce: 0x1E6D,
                bits: 0x1f0affff,
                mix_hash: "f2bd9c6e950647455413bdbb67435855529f17d43c2805beb78ce323cbfba219",
                output_script: "0014948fecefd5fa8fd24a6916b93d1e366490c26e55",
            },
        )
    }

    pub fn regtest() -> Self {
        Self::build(
            Network::Regtest,
            "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
            true,
            true,
            2_102,
            2,
            GenesisFields {
                nonce: 0,
                bits: 0x207fffff,
                mix_hash: "4f6502de51ea6444b8de92284d356bf3de7c3abeecb8a2eeced384ff098301ac",
                output_script: "0014315f9edfad9bf12b991dbe408aaa17c1f3d596d5",
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        network: Network,
        pow_limit_hex: &str,
        allow_min_difficulty: bool,
        no_retargeting: bool,
        halving_interval: u32,
        minimum_chain_work: u64,
        fields: GenesisFields,
    ) -> Self {
        // The constants above are fixed hex literals.
        let pow_limit = BigUint::parse_bytes(pow_limit_hex.as_bytes(), 16).unwrap_or_default();
        let output_script =
            Script::from_bytes(hex::decode(fields.output_script).unwrap_or_default());
        let mix_hash = Hash256::from_hex(fields.mix_hash).unwrap_or_default();

        let genesis = create_genesis_block(
            GENESIS_TIME,
            fields.nonce,
            fields.bits,
            4,
            INITIAL_SUBSIDY,
            mix_hash,
            output_script.clone(),
        );
        let genesis_hash = genesis.hash();

        Self {
            network,
            pow_limit,
            pow_target_window: 20,
            pow_target_spacing: 60,
            pow_allow_min_difficulty_blocks: allow_min_difficulty,
            pow_no_retargeting: no_retargeting,
            subsidy_halving_interval: halving_interval,
            minimum_chain_work: BigUint::from(minimum_chain_work),
            genesis_output_script: output_script,
            genesis,
            genesis_hash,
        }
    }

    /// Seconds the retarget window is expected to span.
    pub fn pow_target_timespan(&self) -> i64 {
        i64::from(self.pow_target_window) * self.pow_target_spacing
    }
}

/// Build a genesis block around the fixed coinbase message.
pub fn create_genesis_block(
    time: u32,
    nonce: u64,
    bits: u32,
    version: i32,
    reward: i64,
    mix_hash: Hash256,
    output_script: Script,
) -> Block {
    let script_sig = Script::new()
        .push_int(0)
        .push_int(0x1f0a_ffff)
        .push_num(4)
        .push_slice(GENESIS_TIMESTAMP_MESSAGE.as_bytes());

    let coinbase = Transaction {
        version: 1,
        inputs: vec![TxIn::new(OutPoint::NULL, script_sig)],
        outputs: vec![TxOut::new(reward, output_script)],
        lock_time: 0,
    };

    let mut block = Block::new(
        BlockHeader {
            version,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            time,
            bits,
            nonce,
            height: 0,
            mix_hash,
        },
        vec![coinbase],
    );
    block.header.merkle_root = block_merkle_root(&block).0;
    block
}
