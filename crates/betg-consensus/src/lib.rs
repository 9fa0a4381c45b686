//! # betg-consensus
//!
//! Consensus rules for the BetGenius chain.
//!
//! This crate provides:
//! - Block headers, transactions and blocks with their hashing rules
//! - Exact compact-target (`nBits`) encoding
//! - The 20 block moving-average difficulty retarget
//! - Locktime and BIP68 sequence-lock finality
//! - Context-free and contextual block and transaction checks
//! - Per-network chain parameters and genesis blocks
//!
//! ## Difficulty
//!
//! Every block retargets from the average target of the previous 20 blocks,
//! scaled by their actual timespan against the 20 minute target timespan
//! (clamped to a factor of 3 either way).
//!
//! ## Proof of Work
//!
//! Headers are sealed with KawPow (see `betg-pow`). The block hash is the
//! KawPow final digest; the header hash fed to KawPow is double SHA-256 over
//! the header without its nonce and mix digest.

mod block;
mod chain_params;
mod coins;
mod compact;
mod difficulty;
mod encode;
mod error;
mod finality;
mod script;
mod subsidy;
mod transaction;
pub mod validation;

pub use block::{block_merkle_root, compute_merkle_root, Block, BlockHeader, HEADER_SIZE};
pub use chain_params::{create_genesis_block, ChainParams, Network, GENESIS_TIME};
pub use coins::{Coin, CoinsChanges, CoinsOverlay, CoinsView, MemoryCoins, TxUndo, UndoSet};
pub use compact::{decode_compact, encode_compact, hash_to_target, target_to_hash, CompactTarget};
pub use difficulty::{
    block_proof, block_proof_equivalent_time, calculate_next_work_required, check_proof_of_work,
    get_next_work_required, permitted_difficulty_transition, HeaderForDifficulty,
};
pub use encode::{sha256d, Decoder, Encoder};
pub use error::{BlockFailure, ConsensusError, ConsensusResult, TxFailure};
pub use finality::{
    calculate_sequence_locks, evaluate_sequence_locks, is_final_tx, SequenceLocks,
};
pub use script::{opcodes, Script};
pub use subsidy::get_block_subsidy;
pub use transaction::{Amount, OutPoint, Transaction, TxIn, TxOut};
pub use validation::{AcceptAllVerifier, InputVerifier, ScriptError};

/// Consensus constants shared by every network.
pub mod params {
    use crate::Amount;

    /// Base units per coin.
    pub const COIN: Amount = 100_000_000;

    /// One hundredth of a coin.
    pub const CENT: Amount = 1_000_000;

    /// Upper bound on any single amount or sum of amounts.
    pub const MAX_MONEY: Amount = 21_024_000_000 * COIN;

    /// Maximum block weight.
    pub const MAX_BLOCK_WEIGHT: u64 = 4_000_000;

    /// Maximum block sigop cost.
    pub const MAX_BLOCK_SIGOPS_COST: u64 = 80_000;

    /// Weight units per serialized byte.
    pub const WITNESS_SCALE_FACTOR: u64 = 4;

    /// Blocks before a coinbase output may be spent.
    pub const COINBASE_MATURITY: u32 = 100;

    /// Blocks contributing to the median time past.
    pub const MEDIAN_TIME_SPAN: usize = 11;

    /// Maximum seconds a header may be ahead of adjusted time.
    pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;

    /// Initial block subsidy.
    pub const INITIAL_SUBSIDY: Amount = 5000 * COIN;

    /// Locktime values below this are heights, above are timestamps.
    pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

    /// Minimum serialized coinbase scriptSig length.
    pub const MIN_COINBASE_SCRIPT_SIZE: usize = 2;

    /// Maximum serialized coinbase scriptSig length.
    pub const MAX_COINBASE_SCRIPT_SIZE: usize = 100;

    /// Version bits top bits for new block templates.
    pub const VERSIONBITS_TOP_BITS: i32 = 0x2000_0000;
}
