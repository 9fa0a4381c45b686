//! # betg-mining
//!
//! Block template assembly and CPU mining for the BetGenius chain.
//!
//! This crate provides:
//! - Ancestor-feerate package selection over the mempool
//! - Coinbase construction with the BIP34 height push
//! - A KawPow nonce solver with batch-granular cancellation
//! - A worker pool that spreads nonce partitions over OS threads
//!
//! ## Templates
//!
//! A template is built under the chain read lock and the mempool read
//! lock, then checked with every block rule except proof of work before
//! it is handed out. Nonce search runs on a copy with no lock held.

mod assembler;
mod coinbase;
mod error;
mod miner;
mod solver;
mod worker;

pub use assembler::{
    AssemblerOptions, BlockAssembler, BlockTemplate, COINBASE_RESERVED_SIGOPS,
    COINBASE_RESERVED_WEIGHT, DEFAULT_BLOCK_MAX_WEIGHT, DEFAULT_BLOCK_MIN_TX_FEE,
    MAX_CONSECUTIVE_FAILURES,
};
pub use coinbase::{coinbase_script_sig, set_extra_nonce, CoinbaseBuilder};
pub use error::{MiningError, MiningResult};
pub use miner::{CurrentTemplate, Miner, MinerConfig, MiningStats};
pub use solver::{boundary_for_bits, seal, try_solve, try_solve_batch, DEFAULT_BATCH_SIZE};
pub use worker::{FoundSolution, MiningTask, MiningWorker, WorkerPool};
