//! # betg-pow
//!
//! KawPow Proof-of-Work engine for the BetGenius chain.
//!
//! This crate provides:
//! - Epoch context construction (light cache + L1 cache)
//! - Lazily materialized full dataset for miners
//! - The KawPow mix and finalize hash, verification and nonce search
//! - A single-slot epoch context cache shared by validators and miners
//!
//! ## KawPow
//!
//! KawPow is ProgPoW running over an ethash DAG with a 7500 block epoch.
//! Key parameters:
//! - 16 lanes x 32 registers of mix state
//! - 64 rounds, each reading one 2048-bit dataset item
//! - Keccak-f\[800\] for the initial and final absorb passes
//!
//! Every digest word is handled as a little-endian `u32`, so results are
//! identical on big-endian hosts.

mod dataset;
mod epoch;
mod error;
mod hash;
mod keccak;
mod progpow;

pub use dataset::{DatasetLookup, FullDataset, Item2048};
pub use epoch::{
    calculate_epoch_seed, calculate_full_dataset_num_items, calculate_light_cache_num_items,
    get_epoch_number, EpochContext, EpochContextCache,
};
pub use error::{PowError, PowResult};
pub use hash::{Hash256, Hash512};
pub use progpow::{hash, hash_no_verify, search, search_light, verify, KawPowResult, Solution};

/// KawPow and DAG parameters.
pub mod params {
    /// Number of blocks per DAG epoch.
    pub const EPOCH_LENGTH: u32 = 7500;

    /// Number of blocks sharing one ProgPoW program.
    pub const PERIOD_LENGTH: u32 = 3;

    /// Registers per lane.
    pub const NUM_REGS: usize = 32;

    /// Parallel lanes.
    pub const NUM_LANES: usize = 16;

    /// L1 cache reads per round.
    pub const NUM_CACHE_ACCESSES: usize = 11;

    /// Random math operations per round.
    pub const NUM_MATH_OPERATIONS: usize = 18;

    /// Mix rounds, each reading one 2048-bit dataset item.
    pub const NUM_DATASET_ACCESSES: u32 = 64;

    /// L1 cache size in bytes (16 KiB).
    pub const L1_CACHE_SIZE: usize = 16 * 1024;

    /// L1 cache size in 32-bit words.
    pub const L1_CACHE_WORDS: usize = L1_CACHE_SIZE / 4;

    /// Light cache size at epoch 0 in bytes.
    pub const LIGHT_CACHE_INIT_SIZE: u64 = 1 << 24;

    /// Light cache growth per epoch in bytes.
    pub const LIGHT_CACHE_GROWTH: u64 = 1 << 17;

    /// RandMemoHash rounds applied to the light cache.
    pub const LIGHT_CACHE_ROUNDS: usize = 3;

    /// Light cache item size in bytes (512 bits).
    pub const LIGHT_CACHE_ITEM_SIZE: u64 = 64;

    /// Full dataset size at epoch 0 in bytes.
    pub const FULL_DATASET_INIT_SIZE: u64 = 1 << 30;

    /// Full dataset growth per epoch in bytes.
    pub const FULL_DATASET_GROWTH: u64 = 1 << 23;

    /// Full dataset item size in bytes (1024 bits).
    pub const FULL_DATASET_ITEM_SIZE: u64 = 128;

    /// Light cache parents mixed into every 512-bit dataset item.
    pub const FULL_DATASET_ITEM_PARENTS: u32 = 512;

    /// Highest epoch whose dataset item count fits a signed 32-bit integer.
    pub const MAX_EPOCH_NUMBER: u32 = 32639;
}
