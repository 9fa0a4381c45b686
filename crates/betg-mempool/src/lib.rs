//! # betg-mempool
//!
//! Unconfirmed transaction pool for the BetGenius node.
//!
//! This crate provides:
//! - A transaction graph with exact ancestor and descendant fee, size and
//!   sigop aggregates
//! - Ancestor-feerate ordering for block assembly
//! - Operator prioritisation with deltas that may precede the transaction
//! - Admission against the active chain, including opt-in replacement
//! - Cascading removal, confirmation, expiry and size-limit eviction
//! - JSON persistence that keeps entry order across restarts

mod accept;
mod entry;
mod error;
mod ordering;
mod persist;
mod pool;

pub use accept::{AcceptedTx, MAX_STANDARD_TX_SIGOPS_COST, MEMPOOL_HEIGHT};
pub use entry::{signals_replacement, MempoolEntry, NewEntry, MAX_REPLACEABLE_SEQUENCE};
pub use error::{MempoolError, MempoolResult};
pub use ordering::{compare_feerate, AncestorScoreKey, FeeRate};
pub use persist::LoadStats;
pub use pool::{
    compare_by_ancestor_count, Mempool, MempoolConfig, MempoolStats, MempoolView, RemovalReason,
    RemovedTx,
};

/// Default maximum total virtual size.
pub const DEFAULT_MAX_SIZE: u64 = 300 * 1_000_000;

/// Default entry lifetime in seconds (two weeks).
pub const DEFAULT_EXPIRY_SECS: i64 = 336 * 60 * 60;

/// Default maximum in-pool ancestors, counting the entry.
pub const DEFAULT_ANCESTOR_LIMIT: u64 = 25;

/// Default maximum ancestor package virtual size.
pub const DEFAULT_ANCESTOR_SIZE_LIMIT: u64 = 101_000;

/// Default maximum in-pool descendants, counting the entry.
pub const DEFAULT_DESCENDANT_LIMIT: u64 = 25;

/// Default maximum descendant package virtual size.
pub const DEFAULT_DESCENDANT_SIZE_LIMIT: u64 = 101_000;

/// Default minimum relay feerate.
pub const DEFAULT_MIN_RELAY_FEE: FeeRate = FeeRate::per_kvb(1000);

/// Default incremental relay feerate for replacements.
pub const DEFAULT_INCREMENTAL_RELAY_FEE: FeeRate = FeeRate::per_kvb(1000);

/// Default cap on entries one replacement may evict.
pub const DEFAULT_MAX_REPLACEMENT_EVICTIONS: usize = 100;
