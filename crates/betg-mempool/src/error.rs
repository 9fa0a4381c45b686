//! Error types for the mempool.

use betg_consensus::{ConsensusError, OutPoint, ScriptError};
use betg_pow::Hash256;
use thiserror::Error;

/// Mempool errors.
#[derive(Error, Debug)]
pub enum MempoolError {
    /// Transaction already in the pool.
    #[error("Transaction already in mempool: {0}")]
    AlreadyExists(Hash256),

    /// Coinbase transactions only exist in blocks.
    #[error("Coinbase transaction {0} cannot enter the mempool")]
    Coinbase(Hash256),

    /// An input is neither confirmed nor created by a pool transaction.
    #[error("Missing input: {0}")]
    MissingInputs(OutPoint),

    /// An input is already spent by a pool transaction.
    #[error("Input {outpoint} already spent by {spender}")]
    Conflict { outpoint: OutPoint, spender: Hash256 },

    /// Fee too low for relay or replacement.
    #[error("Insufficient fee ({reason}): {detail}")]
    InsufficientFee { reason: &'static str, detail: String },

    /// Ancestor or descendant package limits exceeded.
    #[error("Package limits exceeded: {0}")]
    TooManyAncestors(String),

    /// Not final at the next block.
    #[error("Non-final transaction ({reason})")]
    NonFinal { reason: &'static str },

    /// Transaction failed admission recently and was not re-checked.
    #[error("Transaction recently rejected: {0}")]
    RecentlyRejected(Hash256),

    /// Transaction was evicted immediately by the size limit.
    #[error("Mempool full")]
    Full,

    /// Transaction not in the pool.
    #[error("Transaction not found: {0}")]
    NotFound(Hash256),

    /// Consensus rule violation.
    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    /// Input scripts failed.
    #[error("Script verification failed: {0}")]
    Script(#[from] ScriptError),

    /// Dump file could not be read or written.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Dump file is malformed.
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl MempoolError {
    /// Short reject reason.
    pub fn reason(&self) -> &str {
        match self {
            Self::AlreadyExists(_) => "txn-already-in-mempool",
            Self::Coinbase(_) => "coinbase",
            Self::MissingInputs(_) => "bad-txns-inputs-missingorspent",
            Self::Conflict { .. } => "txn-mempool-conflict",
            Self::InsufficientFee { reason, .. } => reason,
            Self::TooManyAncestors(_) => "too-long-mempool-chain",
            Self::NonFinal { reason } => reason,
            Self::RecentlyRejected(_) => "txn-already-known",
            Self::Full => "mempool full",
            Self::NotFound(_) => "not-found",
            Self::Consensus(e) => e.reason(),
            Self::Script(_) => "mandatory-script-verify-flag-failed",
            Self::Io(_) | Self::Persistence(_) => "persistence",
        }
    }
}

/// Result type for mempool operations.
pub type MempoolResult<T> = Result<T, MempoolError>;
