//! Error types for chain management.

use betg_consensus::ConsensusError;
use betg_pow::Hash256;
use thiserror::Error;

/// Chain management errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Consensus rule violation.
    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    /// Parent header is unknown.
    #[error("Previous block not found: {0}")]
    PrevNotFound(Hash256),

    /// Parent is known to be invalid.
    #[error("Block builds on invalid block {0}")]
    InvalidPrev(Hash256),

    /// Block data already stored.
    #[error("Block already known: {0}")]
    Duplicate(Hash256),

    /// Block was previously found invalid.
    #[error("Block previously marked invalid: {0}")]
    CachedInvalid(Hash256),

    /// Block data missing from the store.
    #[error("Block not found: {0}")]
    BlockNotFound(Hash256),

    /// Undo data missing from the store.
    #[error("Undo data not found: {0}")]
    UndoNotFound(Hash256),

    /// Internal invariant broken.
    #[error("Inconsistent chain state: {0}")]
    Inconsistent(String),
}

impl ChainError {
    /// Short reason string.
    pub fn reason(&self) -> &str {
        match self {
            Self::Consensus(e) => e.reason(),
            Self::PrevNotFound(_) => "prev-blk-not-found",
            Self::InvalidPrev(_) => "bad-prevblk",
            Self::Duplicate(_) => "duplicate",
            Self::CachedInvalid(_) => "duplicate-invalid",
            Self::BlockNotFound(_) => "block-not-found",
            Self::UndoNotFound(_) => "bad-undo-data",
            Self::Inconsistent(_) => "inconsistent-state",
        }
    }
}

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;
