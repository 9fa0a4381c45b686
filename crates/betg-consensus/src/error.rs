//! Error types for consensus validation.
//!
//! Rejections carry a short reason string (`high-hash`, `bad-cb-amount`, ...)
//! that peers and tooling match on, plus free-form detail for logs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a block or header was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockFailure {
    /// Violates a consensus rule.
    Consensus,
    /// Header is invalid (PoW, target, timestamps).
    InvalidHeader,
    /// Block data does not match its header (merkle mutation, duplicates).
    Mutated,
    /// Previously found invalid.
    CachedInvalid,
    /// Builds on an invalid block.
    InvalidPrev,
    /// Parent is unknown.
    MissingPrev,
    /// Timestamp too far in the future; may become valid later.
    TimeFuture,
}

/// Why a transaction was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxFailure {
    /// Violates a consensus rule.
    Consensus,
    /// Inputs missing or already spent.
    MissingInputs,
    /// Spends an immature coinbase.
    PrematureSpend,
    /// Not final at the evaluated height and time.
    NonFinal,
    /// Script verification failed.
    Script,
}

/// Consensus validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    /// Invalid block or header.
    #[error("Invalid block ({reason}): {detail}")]
    Block {
        kind: BlockFailure,
        reason: &'static str,
        detail: String,
    },

    /// Invalid transaction.
    #[error("Invalid transaction ({reason}): {detail}")]
    Transaction {
        kind: TxFailure,
        reason: &'static str,
        detail: String,
    },

    /// Not enough headers to evaluate the retarget window.
    #[error("Difficulty window too short: need {needed} headers, got {got}")]
    DifficultyWindow { needed: usize, got: usize },

    /// Malformed serialization.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Proof-of-work engine failure.
    #[error("PoW engine error: {0}")]
    Pow(#[from] betg_pow::PowError),
}

impl ConsensusError {
    /// Block rejection with a consensus reason.
    pub fn block(reason: &'static str, detail: impl Into<String>) -> Self {
        Self::Block {
            kind: BlockFailure::Consensus,
            reason,
            detail: detail.into(),
        }
    }

    /// Block rejection of a specific kind.
    pub fn block_kind(kind: BlockFailure, reason: &'static str, detail: impl Into<String>) -> Self {
        Self::Block {
            kind,
            reason,
            detail: detail.into(),
        }
    }

    /// Transaction rejection with a consensus reason.
    pub fn tx(reason: &'static str, detail: impl Into<String>) -> Self {
        Self::Transaction {
            kind: TxFailure::Consensus,
            reason,
            detail: detail.into(),
        }
    }

    /// Transaction rejection of a specific kind.
    pub fn tx_kind(kind: TxFailure, reason: &'static str, detail: impl Into<String>) -> Self {
        Self::Transaction {
            kind,
            reason,
            detail: detail.into(),
        }
    }

    /// Short reason string.
    pub fn reason(&self) -> &str {
        match self {
            Self::Block { reason, .. } | Self::Transaction { reason, .. } => reason,
            Self::DifficultyWindow { .. } => "bad-diffbits",
            Self::Decode(_) => "decode-failed",
            Self::Pow(_) => "pow-engine-failure",
        }
    }

    /// True if the failure says nothing permanent about the object.
    ///
    /// Future timestamps and unknown parents may resolve later; everything
    /// else is cached as invalid.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Block {
                kind: BlockFailure::TimeFuture | BlockFailure::MissingPrev,
                ..
            } | Self::Pow(_)
        )
    }
}

/// Result type for consensus operations.
pub type ConsensusResult<T> = Result<T, ConsensusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_strings() {
        let e = ConsensusError::block("bad-cb-amount", "coinbase pays too much");
        assert_eq!(e.reason(), "bad-cb-amount");
        assert!(e.to_string().contains("bad-cb-amount"));

        let e = ConsensusError::tx_kind(
            TxFailure::MissingInputs,
            "bad-txns-inputs-missingorspent",
            "input 0",
        );
        assert_eq!(e.reason(), "bad-txns-inputs-missingorspent");
    }

    #[test]
    fn test_transient() {
        let e = ConsensusError::block_kind(BlockFailure::TimeFuture, "time-too-new", "");
        assert!(e.is_transient());
        let e = ConsensusError::block_kind(BlockFailure::InvalidHeader, "high-hash", "");
        assert!(!e.is_transient());
    }
}
