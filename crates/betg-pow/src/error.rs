//! Error types for the PoW engine.

use thiserror::Error;

/// PoW engine errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PowError {
    /// Epoch number beyond the supported range.
    #[error("Epoch {epoch} out of range, max {max}")]
    EpochOutOfRange { epoch: u32, max: u32 },

    /// Context construction or search was cancelled.
    #[error("PoW operation interrupted")]
    Interrupted,

    /// Malformed hex digest.
    #[error("Invalid hex digest: {0}")]
    InvalidHex(String),
}

/// Result type for PoW operations.
pub type PowResult<T> = Result<T, PowError>;
