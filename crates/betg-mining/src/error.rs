//! Mining error types.

use betg_chain::ChainError;
use betg_consensus::ConsensusError;
use betg_mempool::MempoolError;
use betg_pow::PowError;
use thiserror::Error;

/// Mining errors.
#[derive(Error, Debug)]
pub enum MiningError {
    /// The assembled block failed its own validity check.
    #[error("Block template invalid ({reason}): {detail}")]
    TemplateInvalid { reason: String, detail: String },

    /// Compact target is negative, zero or overflowing.
    #[error("Invalid target bits {0:#010x}")]
    InvalidTarget(u32),

    /// Mining is switched off.
    #[error("Mining not enabled")]
    NotEnabled,

    /// No template has been handed out.
    #[error("No current block template")]
    NoTemplate,

    /// A solution arrived for a template that is no longer current.
    #[error("Stale solution for template {0}")]
    StaleSolution(u64),

    /// A submitted nonce does not seal the template.
    #[error("Invalid solution: {0}")]
    InvalidSolution(String),

    /// A worker thread could not be started.
    #[error("Failed to spawn mining worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Mempool error: {0}")]
    Mempool(#[from] MempoolError),

    #[error("PoW error: {0}")]
    Pow(#[from] PowError),
}

impl MiningError {
    /// Short reason string.
    pub fn reason(&self) -> &str {
        match self {
            Self::TemplateInvalid { reason, .. } => reason,
            Self::InvalidTarget(_) => "bad-diffbits",
            Self::NotEnabled => "mining-disabled",
            Self::NoTemplate => "no-template",
            Self::StaleSolution(_) => "stale",
            Self::InvalidSolution(_) => "high-hash",
            Self::WorkerSpawn(_) => "worker-spawn",
            Self::Chain(e) => e.reason(),
            Self::Consensus(e) => e.reason(),
            Self::Mempool(e) => e.reason(),
            Self::Pow(_) => "pow",
        }
    }
}

/// Result type for mining operations.
pub type MiningResult<T> = Result<T, MiningError>;
