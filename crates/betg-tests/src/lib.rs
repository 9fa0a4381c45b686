//! # betg-tests
//!
//! Integration tests for the BetGenius consensus core.
//!
//! Blocks are mined for real on regtest with KawPow, so every scenario runs
//! against a chainstate that accepted them through the normal validation
//! path:
//! - Mining tests for template assembly and package selection
//! - Mempool tests for admission and replacement on a live chain
//! - Node tests for reorganizations and notifications
//! - Property tests for template invariants over random transaction graphs

pub mod generators;
pub mod harness;

#[cfg(test)]
mod mining_tests;

#[cfg(test)]
mod mempool_tests;


#[cfg(test)]
mod property_tests;

pub use generators::*;
pub use harness::*;
