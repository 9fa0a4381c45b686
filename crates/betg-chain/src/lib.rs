//! # betg-chain
//!
//! Block tree and active chain management for the BetGenius node.
//!
//! This crate provides:
//! - An arena index of every accepted header with cumulative work and
//!   skip pointers for logarithmic ancestor lookup
//! - Best-chain selection by total work, first seen wins on ties
//! - Block connection against an in-memory coin set with undo data
//! - Reorganization with rollback to the previous tip on failure
//! - A storage interface for blocks and undo data
//!
//! ## Validity
//!
//! A node is `Unvalidated` until its block connects, then `Valid`. A failed
//! block and every descendant become `Invalid`, and later headers building
//! on them are rejected without re-checking.

mod chainstate;
mod error;
mod index;
mod store;

pub use chainstate::{ChainSelection, ChainView, Chainstate, TipInfo, TipUpdate};
pub use error::{ChainError, ChainResult};
pub use index::{skip_height, ActiveChain, BlockStatus, CandidateKey, ChainIndex, ChainNode, NodeId};
pub use store::{BlockStore, MemoryBlockStore};
