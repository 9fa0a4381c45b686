//! BetGenius node.
//!
//! Wires the chainstate, mempool and miner together:
//! - [`Node::submit_block`] connects blocks and keeps the mempool consistent
//!   across reorganizations
//! - [`Node::accept_transaction`] applies node policy on top of mempool admission
//! - [`Node::run`] drives mempool expiry and the internal CPU miner
//!
//! Listeners registered through [`Node::register`] receive
//! [`ValidationInterface`] callbacks after all internal locks are released.

pub mod cli;
pub mod config;
pub mod node;
pub mod notify;

pub use cli::Args;
pub use config::{MempoolSection, MiningSection, NodeConfig};
pub use node::Node;
pub use notify::{LogListener, Notification, NotificationBus, ValidationInterface};
