//! Validation notifications.
//!
//! Chain and mempool changes are collected while their locks are held and
//! handed to listeners only after every lock has been released, so a
//! listener may call back into the node.

use betg_chain::TipInfo;
use betg_consensus::{Block, Transaction};
use betg_mempool::{RemovalReason, RemovedTx};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// Receiver of validation events. Every method defaults to a no-op.
pub trait ValidationInterface: Send + Sync {
    /// The active tip moved. `fork_height` is set after a reorganization.
    fn on_updated_block_tip(&self, _tip: &TipInfo, _fork_height: Option<u32>) {}

    fn on_block_connected(&self, _block: &Arc<Block>) {}

    fn on_block_disconnected(&self, _block: &Arc<Block>) {}

    fn on_transaction_added_to_mempool(&self, _tx: &Arc<Transaction>) {}

    fn on_transaction_removed_from_mempool(&self, _tx: &Arc<Transaction>, _reason: RemovalReason) {}
}

/// One queued event.
#[derive(Debug, Clone)]
pub enum Notification {
    UpdatedBlockTip { tip: TipInfo, fork_height: Option<u32> },
    BlockConnected(Arc<Block>),
    BlockDisconnected(Arc<Block>),
    TransactionAdded(Arc<Transaction>),
    TransactionRemoved { tx: Arc<Transaction>, reason: RemovalReason },
}

impl Notification {
    pub fn removed(removed: RemovedTx) -> Self {
        Notification::TransactionRemoved {
            tx: removed.tx,
            reason: removed.reason,
        }
    }

    fn deliver(&self, listener: &dyn ValidationInterface) {
        match self {
            Notification::UpdatedBlockTip { tip, fork_height } => {
                listener.on_updated_block_tip(tip, *fork_height)
            }
            Notification::BlockConnected(block) => listener.on_block_connected(block),
            Notification::BlockDisconnected(block) => listener.on_block_disconnected(block),
            Notification::TransactionAdded(tx) => listener.on_transaction_added_to_mempool(tx),
            Notification::TransactionRemoved { tx, reason } => {
                listener.on_transaction_removed_from_mempool(tx, *reason)
            }
        }
    }
}

/// Registered listeners.
#[derive(Default)]
pub struct NotificationBus {
    listeners: RwLock<Vec<Arc<dyn ValidationInterface>>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn ValidationInterface>) {
        self.listeners.write().push(listener);
    }

    pub fn unregister_all(&self) {
        self.listeners.write().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver `events` in order to every listener.
    ///
    /// Must not be called with the chain or mempool lock held.
    pub fn dispatch(&self, events: Vec<Notification>) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        debug!(events = events.len(), listeners = listeners.len(), "Dispatching notifications");
        for event in &events {
            for listener in &listeners {
                event.deliver(listener.as_ref());
            }
        }
    }
}

/// Listener that writes every event to the log.
pub struct LogListener;

impl ValidationInterface for LogListener {
    fn on_updated_block_tip(&self, tip: &TipInfo, fork_height: Option<u32>) {
        info!(height = tip.height, hash = %tip.hash, ?fork_height, "Updated tip");
    }

    fn on_block_connected(&self, block: &Arc<Block>) {
        debug!(height = block.header.height, txs = block.transactions.len(), "Block connected");
    }

    fn on_block_disconnected(&self, block: &Arc<Block>) {
        debug!(height = block.header.height, hash = %block.hash(), "Block disconnected");
    }

    fn on_transaction_added_to_mempool(&self, tx: &Arc<Transaction>) {
        debug!(txid = %tx.txid(), "Transaction added to mempool");
    }

    fn on_transaction_removed_from_mempool(&self, tx: &Arc<Transaction>, reason: RemovalReason) {
        debug!(txid = %tx.txid(), %reason, "Transaction removed from mempool");
    }
}
