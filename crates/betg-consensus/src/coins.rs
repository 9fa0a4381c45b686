//! Unspent output views.
//!
//! `MemoryCoins` holds the confirmed set. Block connection and template
//! checks run against a `CoinsOverlay`, which records spends and additions
//! on top of any base view and is either committed in one step or dropped.

use crate::transaction::{OutPoint, Transaction, TxOut};
use crate::{ConsensusError, ConsensusResult, TxFailure};
use betg_pow::Hash256;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An unspent output with the context needed to spend it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub output: TxOut,
    /// Height of the block that created it.
    pub height: u32,
    pub is_coinbase: bool,
}

impl Coin {
    pub fn new(output: TxOut, height: u32, is_coinbase: bool) -> Self {
        Self {
            output,
            height,
            is_coinbase,
        }
    }
}

/// Read access to a set of unspent outputs.
pub trait CoinsView {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin>;

    fn have_coin(&self, outpoint: &OutPoint) -> bool {
        self.get_coin(outpoint).is_some()
    }

    /// Block whose state this view reflects.
    fn best_block(&self) -> Hash256;
}

/// Coins spent by one transaction, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxUndo {
    pub spent: Vec<Coin>,
}

/// Undo data for a block: one entry per non-coinbase transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UndoSet {
    pub txs: Vec<TxUndo>,
}

/// In-memory unspent output set.
#[derive(Debug, Clone, Default)]
pub struct MemoryCoins {
    coins: HashMap<OutPoint, Coin>,
    best_block: Hash256,
}

impl MemoryCoins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.coins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.is_empty()
    }

    pub fn add_coin(&mut self, outpoint: OutPoint, coin: Coin) {
        self.coins.insert(outpoint, coin);
    }

    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        self.coins.remove(outpoint)
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = hash;
    }

    /// Apply the changes recorded by an overlay.
    pub fn apply(&mut self, changes: CoinsChanges) {
        for (outpoint, entry) in changes.entries {
            match entry {
                Some(coin) => {
                    self.coins.insert(outpoint, coin);
                }
                None => {
                    self.coins.remove(&outpoint);
                }
            }
        }
        if let Some(best) = changes.best_block {
            self.best_block = best;
        }
    }
}

impl CoinsView for MemoryCoins {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.coins.get(outpoint).cloned()
    }

    fn have_coin(&self, outpoint: &OutPoint) -> bool {
        self.coins.contains_key(outpoint)
    }

    fn best_block(&self) -> Hash256 {
        self.best_block
    }
}

/// Changes taken out of an overlay. `None` marks a spent coin.
#[derive(Debug, Default)]
pub struct CoinsChanges {
    entries: HashMap<OutPoint, Option<Coin>>,
    best_block: Option<Hash256>,
}

impl CoinsChanges {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Write cache over a base view.
pub struct CoinsOverlay<'a, V: CoinsView + ?Sized> {
    base: &'a V,
    entries: HashMap<OutPoint, Option<Coin>>,
    best_block: Option<Hash256>,
}

impl<'a, V: CoinsView + ?Sized> CoinsOverlay<'a, V> {
    pub fn new(base: &'a V) -> Self {
        Self {
            base,
            entries: HashMap::new(),
            best_block: None,
        }
    }

    pub fn add_coin(&mut self, outpoint: OutPoint, coin: Coin) {
        self.entries.insert(outpoint, Some(coin));
    }

    /// Spend a coin, returning it if it was unspent.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        let coin = self.get_coin(outpoint)?;
        self.entries.insert(*outpoint, None);
        Some(coin)
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = Some(hash);
    }

    /// Add every output of `tx` at `height`.
    pub fn add_outputs(&mut self, tx: &Transaction, height: u32) {
        let txid = tx.txid();
        let is_coinbase = tx.is_coinbase();
        for (vout, output) in tx.outputs.iter().enumerate() {
            self.add_coin(
                OutPoint::new(txid, vout as u32),
                Coin::new(output.clone(), height, is_coinbase),
            );
        }
    }

    /// Spend the inputs of `tx` and add its outputs.
    ///
    /// Returns the spent coins for undo. Coinbase transactions spend nothing.
    pub fn update_coins(&mut self, tx: &Transaction, height: u32) -> ConsensusResult<TxUndo> {
        let mut undo = TxUndo::default();
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                let coin = self.spend_coin(&input.prevout).ok_or_else(|| {
                    ConsensusError::tx_kind(
                        TxFailure::MissingInputs,
                        "bad-txns-inputs-missingorspent",
                        format!("{} missing or spent", input.prevout),
                    )
                })?;
                undo.spent.push(coin);
            }
        }
        self.add_outputs(tx, height);
        Ok(undo)
    }

    /// Reverse `update_coins`: drop the outputs of `tx` and restore its inputs.
    ///
    /// Returns false if the view was inconsistent with the undo data (an
    /// output was already missing); the restore still completes.
    pub fn undo_coins(&mut self, tx: &Transaction, undo: Option<&TxUndo>) -> bool {
        let mut clean = true;
        let txid = tx.txid();
        for vout in 0..tx.outputs.len() {
            if self.spend_coin(&OutPoint::new(txid, vout as u32)).is_none() {
                clean = false;
            }
        }
        if let Some(undo) = undo {
            for (input, coin) in tx.inputs.iter().zip(&undo.spent).rev() {
                if self.have_coin(&input.prevout) {
                    clean = false;
                }
                self.add_coin(input.prevout, coin.clone());
            }
        }
        clean
    }

    /// Take the recorded changes, releasing the borrow of the base view.
    pub fn into_changes(self) -> CoinsChanges {
        CoinsChanges {
            entries: self.entries,
            best_block: self.best_block,
        }
    }
}

impl<V: CoinsView + ?Sized> CoinsView for CoinsOverlay<'_, V> {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        match self.entries.get(outpoint) {
            Some(entry) => entry.clone(),
            None => self.base.get_coin(outpoint),
        }
    }

    fn best_block(&self) -> Hash256 {
        self.best_block.unwrap_or_else(|| self.base.best_block())
    }
}
