//! Pool entries and their package aggregates.

use crate::ordering::{AncestorScoreKey, FeeRate};
use betg_consensus::{Amount, Transaction};
use betg_pow::Hash256;
use std::collections::HashSet;
use std::sync::Arc;

/// A transaction to be inserted, with the facts admission established.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub tx: Arc<Transaction>,
    /// Base fee paid (inputs minus outputs).
    pub fee: Amount,
    pub time: i64,
    pub entry_height: u32,
    pub spends_coinbase: bool,
    pub sigop_cost: u64,
}

impl NewEntry {
    pub fn new(tx: impl Into<Arc<Transaction>>, fee: Amount) -> Self {
        Self {
            tx: tx.into(),
            fee,
            time: 0,
            entry_height: 0,
            spends_coinbase: false,
            sigop_cost: 0,
        }
    }

    pub fn time(mut self, time: i64) -> Self {
        self.time = time;
        self
    }

    pub fn height(mut self, height: u32) -> Self {
        self.entry_height = height;
        self
    }

    pub fn spends_coinbase(mut self, spends_coinbase: bool) -> Self {
        self.spends_coinbase = spends_coinbase;
        self
    }

    pub fn sigop_cost(mut self, sigop_cost: u64) -> Self {
        self.sigop_cost = sigop_cost;
        self
    }
}

/// A transaction in the pool.
///
/// Ancestor aggregates cover the entry and every in-pool ancestor;
/// descendant aggregates cover the entry and every in-pool descendant.
/// Fee aggregates use modified fees.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Arc<Transaction>,
    pub txid: Hash256,
    pub fee: Amount,
    /// Operator priority adjustment.
    pub fee_delta: Amount,
    pub vsize: u64,
    pub sigop_cost: u64,
    pub time: i64,
    /// Insertion order, unique within the pool.
    pub sequence: u64,
    pub entry_height: u32,
    pub spends_coinbase: bool,

    /// Direct in-pool parents.
    pub parents: HashSet<Hash256>,
    /// Direct in-pool children.
    pub children: HashSet<Hash256>,

    pub ancestor_count: u64,
    pub ancestor_size: u64,
    pub ancestor_fees: Amount,
    pub ancestor_sigops: u64,

    pub descendant_count: u64,
    pub descendant_size: u64,
    pub descendant_fees: Amount,
}

impl MempoolEntry {
    pub(crate) fn new(entry: NewEntry, sequence: u64, fee_delta: Amount) -> Self {
        let txid = entry.tx.txid();
        let vsize = entry.tx.vsize();
        let modified = entry.fee.saturating_add(fee_delta);
        Self {
            txid,
            fee: entry.fee,
            fee_delta,
            vsize,
            sigop_cost: entry.sigop_cost,
            time: entry.time,
            sequence,
            entry_height: entry.entry_height,
            spends_coinbase: entry.spends_coinbase,
            parents: HashSet::new(),
            children: HashSet::new(),
            ancestor_count: 1,
            ancestor_size: vsize,
            ancestor_fees: modified,
            ancestor_sigops: entry.sigop_cost,
            descendant_count: 1,
            descendant_size: vsize,
            descendant_fees: modified,
            tx: entry.tx,
        }
    }

    /// Fee plus the priority delta.
    pub fn modified_fee(&self) -> Amount {
        self.fee.saturating_add(self.fee_delta)
    }

    pub fn weight(&self) -> u64 {
        self.tx.weight()
    }

    pub fn feerate(&self) -> FeeRate {
        FeeRate::from_fee(self.modified_fee(), self.vsize)
    }

    pub fn ancestor_feerate(&self) -> FeeRate {
        FeeRate::from_fee(self.ancestor_fees, self.ancestor_size)
    }

    pub fn descendant_feerate(&self) -> FeeRate {
        FeeRate::from_fee(self.descendant_fees, self.descendant_size)
    }

    pub fn ancestor_score_key(&self) -> AncestorScoreKey {
        AncestorScoreKey {
            fees: self.ancestor_fees,
            size: self.ancestor_size,
            sequence: self.sequence,
            txid: self.txid,
        }
    }

    /// Whether any input opts in to replacement.
    pub fn signals_replacement(&self) -> bool {
        signals_replacement(&self.tx)
    }
}

/// Sequence at or below which an input signals replaceability.
pub const MAX_REPLACEABLE_SEQUENCE: u32 = 0xffff_fffd;

pub fn signals_replacement(tx: &Transaction) -> bool {
    tx.inputs
        .iter()
        .any(|input| input.sequence <= MAX_REPLACEABLE_SEQUENCE)
}
