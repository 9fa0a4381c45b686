//! Transaction pool with exact package accounting.
//!
//! Every entry caches aggregates over its in-pool ancestors and descendants.
//! All mutations run under one write lock and keep those aggregates exact:
//!
//! - insertion walks the new entry's ancestors once and adds it to each
//!   ancestor's descendant totals
//! - cascading removal (`remove_recursive`, expiry, eviction, conflicts)
//!   takes a descendant-closed set, so only surviving ancestors change
//! - confirmation removes a single entry and shrinks its descendants'
//!   ancestor totals
//! - prioritisation shifts the modified fee of the entry, its descendants'
//!   ancestor fees, and its ancestors' descendant fees

use crate::entry::{MempoolEntry, NewEntry};
use crate::ordering::{compare_feerate, AncestorScoreKey, FeeRate};
use crate::{MempoolError, MempoolResult};
use crate::{
    DEFAULT_ANCESTOR_LIMIT, DEFAULT_ANCESTOR_SIZE_LIMIT, DEFAULT_DESCENDANT_LIMIT,
    DEFAULT_DESCENDANT_SIZE_LIMIT, DEFAULT_EXPIRY_SECS, DEFAULT_INCREMENTAL_RELAY_FEE,
    DEFAULT_MAX_REPLACEMENT_EVICTIONS, DEFAULT_MAX_SIZE, DEFAULT_MIN_RELAY_FEE,
};
use betg_consensus::{Amount, OutPoint, Transaction};
use betg_pow::Hash256;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Mempool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MempoolConfig {
    /// Maximum total virtual size.
    pub max_size: u64,
    /// Entries older than this are expired.
    pub expiry_secs: i64,
    /// Maximum in-pool ancestors, counting the entry itself.
    pub ancestor_limit: u64,
    /// Maximum virtual size of an entry with its ancestors.
    pub ancestor_size_limit: u64,
    /// Maximum in-pool descendants, counting the entry itself.
    pub descendant_limit: u64,
    /// Maximum virtual size of an entry with its descendants.
    pub descendant_size_limit: u64,
    pub min_relay_fee: FeeRate,
    /// Feerate a replacement must add on top of what it evicts.
    pub incremental_relay_fee: FeeRate,
    /// Allow replacing transactions that did not opt in.
    pub full_rbf: bool,
    pub max_replacement_evictions: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            expiry_secs: DEFAULT_EXPIRY_SECS,
            ancestor_limit: DEFAULT_ANCESTOR_LIMIT,
            ancestor_size_limit: DEFAULT_ANCESTOR_SIZE_LIMIT,
            descendant_limit: DEFAULT_DESCENDANT_LIMIT,
            descendant_size_limit: DEFAULT_DESCENDANT_SIZE_LIMIT,
            min_relay_fee: DEFAULT_MIN_RELAY_FEE,
            incremental_relay_fee: DEFAULT_INCREMENTAL_RELAY_FEE,
            full_rbf: false,
            max_replacement_evictions: DEFAULT_MAX_REPLACEMENT_EVICTIONS,
        }
    }
}

/// Why an entry left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalReason {
    Expiry,
    SizeLimit,
    Reorg,
    Block,
    Conflict,
    Replaced,
    Manual,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Expiry => "expiry",
            Self::SizeLimit => "sizelimit",
            Self::Reorg => "reorg",
            Self::Block => "block",
            Self::Conflict => "conflict",
            Self::Replaced => "replaced",
            Self::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// A transaction that left the pool.
#[derive(Debug, Clone)]
pub struct RemovedTx {
    pub tx: Arc<Transaction>,
    pub txid: Hash256,
    pub reason: RemovalReason,
}

/// Mempool statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MempoolStats {
    pub tx_count: usize,
    pub total_vsize: u64,
    /// Sum of base fees.
    pub total_fees: Amount,
    /// Priority deltas held, including those for absent transactions.
    pub pending_deltas: usize,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Ancestors,
    Descendants,
}

/// Pool state guarded by the mempool lock.
#[derive(Debug, Default)]
pub(crate) struct PoolInner {
    pub(crate) entries: HashMap<Hash256, MempoolEntry>,
    /// Outpoint to the pool transaction spending it.
    pub(crate) spenders: HashMap<OutPoint, Hash256>,
    pub(crate) by_score: BTreeSet<AncestorScoreKey>,
    pub(crate) deltas: HashMap<Hash256, Amount>,
    pub(crate) next_sequence: u64,
    total_vsize: u64,
    total_fees: Amount,
}

impl PoolInner {
    fn links(&self, txid: &Hash256, direction: Direction) -> Vec<Hash256> {
        self.entries
            .get(txid)
            .map(|entry| match direction {
                Direction::Ancestors => entry.parents.iter().copied().collect(),
                Direction::Descendants => entry.children.iter().copied().collect(),
            })
            .unwrap_or_default()
    }

    fn closure(&self, mut stack: Vec<Hash256>, direction: Direction) -> HashSet<Hash256> {
        let mut seen = HashSet::new();
        while let Some(txid) = stack.pop() {
            if seen.insert(txid) {
                stack.extend(self.links(&txid, direction));
            }
        }
        seen
    }

    /// In-pool ancestors, excluding `txid`.
    pub(crate) fn ancestors(&self, txid: &Hash256) -> HashSet<Hash256> {
        self.closure(self.links(txid, Direction::Ancestors), Direction::Ancestors)
    }

    /// In-pool descendants, excluding `txid`.
    pub(crate) fn descendants(&self, txid: &Hash256) -> HashSet<Hash256> {
        self.closure(self.links(txid, Direction::Descendants), Direction::Descendants)
    }

    /// Pool transactions whose outputs `tx` spends.
    pub(crate) fn parents_of(&self, tx: &Transaction) -> HashSet<Hash256> {
        tx.inputs
            .iter()
            .map(|input| input.prevout.txid)
            .filter(|txid| self.entries.contains_key(txid))
            .collect()
    }

    /// Every in-pool ancestor of a transaction with the given parents.
    pub(crate) fn ancestors_from_parents(&self, parents: &HashSet<Hash256>) -> HashSet<Hash256> {
        self.closure(parents.iter().copied().collect(), Direction::Ancestors)
    }

    /// Pool transactions spending any input of `tx`, other than `tx` itself.
    pub(crate) fn conflicts_of(&self, tx: &Transaction) -> HashSet<Hash256> {
        let txid = tx.txid();
        tx.inputs
            .iter()
            .filter_map(|input| self.spenders.get(&input.prevout))
            .filter(|spender| **spender != txid)
            .copied()
            .collect()
    }

    /// Check ancestor limits for a new entry and descendant limits for each
    /// of its ancestors.
    pub(crate) fn check_package_limits(
        &self,
        ancestors: &HashSet<Hash256>,
        vsize: u64,
        config: &MempoolConfig,
    ) -> MempoolResult<()> {
        let count = ancestors.len() as u64 + 1;
        if count > config.ancestor_limit {
            return Err(MempoolError::TooManyAncestors(format!(
                "too many unconfirmed ancestors [limit: {}]",
                config.ancestor_limit
            )));
        }
        let size: u64 = ancestors
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|entry| entry.vsize)
            .sum::<u64>()
            + vsize;
        if size > config.ancestor_size_limit {
            return Err(MempoolError::TooManyAncestors(format!(
                "exceeds ancestor size limit [limit: {}]",
                config.ancestor_size_limit
            )));
        }
        for ancestor in ancestors.iter().filter_map(|id| self.entries.get(id)) {
            if ancestor.descendant_count + 1 > config.descendant_limit {
                return Err(MempoolError::TooManyAncestors(format!(
                    "too many descendants for tx {} [limit: {}]",
                    ancestor.txid, config.descendant_limit
                )));
            }
            if ancestor.descendant_size + vsize > config.descendant_size_limit {
                return Err(MempoolError::TooManyAncestors(format!(
                    "exceeds descendant size limit for tx {} [limit: {}]",
                    ancestor.txid, config.descendant_size_limit
                )));
            }
        }
        Ok(())
    }

    /// Apply `f` to an entry, keeping the score index in step.
    fn update_entry(&mut self, txid: &Hash256, f: impl FnOnce(&mut MempoolEntry)) {
        if let Some(entry) = self.entries.get_mut(txid) {
            self.by_score.remove(&entry.ancestor_score_key());
            f(entry);
            self.by_score.insert(entry.ancestor_score_key());
        }
    }

    /// Insert without policy checks. The caller has ruled out duplicates
    /// and conflicts.
    pub(crate) fn insert(&mut self, new: NewEntry, sequence: Option<u64>) -> Hash256 {
        let sequence = sequence.unwrap_or(self.next_sequence);
        self.next_sequence = self.next_sequence.max(sequence + 1);

        let txid = new.tx.txid();
        let delta = self.deltas.get(&txid).copied().unwrap_or(0);
        let mut entry = MempoolEntry::new(new, sequence, delta);

        let parents = self.parents_of(&entry.tx);
        let ancestors = self.ancestors_from_parents(&parents);
        for ancestor in ancestors.iter().filter_map(|id| self.entries.get(id)) {
            entry.ancestor_count += 1;
            entry.ancestor_size += ancestor.vsize;
            entry.ancestor_fees += ancestor.modified_fee();
            entry.ancestor_sigops += ancestor.sigop_cost;
        }
        // Ancestor scores do not depend on descendants.
        for id in &ancestors {
            if let Some(ancestor) = self.entries.get_mut(id) {
                ancestor.descendant_count += 1;
                ancestor.descendant_size += entry.vsize;
                ancestor.descendant_fees += entry.modified_fee();
            }
        }
        for id in &parents {
            if let Some(parent) = self.entries.get_mut(id) {
                parent.children.insert(txid);
            }
        }
        entry.parents = parents;

        for input in &entry.tx.inputs {
            self.spenders.insert(input.prevout, txid);
        }
        self.total_vsize += entry.vsize;
        self.total_fees += entry.fee;
        self.by_score.insert(entry.ancestor_score_key());
        self.entries.insert(txid, entry);
        self.link_existing_children(&txid);
        txid
    }

    /// Attach entries that already spend outputs of `txid`. Happens when a
    /// disconnected block returns a transaction whose children stayed in
    /// the pool.
    fn link_existing_children(&mut self, txid: &Hash256) {
        let Some(entry) = self.entries.get(txid) else {
            return;
        };
        let children: HashSet<Hash256> = (0..entry.tx.outputs.len() as u32)
            .filter_map(|vout| self.spenders.get(&OutPoint::new(*txid, vout)).copied())
            .collect();
        if children.is_empty() {
            return;
        }

        let mut uppers = self.ancestors(txid);
        uppers.insert(*txid);
        let lowers = self.closure(children.iter().copied().collect(), Direction::Descendants);
        let known: HashMap<Hash256, HashSet<Hash256>> = lowers
            .iter()
            .map(|lower| (*lower, self.ancestors(lower)))
            .collect();

        for child in &children {
            if let Some(child) = self.entries.get_mut(child) {
                child.parents.insert(*txid);
            }
        }
        if let Some(entry) = self.entries.get_mut(txid) {
            entry.children.extend(children.iter().copied());
        }

        for lower in &lowers {
            let Some((lower_size, lower_fee)) = self
                .entries
                .get(lower)
                .map(|e| (e.vsize, e.modified_fee()))
            else {
                continue;
            };
            let fresh: Vec<Hash256> = uppers
                .iter()
                .filter(|upper| !known.get(lower).is_some_and(|k| k.contains(*upper)))
                .copied()
                .collect();
            for upper in fresh {
                let Some((size, fee, sigops)) = self
                    .entries
                    .get(&upper)
                    .map(|e| (e.vsize, e.modified_fee(), e.sigop_cost))
                else {
                    continue;
                };
                self.update_entry(lower, |e| {
                    e.ancestor_count += 1;
                    e.ancestor_size += size;
                    e.ancestor_fees += fee;
                    e.ancestor_sigops += sigops;
                });
                if let Some(e) = self.entries.get_mut(&upper) {
                    e.descendant_count += 1;
                    e.descendant_size += lower_size;
                    e.descendant_fees += lower_fee;
                }
            }
        }
    }

    /// Remove a descendant-closed set of entries.
    pub(crate) fn remove_set(
        &mut self,
        set: &HashSet<Hash256>,
        reason: RemovalReason,
    ) -> Vec<RemovedTx> {
        // Settle surviving ancestors before the graph changes.
        let mut adjustments: HashMap<Hash256, (u64, u64, Amount)> = HashMap::new();
        for txid in set {
            let Some(entry) = self.entries.get(txid) else {
                continue;
            };
            let (vsize, fee) = (entry.vsize, entry.modified_fee());
            for ancestor in self.ancestors(txid) {
                if !set.contains(&ancestor) {
                    let adj = adjustments.entry(ancestor).or_default();
                    adj.0 += 1;
                    adj.1 += vsize;
                    adj.2 += fee;
                }
            }
        }
        for (txid, (count, size, fees)) in adjustments {
            if let Some(ancestor) = self.entries.get_mut(&txid) {
                ancestor.descendant_count -= count;
                ancestor.descendant_size -= size;
                ancestor.descendant_fees -= fees;
            }
        }

        let mut removed = Vec::with_capacity(set.len());
        for txid in set {
            if let Some(entry) = self.detach(txid) {
                removed.push(entry);
            }
        }
        removed.sort_by_key(|entry| entry.sequence);
        removed
            .into_iter()
            .map(|entry| RemovedTx {
                tx: entry.tx,
                txid: entry.txid,
                reason,
            })
            .collect()
    }

    /// Unlink one entry from the graph and indexes. Aggregates of other
    /// entries are the caller's responsibility.
    fn detach(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        self.by_score.remove(&entry.ancestor_score_key());
        for input in &entry.tx.inputs {
            if self.spenders.get(&input.prevout) == Some(txid) {
                self.spenders.remove(&input.prevout);
            }
        }
        for parent in &entry.parents {
            if let Some(parent) = self.entries.get_mut(parent) {
                parent.children.remove(txid);
            }
        }
        for child in &entry.children {
            if let Some(child) = self.entries.get_mut(child) {
                child.parents.remove(txid);
            }
        }
        self.total_vsize -= entry.vsize;
        self.total_fees -= entry.fee;
        Some(entry)
    }

    /// Remove a confirmed entry, leaving its descendants in place.
    fn remove_confirmed(&mut self, txid: &Hash256) -> Option<RemovedTx> {
        let (vsize, fee, sigops) = {
            let entry = self.entries.get(txid)?;
            (entry.vsize, entry.modified_fee(), entry.sigop_cost)
        };
        for descendant in self.descendants(txid) {
            self.update_entry(&descendant, |d| {
                d.ancestor_count -= 1;
                d.ancestor_size -= vsize;
                d.ancestor_fees -= fee;
                d.ancestor_sigops -= sigops;
            });
        }
        for ancestor in self.ancestors(txid) {
            if let Some(a) = self.entries.get_mut(&ancestor) {
                a.descendant_count -= 1;
                a.descendant_size -= vsize;
                a.descendant_fees -= fee;
            }
        }
        self.detach(txid).map(|entry| RemovedTx {
            tx: entry.tx,
            txid: entry.txid,
            reason: RemovalReason::Block,
        })
    }

    pub(crate) fn with_descendants(
        &self,
        roots: impl IntoIterator<Item = Hash256>,
    ) -> HashSet<Hash256> {
        let mut set = HashSet::new();
        for root in roots {
            if set.insert(root) {
                set.extend(self.descendants(&root));
            }
        }
        set
    }

    fn prioritise(&mut self, txid: &Hash256, delta: Amount) {
        let total = {
            let stored = self.deltas.entry(*txid).or_insert(0);
            *stored = stored.saturating_add(delta);
            *stored
        };
        let Some(entry) = self.entries.get(txid) else {
            return;
        };
        // What the modified fee actually moves by once clamped.
        let applied = entry
            .fee
            .saturating_add(total)
            .saturating_sub(entry.modified_fee());
        self.update_entry(txid, |entry| {
            entry.fee_delta = total;
            entry.ancestor_fees = entry.ancestor_fees.saturating_add(applied);
            entry.descendant_fees = entry.descendant_fees.saturating_add(applied);
        });
        for descendant in self.descendants(txid) {
            self.update_entry(&descendant, |d| {
                d.ancestor_fees = d.ancestor_fees.saturating_add(applied)
            });
        }
        for ancestor in self.ancestors(txid) {
            if let Some(a) = self.entries.get_mut(&ancestor) {
                a.descendant_fees = a.descendant_fees.saturating_add(applied);
            }
        }
    }

    pub(crate) fn trim(&mut self, max_size: u64) -> Vec<RemovedTx> {
        let mut removed = Vec::new();
        while self.total_vsize > max_size {
            let Some(worst) = self.worst_descendant_score() else {
                break;
            };
            let set = self.with_descendants([worst]);
            removed.extend(self.remove_set(&set, RemovalReason::SizeLimit));
        }
        removed
    }

    /// The entry whose package pays the least, newest first on ties.
    fn worst_descendant_score(&self) -> Option<Hash256> {
        self.entries
            .values()
            .min_by(|a, b| {
                compare_feerate(
                    a.descendant_fees,
                    a.descendant_size,
                    b.descendant_fees,
                    b.descendant_size,
                )
                .then_with(|| b.sequence.cmp(&a.sequence))
            })
            .map(|entry| entry.txid)
    }

    fn check_consistency(&self) -> Result<(), String> {
        let mut total_vsize = 0;
        let mut total_fees = 0;
        for (txid, entry) in &self.entries {
            total_vsize += entry.vsize;
            total_fees += entry.fee;

            if entry.parents != self.parents_of(&entry.tx) {
                return Err(format!("{txid}: parent links out of date"));
            }
            for child in &entry.children {
                match self.entries.get(child) {
                    Some(c) if c.parents.contains(txid) => {}
                    _ => return Err(format!("{txid}: dangling child {child}")),
                }
            }
            for input in &entry.tx.inputs {
                if self.spenders.get(&input.prevout) != Some(txid) {
                    return Err(format!("{txid}: spender index missing {}", input.prevout));
                }
            }

            let ancestors: Vec<&MempoolEntry> = self
                .ancestors(txid)
                .iter()
                .filter_map(|id| self.entries.get(id))
                .collect();
            let expected = (
                ancestors.len() as u64 + 1,
                ancestors.iter().map(|a| a.vsize).sum::<u64>() + entry.vsize,
                ancestors.iter().map(|a| a.modified_fee()).sum::<Amount>() + entry.modified_fee(),
                ancestors.iter().map(|a| a.sigop_cost).sum::<u64>() + entry.sigop_cost,
            );
            let actual = (
                entry.ancestor_count,
                entry.ancestor_size,
                entry.ancestor_fees,
                entry.ancestor_sigops,
            );
            if expected != actual {
                return Err(format!(
                    "{txid}: ancestor aggregates {actual:?}, expected {expected:?}"
                ));
            }

            let descendants: Vec<&MempoolEntry> = self
                .descendants(txid)
                .iter()
                .filter_map(|id| self.entries.get(id))
                .collect();
            let expected = (
                descendants.len() as u64 + 1,
                descendants.iter().map(|d| d.vsize).sum::<u64>() + entry.vsize,
                descendants.iter().map(|d| d.modified_fee()).sum::<Amount>()
                    + entry.modified_fee(),
            );
            let actual = (
                entry.descendant_count,
                entry.descendant_size,
                entry.descendant_fees,
            );
            if expected != actual {
                return Err(format!(
                    "{txid}: descendant aggregates {actual:?}, expected {expected:?}"
                ));
            }

            if !self.by_score.contains(&entry.ancestor_score_key()) {
                return Err(format!("{txid}: missing from score index"));
            }
        }
        if self.by_score.len() != self.entries.len() {
            return Err("score index size mismatch".to_string());
        }
        if self.spenders.values().any(|id| !self.entries.contains_key(id)) {
            return Err("spender index names a removed entry".to_string());
        }
        if (total_vsize, total_fees) != (self.total_vsize, self.total_fees) {
            return Err("pool totals out of date".to_string());
        }
        Ok(())
    }
}

/// Unconfirmed transaction pool.
///
/// Lock order: take the chain lock before the pool lock.
pub struct Mempool {
    config: MempoolConfig,
    pub(crate) inner: RwLock<PoolInner>,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(PoolInner::default()),
        }
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    /// Insert a transaction without fee, limit or input checks.
    ///
    /// Ancestor and descendant aggregates are still maintained. Fails only
    /// on duplicates and inputs already spent in the pool.
    #[instrument(skip(self, entry), fields(txid = %entry.tx.txid(), fee = entry.fee))]
    pub fn add_unchecked(&self, entry: NewEntry) -> MempoolResult<Hash256> {
        let mut inner = self.inner.write();
        let txid = entry.tx.txid();
        if inner.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyExists(txid));
        }
        for input in &entry.tx.inputs {
            if let Some(spender) = inner.spenders.get(&input.prevout) {
                return Err(MempoolError::Conflict {
                    outpoint: input.prevout,
                    spender: *spender,
                });
            }
        }
        inner.insert(entry, None);
        debug!(pool_size = inner.entries.len(), "Transaction added to mempool");
        Ok(txid)
    }

    /// Remove an entry and everything that spends from it.
    pub fn remove_recursive(&self, txid: &Hash256, reason: RemovalReason) -> Vec<RemovedTx> {
        let mut inner = self.inner.write();
        if !inner.entries.contains_key(txid) {
            return Vec::new();
        }
        let set = inner.with_descendants([*txid]);
        let removed = inner.remove_set(&set, reason);
        debug!(%txid, removed = removed.len(), %reason, "Removed transaction tree");
        removed
    }

    /// Update the pool for a newly connected block.
    ///
    /// Confirmed entries leave without their descendants; pool transactions
    /// conflicting with the block leave with theirs. Priority deltas of
    /// confirmed transactions are dropped.
    pub fn remove_for_block(&self, transactions: &[Transaction]) -> Vec<RemovedTx> {
        let mut inner = self.inner.write();
        let mut removed = Vec::new();
        for tx in transactions {
            let txid = tx.txid();
            let conflicts = inner.conflicts_of(tx);
            if !conflicts.is_empty() {
                let set = inner.with_descendants(conflicts);
                removed.extend(inner.remove_set(&set, RemovalReason::Conflict));
            }
            if let Some(entry) = inner.remove_confirmed(&txid) {
                removed.push(entry);
            }
            inner.deltas.remove(&txid);
        }
        if !removed.is_empty() {
            debug!(
                removed = removed.len(),
                remaining = inner.entries.len(),
                "Mempool updated for block"
            );
        }
        removed
    }

    /// Adjust the modified fee of `txid` by `delta`.
    ///
    /// Deltas accumulate. A delta for an absent transaction is kept and
    /// applied when it arrives.
    pub fn prioritise_transaction(&self, txid: &Hash256, delta: Amount) {
        let mut inner = self.inner.write();
        inner.prioritise(txid, delta);
        let total = inner.deltas.get(txid).copied().unwrap_or(0);
        info!(%txid, delta, total, "Transaction prioritised");
    }

    /// Forget the stored delta for `txid`. Does not change a pooled entry.
    pub fn clear_prioritisation(&self, txid: &Hash256) {
        self.inner.write().deltas.remove(txid);
    }

    /// Accumulated delta for `txid`.
    pub fn fee_delta(&self, txid: &Hash256) -> Amount {
        self.inner.read().deltas.get(txid).copied().unwrap_or(0)
    }

    /// Evict the lowest descendant-feerate packages until the pool fits.
    pub fn trim_to_size(&self, max_size: u64) -> Vec<RemovedTx> {
        let removed = self.inner.write().trim(max_size);
        if !removed.is_empty() {
            info!(evicted = removed.len(), max_size, "Mempool trimmed");
        }
        removed
    }

    /// Remove entries that arrived before `cutoff`, with their descendants.
    pub fn expire(&self, cutoff: i64) -> Vec<RemovedTx> {
        let mut inner = self.inner.write();
        let old: Vec<Hash256> = inner
            .entries
            .values()
            .filter(|entry| entry.time < cutoff)
            .map(|entry| entry.txid)
            .collect();
        if old.is_empty() {
            return Vec::new();
        }
        let set = inner.with_descendants(old);
        let removed = inner.remove_set(&set, RemovalReason::Expiry);
        info!(expired = removed.len(), cutoff, "Expired mempool transactions");
        removed
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.inner.read().entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<MempoolEntry> {
        self.inner.read().entries.get(txid).cloned()
    }

    pub fn get_tx(&self, txid: &Hash256) -> Option<Arc<Transaction>> {
        self.inner.read().entries.get(txid).map(|entry| entry.tx.clone())
    }

    /// Pool transaction spending `outpoint`.
    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.inner.read().spenders.get(outpoint).copied()
    }

    /// Transaction ids in insertion order.
    pub fn txids(&self) -> Vec<Hash256> {
        let inner = self.inner.read();
        let mut entries: Vec<&MempoolEntry> = inner.entries.values().collect();
        entries.sort_by_key(|entry| entry.sequence);
        entries.iter().map(|entry| entry.txid).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn stats(&self) -> MempoolStats {
        let inner = self.inner.read();
        MempoolStats {
            tx_count: inner.entries.len(),
            total_vsize: inner.total_vsize,
            total_fees: inner.total_fees,
            pending_deltas: inner.deltas.len(),
        }
    }

    /// Remove every entry. Priority deltas are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.spenders.clear();
        inner.by_score.clear();
        inner.total_vsize = 0;
        inner.total_fees = 0;
        info!("Mempool cleared");
    }

    /// Recompute every aggregate and index from the graph and compare.
    pub fn check_consistency(&self) -> Result<(), String> {
        self.inner.read().check_consistency()
    }

    /// Read-locked snapshot for block assembly.
    ///
    /// Holds the pool lock until dropped.
    pub fn read(&self) -> MempoolView<'_> {
        MempoolView {
            inner: self.inner.read(),
        }
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(MempoolConfig::default())
    }
}

/// Consistent read access to the pool graph.
pub struct MempoolView<'a> {
    inner: RwLockReadGuard<'a, PoolInner>,
}

impl MempoolView<'_> {
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.inner.entries.get(txid)
    }

    /// Entries by descending ancestor feerate, earliest first on ties.
    pub fn by_ancestor_score(&self) -> impl Iterator<Item = &MempoolEntry> + '_ {
        self.inner
            .by_score
            .iter()
            .filter_map(|key| self.inner.entries.get(&key.txid))
    }

    pub fn ancestors(&self, txid: &Hash256) -> HashSet<Hash256> {
        self.inner.ancestors(txid)
    }

    pub fn descendants(&self, txid: &Hash256) -> HashSet<Hash256> {
        self.inner.descendants(txid)
    }
}

/// Order two entries by ancestor count, then txid.
pub fn compare_by_ancestor_count(a: &MempoolEntry, b: &MempoolEntry) -> Ordering {
    a.ancestor_count
        .cmp(&b.ancestor_count)
        .then_with(|| a.txid.cmp(&b.txid))
}
