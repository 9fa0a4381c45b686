//! Block template assembly.
//!
//! Transactions are chosen as packages: an entry together with every
//! in-pool ancestor not yet in the block, ranked by ancestor feerate. Once
//! a package is added, its descendants' package figures shrink by what was
//! added; those reduced figures live in a side map so the pool itself is
//! never touched.

use crate::coinbase::CoinbaseBuilder;
use crate::{MiningError, MiningResult};
use betg_chain::{ChainView, Chainstate};
use betg_consensus::params::{
    MAX_BLOCK_SIGOPS_COST, MAX_BLOCK_WEIGHT, VERSIONBITS_TOP_BITS, WITNESS_SCALE_FACTOR,
};
use betg_consensus::{
    block_merkle_root, calculate_sequence_locks, decode_compact, evaluate_sequence_locks,
    get_block_subsidy, is_final_tx, target_to_hash, Amount, Block, BlockHeader, CoinsView, Script,
    Transaction,
};
use betg_mempool::{
    compare_by_ancestor_count, AncestorScoreKey, FeeRate, Mempool, MempoolEntry, MempoolView,
};
use betg_pow::Hash256;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Weight kept free for the coinbase.
pub const COINBASE_RESERVED_WEIGHT: u64 = 4000;

/// Sigop cost kept free for the coinbase.
pub const COINBASE_RESERVED_SIGOPS: u64 = 400;

/// Default template weight limit.
pub const DEFAULT_BLOCK_MAX_WEIGHT: u64 = MAX_BLOCK_WEIGHT - COINBASE_RESERVED_WEIGHT;

/// Default feerate below which packages are left out.
pub const DEFAULT_BLOCK_MIN_TX_FEE: FeeRate = FeeRate::per_kvb(1000);

/// Failed packages in a row, near a full block, before selection gives up.
pub const MAX_CONSECUTIVE_FAILURES: u64 = 1000;

/// Assembler options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblerOptions {
    pub block_max_weight: u64,
    pub block_min_fee_rate: FeeRate,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            block_max_weight: DEFAULT_BLOCK_MAX_WEIGHT,
            block_min_fee_rate: DEFAULT_BLOCK_MIN_TX_FEE,
        }
    }
}

impl AssemblerOptions {
    /// Weight limit kept inside `[4000, MAX_BLOCK_WEIGHT - 4000]`.
    pub fn clamped(self) -> Self {
        Self {
            block_max_weight: self.block_max_weight.clamp(
                COINBASE_RESERVED_WEIGHT,
                MAX_BLOCK_WEIGHT - COINBASE_RESERVED_WEIGHT,
            ),
            ..self
        }
    }
}

/// A candidate block and the facts about each of its transactions.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    /// Unsealed block: nonce 0 and an empty mix digest.
    pub block: Block,
    /// Base fee per transaction. Entry 0 is minus the total.
    pub fees: Vec<Amount>,
    pub sigop_costs: Vec<u64>,
    pub coinbase_value: Amount,
    /// Largest final hash that seals the block.
    pub target: Hash256,
    pub height: u32,
    pub weight: u64,
}

impl BlockTemplate {
    /// Total base fees collected.
    pub fn total_fees(&self) -> Amount {
        self.fees.iter().skip(1).sum()
    }

    pub fn tx_count(&self) -> usize {
        self.block.transactions.len()
    }
}

/// Package figures of an entry after some of its ancestors were selected.
#[derive(Debug, Clone, Copy)]
struct ModifiedEntry {
    size: u64,
    fees: Amount,
    sigops: u64,
    sequence: u64,
}

impl ModifiedEntry {
    fn from_entry(entry: &MempoolEntry) -> Self {
        Self {
            size: entry.ancestor_size,
            fees: entry.ancestor_fees,
            sigops: entry.ancestor_sigops,
            sequence: entry.sequence,
        }
    }

    fn key(&self, txid: Hash256) -> AncestorScoreKey {
        AncestorScoreKey {
            fees: self.fees,
            size: self.size,
            sequence: self.sequence,
            txid,
        }
    }
}

/// Running state of one selection pass.
#[derive(Default)]
struct Selection {
    in_block: HashSet<Hash256>,
    failed: HashSet<Hash256>,
    modified: HashMap<Hash256, ModifiedEntry>,
    modified_order: BTreeSet<AncestorScoreKey>,
    block_weight: u64,
    block_sigops: u64,
    fees: Amount,
    txs: Vec<Arc<Transaction>>,
    tx_fees: Vec<Amount>,
    tx_sigops: Vec<u64>,
}

impl Selection {
    fn new() -> Self {
        Self {
            block_weight: COINBASE_RESERVED_WEIGHT,
            block_sigops: COINBASE_RESERVED_SIGOPS,
            ..Default::default()
        }
    }

    fn skip(&self, txid: &Hash256) -> bool {
        self.in_block.contains(txid)
            || self.failed.contains(txid)
            || self.modified.contains_key(txid)
    }

    fn fits(&self, package_size: u64, package_sigops: u64, max_weight: u64) -> bool {
        self.block_weight + WITNESS_SCALE_FACTOR * package_size < max_weight
            && self.block_sigops + package_sigops < MAX_BLOCK_SIGOPS_COST
    }

    fn drop_modified(&mut self, txid: &Hash256) {
        if let Some(modified) = self.modified.remove(txid) {
            self.modified_order.remove(&modified.key(*txid));
        }
    }

    fn add(&mut self, entry: &MempoolEntry) {
        self.block_weight += entry.weight();
        self.block_sigops += entry.sigop_cost;
        self.fees += entry.fee;
        self.txs.push(Arc::clone(&entry.tx));
        self.tx_fees.push(entry.fee);
        self.tx_sigops.push(entry.sigop_cost);
        self.in_block.insert(entry.txid);
        self.drop_modified(&entry.txid);
    }

    /// Reduce the package figures of every descendant of `added` that is
    /// not itself part of it.
    fn update_for_added(&mut self, pool: &MempoolView<'_>, added: &[&MempoolEntry]) -> usize {
        let added_ids: HashSet<Hash256> = added.iter().map(|entry| entry.txid).collect();
        let mut updated = 0;
        for entry in added {
            for desc_id in pool.descendants(&entry.txid) {
                if added_ids.contains(&desc_id) {
                    continue;
                }
                let Some(desc) = pool.get(&desc_id) else {
                    continue;
                };
                let mut modified = match self.modified.remove(&desc_id) {
                    Some(modified) => {
                        self.modified_order.remove(&modified.key(desc_id));
                        modified
                    }
                    None => ModifiedEntry::from_entry(desc),
                };
                modified.size -= entry.vsize;
                modified.fees -= entry.modified_fee();
                modified.sigops -= entry.sigop_cost;
                self.modified_order.insert(modified.key(desc_id));
                self.modified.insert(desc_id, modified);
                updated += 1;
            }
        }
        updated
    }
}

/// Builds block templates from the active tip and the mempool.
pub struct BlockAssembler {
    chain: Arc<Chainstate>,
    mempool: Arc<Mempool>,
    options: AssemblerOptions,
}

impl BlockAssembler {
    pub fn new(chain: Arc<Chainstate>, mempool: Arc<Mempool>, options: AssemblerOptions) -> Self {
        Self {
            chain,
            mempool,
            options: options.clamped(),
        }
    }

    pub fn options(&self) -> &AssemblerOptions {
        &self.options
    }

    /// Assemble a template paying `coinbase_script`.
    ///
    /// The chain view and then the pool read lock are held until the
    /// template has passed its own validity check.
    #[instrument(skip_all)]
    pub fn create_new_block(&self, coinbase_script: &Script) -> MiningResult<BlockTemplate> {
        let view = self.chain.view();
        let tip = view.tip();
        let height = tip.height + 1;
        let lock_time_cutoff = tip.median_time_past;
        let time = (tip.median_time_past + 1).max(view.adjusted_time());
        let bits = view.next_work_required(time)?;

        let selection = {
            let pool = self.mempool.read();
            let selection = self.select_packages(&view, &pool, height, lock_time_cutoff);
            debug!(
                pool_size = pool.len(),
                selected = selection.txs.len(),
                "Package selection finished"
            );
            selection
        };

        let coinbase_value = get_block_subsidy(height, self.chain.params()) + selection.fees;
        let coinbase = CoinbaseBuilder::new(height, coinbase_script.clone())
            .value(coinbase_value)
            .build();

        let mut fees = Vec::with_capacity(selection.txs.len() + 1);
        fees.push(-selection.fees);
        fees.extend(&selection.tx_fees);
        let mut sigop_costs = Vec::with_capacity(selection.txs.len() + 1);
        sigop_costs.push(WITNESS_SCALE_FACTOR * u64::from(coinbase.legacy_sigop_count()));
        sigop_costs.extend(&selection.tx_sigops);

        let mut transactions = Vec::with_capacity(selection.txs.len() + 1);
        transactions.push(coinbase);
        transactions.extend(selection.txs.iter().map(|tx| tx.as_ref().clone()));

        let mut block = Block::new(
            BlockHeader {
                version: VERSIONBITS_TOP_BITS,
                prev_hash: tip.hash,
                merkle_root: Hash256::ZERO,
                time: u32::try_from(time).unwrap_or(u32::MAX),
                bits,
                nonce: 0,
                height,
                mix_hash: Hash256::ZERO,
            },
            transactions,
        );
        block.header.merkle_root = block_merkle_root(&block).0;

        self.chain
            .test_block_validity_in(&view, &block)
            .map_err(|e| MiningError::TemplateInvalid {
                reason: e.reason().to_string(),
                detail: e.to_string(),
            })?;
        drop(view);

        let target = decode_compact(bits);
        if !target.is_valid() {
            return Err(MiningError::InvalidTarget(bits));
        }
        let weight = block.weight();
        info!(
            height,
            txs = block.transactions.len(),
            weight,
            fees = selection.fees,
            sigops = selection.block_sigops,
            "Created block template"
        );
        Ok(BlockTemplate {
            block,
            fees,
            sigop_costs,
            coinbase_value,
            target: target_to_hash(&target.target),
            height,
            weight,
        })
    }

    fn select_packages(
        &self,
        view: &ChainView<'_>,
        pool: &MempoolView<'_>,
        height: u32,
        lock_time_cutoff: i64,
    ) -> Selection {
        let max_weight = self.options.block_max_weight;
        let mut selection = Selection::new();
        let mut consecutive_failures = 0u64;
        let mut pool_iter = pool.by_ancestor_score().peekable();

        loop {
            while pool_iter.next_if(|entry| selection.skip(&entry.txid)).is_some() {}

            let next_pool = pool_iter.peek().map(|entry| entry.ancestor_score_key());
            let best_modified = selection.modified_order.first().cloned();
            let (txid, using_modified) = match (next_pool, best_modified) {
                (None, None) => break,
                (None, Some(modified)) => (modified.txid, true),
                (Some(pooled), Some(modified)) if modified < pooled => (modified.txid, true),
                (Some(pooled), _) => {
                    pool_iter.next();
                    (pooled.txid, false)
                }
            };

            let (package_size, package_fees, package_sigops) = if using_modified {
                match selection.modified.get(&txid) {
                    Some(m) => (m.size, m.fees, m.sigops),
                    None => continue,
                }
            } else {
                match pool.get(&txid) {
                    Some(e) => (e.ancestor_size, e.ancestor_fees, e.ancestor_sigops),
                    None => continue,
                }
            };

            if package_fees < self.options.block_min_fee_rate.fee(package_size) {
                break;
            }

            let package = if selection.fits(package_size, package_sigops, max_weight) {
                self.package_of(pool, &selection, &txid).filter(|package| {
                    package_is_final(view, pool, package, height, lock_time_cutoff)
                })
            } else {
                None
            };
            let Some(mut package) = package else {
                if using_modified {
                    selection.drop_modified(&txid);
                    selection.failed.insert(txid);
                }
                consecutive_failures += 1;
                if consecutive_failures > MAX_CONSECUTIVE_FAILURES
                    && selection.block_weight > max_weight - COINBASE_RESERVED_WEIGHT
                {
                    break;
                }
                continue;
            };
            consecutive_failures = 0;

            package.sort_by(|a, b| compare_by_ancestor_count(a, b));
            for entry in &package {
                selection.add(entry);
            }
            selection.update_for_added(pool, &package);
        }
        selection
    }

    /// `txid` and its ancestors that are not yet in the block.
    fn package_of<'p>(
        &self,
        pool: &'p MempoolView<'_>,
        selection: &Selection,
        txid: &Hash256,
    ) -> Option<Vec<&'p MempoolEntry>> {
        let mut ids = pool.ancestors(txid);
        ids.insert(*txid);
        ids.into_iter()
            .filter(|id| !selection.in_block.contains(id))
            .map(|id| pool.get(&id))
            .collect()
    }
}

/// Locktime and sequence-lock finality for every member of a package.
///
/// Inputs created in the pool, or missing altogether, count as confirmed
/// at `height`; a missing input is reported by the template check.
fn package_is_final(
    view: &ChainView<'_>,
    pool: &MempoolView<'_>,
    package: &[&MempoolEntry],
    height: u32,
    lock_time_cutoff: i64,
) -> bool {
    package.iter().all(|entry| {
        let tx = &entry.tx;
        if !is_final_tx(tx, height, lock_time_cutoff) {
            return false;
        }
        let prev_heights: Vec<u32> = tx
            .inputs
            .iter()
            .map(|input| {
                if pool.get(&input.prevout.txid).is_some() {
                    return height;
                }
                view.coins()
                    .get_coin(&input.prevout)
                    .map_or(height, |coin| coin.height)
            })
            .collect();
        let locks = calculate_sequence_locks(tx, &prev_heights, |h| view.median_time_past_at(h));
        evaluate_sequence_locks(height, lock_time_cutoff, &locks)
    })
}
