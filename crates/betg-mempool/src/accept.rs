//! Admission of transactions against the active chain.

use crate::entry::NewEntry;
use crate::ordering::compare_feerate;
use crate::pool::{Mempool, MempoolConfig, PoolInner, RemovalReason, RemovedTx};
use crate::{MempoolError, MempoolResult};
use betg_chain::{ChainView, Chainstate};
use betg_consensus::params::{COINBASE_MATURITY, MAX_BLOCK_SIGOPS_COST};
use betg_consensus::validation::{
    check_transaction, check_tx_inputs, flags, transaction_sigop_cost,
};
use betg_consensus::{
    calculate_sequence_locks, evaluate_sequence_locks, is_final_tx, Amount, Coin, CoinsView,
    ConsensusError, InputVerifier, MemoryCoins, OutPoint, Transaction,
};
use betg_pow::Hash256;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Height reported for coins created by pool transactions.
pub const MEMPOOL_HEIGHT: u32 = 0x7fff_ffff;

/// Sigop cost limit for a single relayed transaction.
pub const MAX_STANDARD_TX_SIGOPS_COST: u64 = MAX_BLOCK_SIGOPS_COST / 5;

/// Outcome of a successful admission.
#[derive(Debug, Clone)]
pub struct AcceptedTx {
    pub txid: Hash256,
    pub fee: Amount,
    pub vsize: u64,
    /// Entries evicted by replacement.
    pub replaced: Vec<RemovedTx>,
    /// Entries evicted by the size limit.
    pub evicted: Vec<RemovedTx>,
}

/// Confirmed coins plus outputs of pool transactions.
struct PoolCoins<'a> {
    chain: &'a MemoryCoins,
    pool: &'a PoolInner,
}

impl CoinsView for PoolCoins<'_> {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        if let Some(coin) = self.chain.get_coin(outpoint) {
            return Some(coin);
        }
        self.pool
            .entries
            .get(&outpoint.txid)
            .and_then(|entry| entry.tx.outputs.get(outpoint.vout as usize))
            .map(|output| Coin::new(output.clone(), MEMPOOL_HEIGHT, false))
    }

    fn best_block(&self) -> Hash256 {
        self.chain.best_block()
    }
}

impl PoolInner {
    /// Replacement rules for a transaction evicting `evict`, whose direct
    /// conflicts are `conflicts`.
    pub(crate) fn check_replacement(
        &self,
        config: &MempoolConfig,
        txid: &Hash256,
        vsize: u64,
        modified_fee: Amount,
        conflicts: &HashSet<Hash256>,
        evict: &HashSet<Hash256>,
    ) -> MempoolResult<()> {
        if evict.len() > config.max_replacement_evictions {
            return Err(MempoolError::InsufficientFee {
                reason: "too many potential replacements",
                detail: format!(
                    "rejecting replacement {txid}; too many potential replacements ({} > {})",
                    evict.len(),
                    config.max_replacement_evictions
                ),
            });
        }
        for conflict in conflicts.iter().filter_map(|id| self.entries.get(id)) {
            if compare_feerate(modified_fee, vsize, conflict.modified_fee(), conflict.vsize)
                != Ordering::Greater
            {
                return Err(MempoolError::InsufficientFee {
                    reason: "insufficient fee",
                    detail: format!(
                        "rejecting replacement {txid}; new feerate {} <= old feerate {}",
                        crate::FeeRate::from_fee(modified_fee, vsize),
                        conflict.feerate()
                    ),
                });
            }
        }
        let evicted_fees: Amount = evict
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|entry| entry.modified_fee())
            .sum();
        if modified_fee <= evicted_fees {
            return Err(MempoolError::InsufficientFee {
                reason: "insufficient fee",
                detail: format!(
                    "rejecting replacement {txid}, less fees than conflicting txs; \
                     {modified_fee} <= {evicted_fees}"
                ),
            });
        }
        let required = config.incremental_relay_fee.fee(vsize);
        if modified_fee - evicted_fees < required {
            return Err(MempoolError::InsufficientFee {
                reason: "insufficient fee",
                detail: format!(
                    "rejecting replacement {txid}, not enough additional fees to relay; \
                     {} < {required}",
                    modified_fee - evicted_fees
                ),
            });
        }
        Ok(())
    }
}

impl Mempool {
    /// Validate `tx` against the active chain and the pool, then insert it.
    ///
    /// Takes the chain read lock before the pool write lock.
    #[instrument(skip(self, chain, tx), fields(txid = %tx.txid()))]
    pub fn accept_transaction(
        &self,
        chain: &Chainstate,
        tx: Transaction,
        time: i64,
    ) -> MempoolResult<AcceptedTx> {
        let verifier = chain.verifier().clone();
        let view = chain.view();
        self.accept_with_view(&view, tx, verifier.as_ref(), time)
    }

    /// Admission against an already held chain view.
    pub fn accept_with_view(
        &self,
        view: &ChainView<'_>,
        tx: Transaction,
        verifier: &dyn InputVerifier,
        time: i64,
    ) -> MempoolResult<AcceptedTx> {
        let txid = tx.txid();
        check_transaction(&tx)?;
        if tx.is_coinbase() {
            return Err(MempoolError::Coinbase(txid));
        }

        let tip = view.tip();
        let height = tip.height + 1;
        if !is_final_tx(&tx, height, tip.median_time_past) {
            return Err(MempoolError::NonFinal { reason: "non-final" });
        }

        let mut inner = self.inner.write();
        if inner.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyExists(txid));
        }

        let conflicts = inner.conflicts_of(&tx);
        if !self.config().full_rbf {
            for input in &tx.inputs {
                let Some(spender) = inner.spenders.get(&input.prevout) else {
                    continue;
                };
                let replaceable = inner
                    .entries
                    .get(spender)
                    .map(|entry| entry.signals_replacement())
                    .unwrap_or(false);
                if !replaceable {
                    return Err(MempoolError::Conflict {
                        outpoint: input.prevout,
                        spender: *spender,
                    });
                }
            }
        }

        let (fee, spent, sigop_cost) = {
            let coins = PoolCoins {
                chain: view.coins(),
                pool: &inner,
            };
            let mut spent = Vec::with_capacity(tx.inputs.len());
            for input in &tx.inputs {
                match coins.get_coin(&input.prevout) {
                    Some(coin) => spent.push(coin),
                    None => return Err(MempoolError::MissingInputs(input.prevout)),
                }
            }
            let fee = check_tx_inputs(&tx, &coins, height)?;
            (fee, spent, transaction_sigop_cost(&tx, &coins))
        };

        let prev_heights: Vec<u32> = spent
            .iter()
            .map(|coin| if coin.height == MEMPOOL_HEIGHT { height } else { coin.height })
            .collect();
        let locks = calculate_sequence_locks(&tx, &prev_heights, |h| view.median_time_past_at(h));
        if !evaluate_sequence_locks(height, tip.median_time_past, &locks) {
            return Err(MempoolError::NonFinal {
                reason: "non-BIP68-final",
            });
        }

        if sigop_cost > MAX_STANDARD_TX_SIGOPS_COST {
            return Err(ConsensusError::tx(
                "bad-txns-too-many-sigops",
                format!("{sigop_cost} > {MAX_STANDARD_TX_SIGOPS_COST}"),
            )
            .into());
        }

        let vsize = tx.vsize();
        let modified_fee = fee.saturating_add(inner.deltas.get(&txid).copied().unwrap_or(0));
        let min_fee = self.config().min_relay_fee.fee(vsize);
        if modified_fee < min_fee {
            return Err(MempoolError::InsufficientFee {
                reason: "min relay fee not met",
                detail: format!("{modified_fee} < {min_fee}"),
            });
        }

        verifier.verify_inputs(&tx, &spent, flags::BLOCK_SCRIPT_VERIFY_FLAGS)?;

        let parents = inner.parents_of(&tx);
        let ancestors = inner.ancestors_from_parents(&parents);
        let evict = inner.with_descendants(conflicts.iter().copied());
        if let Some(ancestor) = ancestors.iter().find(|id| evict.contains(*id)) {
            return Err(MempoolError::Conflict {
                outpoint: tx.inputs[0].prevout,
                spender: *ancestor,
            });
        }
        if !conflicts.is_empty() {
            inner.check_replacement(self.config(), &txid, vsize, modified_fee, &conflicts, &evict)?;
        }
        inner.check_package_limits(&ancestors, vsize, self.config())?;

        let replaced = if evict.is_empty() {
            Vec::new()
        } else {
            inner.remove_set(&evict, RemovalReason::Replaced)
        };
        let spends_coinbase = spent.iter().any(|coin| coin.is_coinbase);
        inner.insert(
            NewEntry {
                tx: Arc::new(tx),
                fee,
                time,
                entry_height: tip.height,
                spends_coinbase,
                sigop_cost,
            },
            None,
        );

        let evicted = inner.trim(self.config().max_size);
        if !inner.entries.contains_key(&txid) {
            return Err(MempoolError::Full);
        }

        info!(
            %txid,
            fee,
            vsize,
            replaced = replaced.len(),
            pool_size = inner.entries.len(),
            "Accepted transaction"
        );
        Ok(AcceptedTx {
            txid,
            fee,
            vsize,
            replaced,
            evicted,
        })
    }

    /// Drop entries invalidated by a reorganization: missing inputs,
    /// immature coinbase spends, and transactions no longer final.
    pub fn remove_for_reorg(&self, chain: &Chainstate) -> Vec<RemovedTx> {
        let view = chain.view();
        let mut inner = self.inner.write();
        let tip = view.tip();
        let height = tip.height + 1;

        let invalid: Vec<Hash256> = {
            let coins = PoolCoins {
                chain: view.coins(),
                pool: &inner,
            };
            inner
                .entries
                .values()
                .filter(|entry| {
                    let tx = &entry.tx;
                    if !is_final_tx(tx, height, tip.median_time_past) {
                        return true;
                    }
                    let mut prev_heights = Vec::with_capacity(tx.inputs.len());
                    for input in &tx.inputs {
                        let Some(coin) = coins.get_coin(&input.prevout) else {
                            return true;
                        };
                        if coin.is_coinbase && height - coin.height < COINBASE_MATURITY {
                            return true;
                        }
                        prev_heights.push(if coin.height == MEMPOOL_HEIGHT {
                            height
                        } else {
                            coin.height
                        });
                    }
                    let locks = calculate_sequence_locks(tx, &prev_heights, |h| {
                        view.median_time_past_at(h)
                    });
                    !evaluate_sequence_locks(height, tip.median_time_past, &locks)
                })
                .map(|entry| entry.txid)
                .collect()
        };
        if invalid.is_empty() {
            return Vec::new();
        }
        let set = inner.with_descendants(invalid);
        let removed = inner.remove_set(&set, RemovalReason::Reorg);
        debug!(removed = removed.len(), "Removed transactions invalidated by reorg");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::tests::{confirmed, spend};
    use crate::MempoolConfig;
    use betg_consensus::params::COIN;
    use betg_consensus::ChainParams;

    fn chainstate() -> Chainstate {
        Chainstate::in_memory(Arc::new(ChainParams::regtest())).unwrap()
    }

    // ============ Admission Tests ============

    #[test]
    fn test_rejects_coinbase() {
        let chain = chainstate();
        let pool = Mempool::default();
        let coinbase = chain.params().genesis.transactions[0].clone();
        let err = pool.accept_transaction(&chain, coinbase, 0).unwrap_err();
        assert_eq!(err.reason(), "coinbase");
    }

    #[test]
    fn test_rejects_missing_inputs() {
        let chain = chainstate();
        let pool = Mempool::default();
        let tx = spend(&[confirmed(7)], 1, 1);
        let err = pool.accept_transaction(&chain, tx, 0).unwrap_err();
        assert!(matches!(err, MempoolError::MissingInputs(outpoint) if outpoint == confirmed(7)));
        assert_eq!(err.reason(), "bad-txns-inputs-missingorspent");
        assert!(pool.is_empty());
    }

    #[test]
    fn test_rejects_structurally_invalid() {
        let chain = chainstate();
        let pool = Mempool::default();
        let mut tx = spend(&[confirmed(1), confirmed(1)], 1, 1);
        let err = pool.accept_transaction(&chain, tx.clone(), 0).unwrap_err();
        assert_eq!(err.reason(), "bad-txns-inputs-duplicate");

        tx.inputs.clear();
        let err = pool.accept_transaction(&chain, tx, 0).unwrap_err();
        assert_eq!(err.reason(), "bad-txns-vin-empty");
    }

    #[test]
    fn test_rejects_non_final() {
        let chain = chainstate();
        let pool = Mempool::default();
        let mut tx = spend(&[confirmed(1)], 1, 1);
        tx.lock_time = 1_000;
        tx.inputs[0].sequence = 0;
        let err = pool.accept_transaction(&chain, tx, 0).unwrap_err();
        assert_eq!(err.reason(), "non-final");
    }

    // ============ Replacement Tests ============

    fn pool_with_original(fee: Amount) -> (Mempool, Transaction) {
        let pool = Mempool::new(MempoolConfig {
            max_replacement_evictions: 2,
            ..MempoolConfig::default()
        });
        let original = spend(&[confirmed(1)], 1, 1);
        pool.add_unchecked(NewEntry::new(original.clone(), fee)).unwrap();
        (pool, original)
    }

    fn replacement_check(pool: &Mempool, tx: &Transaction, fee: Amount) -> MempoolResult<()> {
        let inner = pool.inner.read();
        let conflicts = inner.conflicts_of(tx);
        let evict = inner.with_descendants(conflicts.iter().copied());
        inner.check_replacement(pool.config(), &tx.txid(), tx.vsize(), fee, &conflicts, &evict)
    }

    #[test]
    fn test_replacement_needs_higher_feerate() {
        let (pool, _) = pool_with_original(10_000);
        let replacement = spend(&[confirmed(1)], 1, 2);
        let err = replacement_check(&pool, &replacement, 10_000).unwrap_err();
        assert_eq!(err.reason(), "insufficient fee");
        assert!(err.to_string().contains("new feerate"));
    }

    #[test]
    fn test_replacement_pays_for_descendants_and_relay() {
        let (pool, original) = pool_with_original(1_000);
        let child = spend(&[OutPoint::new(original.txid(), 0)], 1, 3);
        pool.add_unchecked(NewEntry::new(child, 50_000)).unwrap();

        // Beats the direct conflict's feerate but not the package's fees.
        let replacement = spend(&[confirmed(1)], 1, 2);
        let err = replacement_check(&pool, &replacement, 20_000).unwrap_err();
        assert!(err.to_string().contains("less fees than conflicting"));

        // Covers the evicted fees but not the incremental relay fee.
        let err = replacement_check(&pool, &replacement, 51_001).unwrap_err();
        assert!(err.to_string().contains("not enough additional fees"));

        let enough = 51_000 + replacement.vsize() as Amount;
        assert!(replacement_check(&pool, &replacement, enough).is_ok());
    }

    #[test]
    fn test_replacement_eviction_cap() {
        let (pool, original) = pool_with_original(1_000);
        let child = spend(&[OutPoint::new(original.txid(), 0)], 1, 3);
        let grandchild = spend(&[OutPoint::new(child.txid(), 0)], 1, 4);
        pool.add_unchecked(NewEntry::new(child, 1_000)).unwrap();
        pool.add_unchecked(NewEntry::new(grandchild, 1_000)).unwrap();

        let replacement = spend(&[confirmed(1)], 1, 2);
        let err = replacement_check(&pool, &replacement, 100 * COIN).unwrap_err();
        assert_eq!(err.reason(), "too many potential replacements");
    }
}
