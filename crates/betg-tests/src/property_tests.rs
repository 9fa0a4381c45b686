//! Property-based tests over random transaction graphs.
//!
//! Graphs spend outputs of the shared funded chain, so the templates built
//! here pass the full block validity check.

use crate::generators::{arb_tx_graph, build_graph, GraphTx};
use crate::harness::{op_true, FUNDED_CHAIN};
use betg_consensus::params::MAX_BLOCK_WEIGHT;
use betg_consensus::Amount;
use betg_mempool::{compare_feerate, Mempool, MempoolView, NewEntry};
use betg_mining::{AssemblerOptions, BlockAssembler, BlockTemplate, MiningResult};
use betg_pow::Hash256;
use proptest::prelude::*;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A transaction with its in-pool ancestors that are not yet `selected`.
struct Package {
    fees: Amount,
    size: u64,
    members: HashSet<Hash256>,
}

fn package_of(view: &MempoolView<'_>, txid: &Hash256, selected: &HashSet<Hash256>) -> Package {
    let mut members: HashSet<Hash256> = view
        .ancestors(txid)
        .into_iter()
        .filter(|ancestor| !selected.contains(ancestor))
        .collect();
    members.insert(*txid);
    let (fees, size) = members
        .iter()
        .filter_map(|member| view.get(member))
        .fold((0, 0), |(fees, size), entry| (fees + entry.modified_fee(), size + entry.vsize));
    Package {
        fees,
        size,
        members,
    }
}

fn build_template(pool: &Arc<Mempool>) -> MiningResult<BlockTemplate> {
    let (chain, _) = &*FUNDED_CHAIN;
    let assembler =
        BlockAssembler::new(Arc::clone(chain), Arc::clone(pool), AssemblerOptions::default());
    assembler.create_new_block(&op_true())
}

fn fill_pool(graph: &[GraphTx]) -> Arc<Mempool> {
    let (chain, funding) = &*FUNDED_CHAIN;
    let pool = Arc::new(Mempool::default());
    let time = chain.adjusted_time();
    for (tx, _) in build_graph(graph, funding) {
        // Low-fee and orphaned transactions are simply refused.
        let _ = pool.accept_transaction(chain, tx, time);
    }
    pool
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_template_is_valid_and_topological(graph in arb_tx_graph(24)) {
        let pool = fill_pool(&graph);
        prop_assert!(pool.check_consistency().is_ok());

        let template = build_template(&pool);
        prop_assert!(template.is_ok(), "template rejected: {:?}", template.as_ref().err());
        let template = template.unwrap();
        prop_assert!(template.weight <= MAX_BLOCK_WEIGHT);

        let mut seen: HashSet<Hash256> = HashSet::new();
        let mut fees: Amount = 0;
        for (tx, fee) in template.block.transactions[1..].iter().zip(&template.fees[1..]) {
            let entry = pool.get(&tx.txid());
            prop_assert!(entry.is_some());
            let entry = entry.unwrap();
            prop_assert_eq!(*fee, entry.fee);
            for parent in &entry.parents {
                prop_assert!(seen.contains(parent), "parent after child");
            }
            fees += entry.fee;
            seen.insert(tx.txid());
        }
        prop_assert_eq!(template.total_fees(), fees);
        prop_assert_eq!(template.fees[0], -fees);
    }

    #[test]
    fn prop_packages_selected_by_feerate(graph in arb_tx_graph(24)) {
        let pool = fill_pool(&graph);
        let template = build_template(&pool);
        prop_assert!(template.is_ok(), "template rejected: {:?}", template.as_ref().err());
        let order: Vec<Hash256> = template.unwrap().block.transactions[1..]
            .iter()
            .map(|tx| tx.txid())
            .collect();

        // Each transaction belongs to a package that paid at least as much
        // per byte as any package still left in the block at that point.
        let view = pool.read();
        let mut selected: HashSet<Hash256> = HashSet::new();
        for (i, txid) in order.iter().enumerate() {
            let packages: Vec<Package> = order[i..]
                .iter()
                .map(|candidate| package_of(&view, candidate, &selected))
                .collect();
            let best = packages
                .iter()
                .max_by(|a, b| compare_feerate(a.fees, a.size, b.fees, b.size))
                .unwrap();
            let carried = packages.iter().any(|package| {
                package.members.contains(txid)
                    && compare_feerate(package.fees, package.size, best.fees, best.size)
                        == Ordering::Equal
            });
            prop_assert!(carried, "{} selected below the best remaining package", txid);
            selected.insert(*txid);
        }
    }

    #[test]
    fn prop_insertion_order_does_not_change_aggregates(graph in arb_tx_graph(16)) {
        let (_, funding) = &*FUNDED_CHAIN;
        let txs = build_graph(&graph, funding);

        let forward = Mempool::default();
        for (tx, fee) in &txs {
            forward.add_unchecked(NewEntry::new(tx.clone(), *fee)).unwrap();
        }
        // Children first, as when a disconnected block returns its parents.
        let reverse = Mempool::default();
        for (tx, fee) in txs.iter().rev() {
            reverse.add_unchecked(NewEntry::new(tx.clone(), *fee)).unwrap();
        }
        prop_assert!(reverse.check_consistency().is_ok());

        let summary = |pool: &Mempool| -> HashMap<Hash256, (u64, Amount, u64, Amount)> {
            pool.txids()
                .into_iter()
                .filter_map(|txid| pool.get(&txid))
                .map(|e| {
                    let aggregates =
                        (e.ancestor_count, e.ancestor_fees, e.descendant_count, e.descendant_fees);
                    (e.txid, aggregates)
                })
                .collect()
        };
        prop_assert_eq!(summary(&forward), summary(&reverse));
    }
}
