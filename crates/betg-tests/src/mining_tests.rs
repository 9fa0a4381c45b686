//! Block template tests against a mined regtest chain.

use crate::generators::{spend, spend_to_multisig_ops, SpendableOutput};
use crate::harness::{coinbase_tx, op_true, solve, TestNode};
use betg_chain::ChainSelection;
use betg_consensus::params::COIN;
use betg_consensus::{get_block_subsidy, OutPoint};
use betg_mempool::NewEntry;
use betg_mining::{FoundSolution, MiningError, WorkerPool};
use betg_pow::Hash256;

fn template_txids(node: &TestNode) -> Vec<Hash256> {
    let template = node.node.create_new_block(&op_true()).unwrap();
    template.block.transactions[1..]
        .iter()
        .map(|tx| tx.txid())
        .collect()
}

fn template_reason(node: &TestNode) -> String {
    match node.node.create_new_block(&op_true()) {
        Err(MiningError::TemplateInvalid { reason, .. }) => reason,
        other => panic!("expected an invalid template, got {other:?}"),
    }
}

// ============================================================================
// Template Tests
// ============================================================================

#[test]
fn test_template_block_connects() {
    let node = TestNode::new();
    let coins = node.mature_coins(3);
    let fees = [1_000, 2_000, 3_000];
    for (coin, fee) in coins.iter().zip(fees) {
        node.node.accept_transaction(spend(&[*coin], 1, fee)).unwrap();
    }
    assert_eq!(node.node.mempool().len(), 3);

    let height = node.chain().height() + 1;
    let template = node.node.create_new_block(&op_true()).unwrap();
    assert_eq!(template.height, height);
    assert_eq!(template.tx_count(), 4);
    assert_eq!(template.total_fees(), 6_000);
    assert_eq!(template.fees[0], -6_000);
    let subsidy = get_block_subsidy(height, node.chain().params());
    assert_eq!(template.coinbase_value, subsidy + 6_000);
    assert_eq!(template.block.transactions[0].outputs[0].value, subsidy + 6_000);

    let mut block = template.block;
    solve(&mut block.header);
    let selection = node.node.submit_block(block).unwrap();
    assert_eq!(selection, ChainSelection::Extended);
    assert_eq!(node.chain().height(), height);
    assert!(node.node.mempool().is_empty());
}

#[test]
fn test_prioritised_package_order() {
    let node = TestNode::new();
    let coins = node.mature_coins(4);
    let pool = node.node.mempool();

    // Free parent lifted far above everything else.
    let free_parent = spend(&[coins[0]], 1, 0);
    pool.prioritise_transaction(&free_parent.txid(), 10 * COIN);
    node.node.accept_transaction(free_parent.clone()).unwrap();

    // Its child pays only through a small delta.
    let free_child = spend(&[SpendableOutput::of(&free_parent, 0)], 1, 0);
    pool.prioritise_transaction(&free_child.txid(), 1_000);
    node.node.accept_transaction(free_child.clone()).unwrap();

    let free_prioritised = spend(&[coins[1]], 1, 0);
    pool.prioritise_transaction(&free_prioritised.txid(), 5 * COIN);
    node.node.accept_transaction(free_prioritised.clone()).unwrap();

    // Parent with a real fee, pulled forward by its prioritised child.
    let parent = spend(&[coins[2]], 1, 1_000);
    node.node.accept_transaction(parent.clone()).unwrap();
    let prioritised_child = spend(&[SpendableOutput::of(&parent, 0)], 1, 0);
    pool.prioritise_transaction(&prioritised_child.txid(), COIN);
    node.node.accept_transaction(prioritised_child.clone()).unwrap();

    // A fee-paying transaction pushed below zero by a negative delta.
    let medium = spend(&[coins[3]], 1, 20_000);
    node.node.accept_transaction(medium.clone()).unwrap();
    pool.prioritise_transaction(&medium.txid(), -5 * COIN);

    // The child's delta is not inherited by its own free child.
    let free_grandchild = spend(&[SpendableOutput::of(&free_child, 0)], 1, 0);
    pool.add_unchecked(NewEntry::new(free_grandchild.clone(), 0)).unwrap();

    assert_eq!(
        template_txids(&node),
        vec![
            free_parent.txid(),
            free_prioritised.txid(),
            parent.txid(),
            prioritised_child.txid(),
            free_child.txid(),
        ]
    );

    // Deltas never reach the coinbase.
    let template = node.node.create_new_block(&op_true()).unwrap();
    assert_eq!(template.total_fees(), 1_000);

    node.mine_template();
    let mut left = pool.txids();
    left.sort();
    let mut excluded = vec![medium.txid(), free_grandchild.txid()];
    excluded.sort();
    assert_eq!(left, excluded);
    assert_eq!(pool.fee_delta(&free_parent.txid()), 0);
    assert_eq!(pool.fee_delta(&medium.txid()), -5 * COIN);
}

#[test]
fn test_child_fee_carries_parent_past_richer_single() {
    let node = TestNode::new();
    let coins = node.mature_coins(2);

    let parent = spend(&[coins[0]], 1, 1_000);
    let child = spend(&[SpendableOutput::of(&parent, 0)], 1, 50_000);
    let medium = spend(&[coins[1]], 1, 10_000);
    for tx in [&parent, &child, &medium] {
        node.node.accept_transaction(tx.clone()).unwrap();
    }

    assert_eq!(template_txids(&node), vec![parent.txid(), child.txid(), medium.txid()]);
}

#[test]
fn test_block_min_fee_rate() {
    let node = TestNode::with_config(|config| config.mempool.min_relay_fee = 0);
    let coins = node.mature_coins(2);

    let free = spend(&[coins[0]], 1, 0);
    let cheap = spend(&[coins[1]], 1, 30);
    node.node.accept_transaction(free.clone()).unwrap();
    node.node.accept_transaction(cheap.clone()).unwrap();
    assert_eq!(node.node.mempool().len(), 2);

    // Both sit below the 1000 sat/kvB block floor.
    assert!(template_txids(&node).is_empty());

    node.node.mempool().prioritise_transaction(&free.txid(), 1_000);
    assert_eq!(template_txids(&node), vec![free.txid()]);

    node.node.mempool().prioritise_transaction(&cheap.txid(), 2_000);
    assert_eq!(template_txids(&node), vec![cheap.txid(), free.txid()]);
}

// ============================================================================
// Template Validity Tests
// ============================================================================

#[test]
fn test_undeclared_sigops_invalidate_template() {
    let node = TestNode::new();
    let coins = node.mature_coins(1);
    let pool = node.node.mempool();

    // 1001 CHECKMULTISIG count as 20 sigops each: 80080 cost once scaled.
    let heavy = spend_to_multisig_ops(coins[0], 1001, 10_000);
    let txid = pool
        .add_unchecked(NewEntry::new(heavy.clone(), 10_000).spends_coinbase(true))
        .unwrap();
    assert_eq!(template_reason(&node), "bad-blk-sigops");

    // Declared honestly, the package no longer fits.
    pool.remove_recursive(&txid, betg_mempool::RemovalReason::Manual);
    pool.add_unchecked(
        NewEntry::new(heavy, 10_000)
            .spends_coinbase(true)
            .sigop_cost(80_080),
    )
    .unwrap();
    assert!(template_txids(&node).is_empty());
}

#[test]
fn test_second_coinbase_invalidates_template() {
    let node = TestNode::new();
    node.mine_blocks(2);
    let height = node.chain().height() + 1;
    node.node
        .mempool()
        .add_unchecked(NewEntry::new(coinbase_tx(height, 1, 7), 0).height(height - 1))
        .unwrap();
    node.node.mempool().prioritise_transaction(&coinbase_tx(height, 1, 7).txid(), 1_000);
    assert_eq!(template_reason(&node), "bad-cb-multiple");
}

#[test]
fn test_missing_inputs_invalidate_template() {
    let node = TestNode::new();
    node.mine_blocks(1);
    let ghost = SpendableOutput {
        outpoint: OutPoint::new(Hash256::new([0x42; 32]), 0),
        value: COIN,
    };
    node.node
        .mempool()
        .add_unchecked(NewEntry::new(spend(&[ghost], 1, 5_000), 5_000))
        .unwrap();
    assert_eq!(template_reason(&node), "bad-txns-inputs-missingorspent");
}

#[test]
fn test_confirmed_spend_leaves_pool_before_next_template() {
    let node = TestNode::new();
    let coins = node.mature_coins(1);
    let tx = spend(&[coins[0]], 1, 2_000);
    node.node.accept_transaction(tx.clone()).unwrap();

    // A conflicting spend confirms first.
    let rival = spend(&[coins[0]], 2, 1_000);
    node.mine_block(vec![rival]);
    assert!(!node.node.mempool().contains(&tx.txid()));
    assert!(template_txids(&node).is_empty());
}

// ============================================================================
// Worker Pool Tests
// ============================================================================

#[tokio::test]
async fn test_worker_pool_mines_template() {
    let node = TestNode::with_config(|config| {
        config.mining.enabled = true;
        config.mining.threads = 2;
    });
    let coins = node.mature_coins(1);
    let tx = spend(&[coins[0]], 1, 4_000);
    node.node.accept_transaction(tx.clone()).unwrap();

    let miner = node.node.miner();
    let current = miner.create_template().unwrap();
    let task = miner.mining_task(&current).unwrap();

    let mut pool = WorkerPool::new(2).unwrap();
    pool.broadcast_task(task);
    let found: FoundSolution = pool.recv_solution().await.unwrap();
    pool.clear_task();

    let block = miner.complete_block(&found).unwrap();
    assert_eq!(block.transactions[1].txid(), tx.txid());
    let height = block.header.height;
    node.node.submit_block(block).unwrap();
    assert_eq!(node.chain().height(), height);
    assert!(node.node.mempool().is_empty());
    assert_eq!(miner.stats().valid_solutions, 1);

    // The tip moved, so the old template is gone.
    assert!(miner.current_template().is_none());
    tokio::task::spawn_blocking(move || pool.shutdown()).await.unwrap();
}
