//! Mempool admission tests on a live regtest chain.

use crate::generators::{spend, spend_replaceable, SpendableOutput};
use crate::harness::{Recorded, Recorder, TestNode};
use betg_consensus::params::COIN;
use betg_consensus::OutPoint;
use betg_mempool::{MempoolError, RemovalReason};
use betg_node::Node;
use betg_pow::Hash256;
use std::sync::Arc;

fn reason(node: &TestNode, tx: betg_consensus::Transaction) -> String {
    node.node.accept_transaction(tx).unwrap_err().reason().to_string()
}

// ============================================================================
// Admission Tests
// ============================================================================

#[test]
fn test_admission_reasons() {
    let node = TestNode::new();
    let coins = node.mature_coins(2);

    let tx = spend(&[coins[0]], 1, 1_000);
    let accepted = node.node.accept_transaction(tx.clone()).unwrap();
    assert_eq!(accepted.fee, 1_000);
    assert_eq!(accepted.vsize, tx.vsize());
    assert_eq!(reason(&node, tx), "txn-already-in-mempool");

    // Not signalling replacement.
    assert_eq!(reason(&node, spend(&[coins[0]], 2, 50_000)), "txn-mempool-conflict");

    let ghost = SpendableOutput {
        outpoint: OutPoint::new(Hash256::new([9; 32]), 1),
        value: COIN,
    };
    assert_eq!(reason(&node, spend(&[ghost], 1, 1_000)), "bad-txns-inputs-missingorspent");

    assert_eq!(reason(&node, spend(&[coins[1]], 1, 10)), "min relay fee not met");

    // The newest coinbase is 100 blocks short of maturity.
    let tip = node.mine_blocks(1).remove(0);
    assert_eq!(
        reason(&node, spend(&[SpendableOutput::coinbase_of(&tip)], 1, 1_000)),
        "bad-txns-premature-spend-of-coinbase"
    );
}

#[test]
fn test_rejected_transaction_is_remembered_until_tip_moves() {
    let node = TestNode::new();
    let coins = node.mature_coins(1);
    let cheap = spend(&[coins[0]], 1, 10);

    assert_eq!(reason(&node, cheap.clone()), "min relay fee not met");
    assert!(matches!(
        node.node.accept_transaction(cheap.clone()),
        Err(MempoolError::RecentlyRejected(_))
    ));

    node.mine_blocks(1);
    assert_eq!(reason(&node, cheap), "min relay fee not met");
}

#[test]
fn test_ancestor_chain_limit() {
    let node = TestNode::new();
    let coins = node.mature_coins(1);
    let limit = node.node.mempool().config().ancestor_limit as usize;

    let mut prev = coins[0];
    for _ in 0..limit {
        let tx = spend(&[prev], 1, 1_000);
        node.node.accept_transaction(tx.clone()).unwrap();
        prev = SpendableOutput::of(&tx, 0);
    }
    assert_eq!(reason(&node, spend(&[prev], 1, 1_000)), "too-long-mempool-chain");
    node.node.mempool().check_consistency().unwrap();
}

// ============================================================================
// Replacement Tests
// ============================================================================

#[test]
fn test_replacement_evicts_conflict_and_descendants() {
    let node = TestNode::new();
    let recorder = Arc::new(Recorder::default());
    node.node.register(recorder.clone());
    let coins = node.mature_coins(1);
    recorder.take();

    let original = spend_replaceable(&[coins[0]], 1, 1_000);
    node.node.accept_transaction(original.clone()).unwrap();
    let child = spend(&[SpendableOutput::of(&original, 0)], 1, 1_000);
    node.node.accept_transaction(child.clone()).unwrap();

    let replacement = spend_replaceable(&[coins[0]], 1, 5_000);
    let accepted = node.node.accept_transaction(replacement.clone()).unwrap();
    let mut replaced: Vec<Hash256> = accepted.replaced.iter().map(|r| r.tx.txid()).collect();
    replaced.sort();
    let mut expected = vec![original.txid(), child.txid()];
    expected.sort();
    assert_eq!(replaced, expected);
    assert_eq!(node.node.mempool().len(), 1);

    let events = recorder.take();
    assert_eq!(events.len(), 5);
    assert_eq!(events[0], Recorded::Added(original.txid()));
    assert_eq!(events[1], Recorded::Added(child.txid()));
    assert!(events[2..4]
        .iter()
        .all(|e| matches!(e, Recorded::Removed(_, RemovalReason::Replaced))));
    assert_eq!(events[4], Recorded::Added(replacement.txid()));

    // Same absolute fee over a larger transaction pays a lower rate.
    let underpaying = spend_replaceable(&[coins[0]], 2, 5_000);
    assert_eq!(reason(&node, underpaying), "insufficient fee");
    assert!(node.node.mempool().contains(&replacement.txid()));
}

#[test]
fn test_full_rbf_replaces_without_signal() {
    let node = TestNode::with_config(|config| config.mempool.full_rbf = true);
    let coins = node.mature_coins(1);
    let original = spend(&[coins[0]], 1, 1_000);
    node.node.accept_transaction(original.clone()).unwrap();
    let replacement = spend(&[coins[0]], 1, 4_000);
    node.node.accept_transaction(replacement.clone()).unwrap();
    assert!(!node.node.mempool().contains(&original.txid()));
    assert!(node.node.mempool().contains(&replacement.txid()));
}

// ============================================================================
// Expiry and Persistence Tests
// ============================================================================

#[test]
fn test_expiry_uses_entry_time() {
    let node = TestNode::new();
    let coins = node.mature_coins(2);
    let now = node.chain().adjusted_time();
    let expiry = node.node.mempool().config().expiry_secs;

    node.chain().set_mock_time(now);
    let old = spend(&[coins[0]], 1, 1_000);
    node.node.accept_transaction(old.clone()).unwrap();
    node.chain().set_mock_time(now + expiry / 2);
    let young = spend(&[coins[1]], 1, 1_000);
    node.node.accept_transaction(young.clone()).unwrap();

    node.chain().set_mock_time(now + expiry + 1);
    assert_eq!(node.node.expire_mempool(), 1);
    assert!(!node.node.mempool().contains(&old.txid()));
    assert!(node.node.mempool().contains(&young.txid()));
    node.chain().set_mock_time(0);
}

#[test]
fn test_mempool_survives_restart() {
    let node = TestNode::with_config(|config| config.mempool.persist = true);
    let coins = node.mature_coins(2);
    let first = spend(&[coins[0]], 1, 1_000);
    let second = spend(&[coins[1]], 1, 2_000);
    node.node.accept_transaction(first.clone()).unwrap();
    node.node.accept_transaction(second.clone()).unwrap();
    node.node.mempool().prioritise_transaction(&first.txid(), 500);
    node.node.shutdown();

    // Spend one input on chain while the node is "down".
    let rival = spend(&[coins[1]], 2, 1_000);
    node.mine_block(vec![rival]);

    let restarted =
        Node::with_chain(node.node.config().clone(), Arc::clone(node.chain())).unwrap();
    let pool = restarted.mempool();
    assert_eq!(pool.len(), 1);
    assert!(pool.contains(&first.txid()));
    assert_eq!(pool.get(&first.txid()).unwrap().modified_fee(), 1_500);
}
