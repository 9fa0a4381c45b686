//! Test harness for integration tests.
//!
//! Provides regtest chainstates that share one epoch cache, a block builder
//! that seals headers with a light KawPow search, and a [`TestNode`] wrapper
//! with helpers for funding and mining.

use crate::generators::SpendableOutput;
use betg_chain::{ChainSelection, Chainstate, MemoryBlockStore};
use betg_consensus::params::COINBASE_MATURITY;
use betg_consensus::{
    block_merkle_root, decode_compact, get_block_subsidy, opcodes, target_to_hash,
    AcceptAllVerifier, Block, BlockHeader, ChainParams, Network, OutPoint, Script, Transaction,
    TxIn, TxOut,
};
use betg_mempool::RemovalReason;
use betg_node::{Node, NodeConfig, ValidationInterface};
use betg_pow::{EpochContextCache, Hash256};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::TempDir;

/// Epoch contexts shared by every test chain. Building one is the slowest
/// step of a test run.
pub static EPOCHS: Lazy<Arc<EpochContextCache>> = Lazy::new(|| Arc::new(EpochContextCache::new()));

/// Regtest chain with funded outputs, built once and shared read-only.
pub static FUNDED_CHAIN: Lazy<(Arc<Chainstate>, Vec<SpendableOutput>)> = Lazy::new(|| {
    let chain = regtest_chainstate();
    let coins = fund_chain(&chain, 12);
    (chain, coins)
});

/// Output script anyone can spend.
pub fn op_true() -> Script {
    Script::new().push_opcode(opcodes::OP_1)
}

/// Fresh regtest chainstate holding only genesis.
pub fn regtest_chainstate() -> Arc<Chainstate> {
    let chain = Chainstate::new(
        Arc::new(ChainParams::regtest()),
        Arc::new(MemoryBlockStore::new()),
        Arc::clone(&EPOCHS),
        Arc::new(AcceptAllVerifier),
    )
    .expect("Failed to create chainstate");
    Arc::new(chain)
}

/// Find a nonce sealing `header` at its own target.
pub fn solve(header: &mut BlockHeader) {
    let context = EPOCHS
        .for_height(header.height)
        .expect("Failed to build epoch context");
    let boundary = target_to_hash(&decode_compact(header.bits).target);
    let solution = betg_pow::search_light(
        &context,
        header.height,
        &header.header_hash(),
        &boundary,
        0,
        100_000,
    )
    .expect("No solution within search range");
    header.nonce = solution.nonce;
    header.mix_hash = solution.mix_hash;
}

/// Coinbase paying `value` to [`op_true`]. `tag` makes sibling coinbases
/// distinct.
pub fn coinbase_tx(height: u32, value: i64, tag: i64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn::new(
            OutPoint::NULL,
            Script::new().push_int(i64::from(height)).push_int(tag),
        )],
        outputs: vec![TxOut::new(value, op_true())],
        lock_time: 0,
    }
}

/// Sealed block on `parent` claiming the plain subsidy.
pub fn build_block(parent: &BlockHeader, mut txs: Vec<Transaction>, tag: i64) -> Block {
    let height = parent.height + 1;
    let subsidy = get_block_subsidy(height, &ChainParams::regtest());
    txs.insert(0, coinbase_tx(height, subsidy, tag));
    let mut block = Block::new(
        BlockHeader {
            version: 4,
            prev_hash: parent.hash(),
            merkle_root: Hash256::ZERO,
            time: parent.time + 60,
            bits: 0x207fffff,
            nonce: 0,
            height,
            mix_hash: Hash256::ZERO,
        },
        txs,
    );
    block.header.merkle_root = block_merkle_root(&block).0;
    solve(&mut block.header);
    block
}

/// Header of the active tip.
pub fn tip_header(chain: &Chainstate) -> BlockHeader {
    let tip = chain.tip().hash;
    chain
        .get_block(&tip)
        .expect("Block store failed")
        .expect("Tip block missing")
        .header
        .clone()
}

/// Mine `count` funding blocks followed by enough blocks to mature them.
pub fn fund_chain(chain: &Chainstate, count: usize) -> Vec<SpendableOutput> {
    let mut coins = Vec::with_capacity(count);
    for i in 0..count + COINBASE_MATURITY as usize {
        let block = build_block(&tip_header(chain), Vec::new(), 0);
        if i < count {
            coins.push(SpendableOutput::coinbase_of(&block));
        }
        chain.process_block(block).expect("Funding block rejected");
    }
    coins
}

/// A node on a private regtest chain.
pub struct TestNode {
    pub node: Arc<Node>,
    _temp_dir: TempDir,
}

impl TestNode {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Node with persistence off and `adjust` applied to the config.
    pub fn with_config(adjust: impl FnOnce(&mut NodeConfig)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let mut config = NodeConfig::default_for_network(Network::Regtest);
        config.data_dir = temp_dir.path().to_path_buf();
        config.mempool.persist = false;
        adjust(&mut config);
        let node = Node::with_chain(config, regtest_chainstate()).expect("Failed to create node");
        Self {
            node,
            _temp_dir: temp_dir,
        }
    }

    pub fn chain(&self) -> &Arc<Chainstate> {
        self.node.chain()
    }

    pub fn tip_header(&self) -> BlockHeader {
        tip_header(self.chain())
    }

    /// Build a block with `txs` on the tip and submit it.
    pub fn mine_block(&self, txs: Vec<Transaction>) -> Block {
        let block = build_block(&self.tip_header(), txs, 0);
        let selection = self
            .node
            .submit_block(block.clone())
            .expect("Block rejected");
        assert_eq!(selection, ChainSelection::Extended);
        block
    }

    pub fn mine_blocks(&self, count: usize) -> Vec<Block> {
        (0..count).map(|_| self.mine_block(Vec::new())).collect()
    }

    /// Seal the node's own template and submit it.
    pub fn mine_template(&self) -> Block {
        let template = self
            .node
            .create_new_block(&op_true())
            .expect("Template creation failed");
        let mut block = template.block;
        solve(&mut block.header);
        self.node
            .submit_block(block.clone())
            .expect("Template block rejected");
        block
    }

    /// `count` spendable coinbase outputs.
    pub fn mature_coins(&self, count: usize) -> Vec<SpendableOutput> {
        let funding = self.mine_blocks(count);
        self.mine_blocks(COINBASE_MATURITY as usize);
        funding.iter().map(SpendableOutput::coinbase_of).collect()
    }
}

impl Default for TestNode {
    fn default() -> Self {
        Self::new()
    }
}

/// An event seen by [`Recorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Tip { height: u32, fork_height: Option<u32> },
    Connected(Hash256),
    Disconnected(Hash256),
    Added(Hash256),
    Removed(Hash256, RemovalReason),
}

/// Listener that keeps every notification.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Recorded>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<Recorded> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl ValidationInterface for Recorder {
    fn on_updated_block_tip(&self, tip: &betg_chain::TipInfo, fork_height: Option<u32>) {
        self.events.lock().push(Recorded::Tip {
            height: tip.height,
            fork_height,
        });
    }

    fn on_block_connected(&self, block: &Arc<Block>) {
        self.events.lock().push(Recorded::Connected(block.hash()));
    }

    fn on_block_disconnected(&self, block: &Arc<Block>) {
        self.events.lock().push(Recorded::Disconnected(block.hash()));
    }

    fn on_transaction_added_to_mempool(&self, tx: &Arc<Transaction>) {
        self.events.lock().push(Recorded::Added(tx.txid()));
    }

    fn on_transaction_removed_from_mempool(&self, tx: &Arc<Transaction>, reason: RemovalReason) {
        self.events.lock().push(Recorded::Removed(tx.txid(), reason));
    }
}
