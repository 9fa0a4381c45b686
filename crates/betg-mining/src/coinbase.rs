//! Coinbase transaction creation.
//!
//! The coinbase is the first transaction of every block. Its scriptSig
//! starts with the block height as a minimal script number push, followed
//! by an extra nonce that miners may roll to get a fresh merkle root.

use betg_consensus::{
    block_merkle_root, opcodes, Amount, Block, OutPoint, Script, Transaction, TxIn, TxOut,
};
use tracing::trace;

/// Builds the coinbase for a block at a given height.
#[derive(Debug, Clone)]
pub struct CoinbaseBuilder {
    height: u32,
    script_pubkey: Script,
    value: Amount,
    extra_nonce: u64,
}

impl CoinbaseBuilder {
    pub fn new(height: u32, script_pubkey: Script) -> Self {
        Self {
            height,
            script_pubkey,
            value: 0,
            extra_nonce: 0,
        }
    }

    /// Subsidy plus collected fees.
    pub fn value(mut self, value: Amount) -> Self {
        self.value = value;
        self
    }

    pub fn extra_nonce(mut self, extra_nonce: u64) -> Self {
        self.extra_nonce = extra_nonce;
        self
    }

    pub fn build(&self) -> Transaction {
        Transaction {
            version: 2,
            inputs: vec![TxIn::new(
                OutPoint::NULL,
                coinbase_script_sig(self.height, self.extra_nonce),
            )],
            outputs: vec![TxOut::new(self.value, self.script_pubkey.clone())],
            lock_time: 0,
        }
    }
}

/// Height push followed by the extra nonce.
pub fn coinbase_script_sig(height: u32, extra_nonce: u64) -> Script {
    let script = Script::new().push_int(i64::from(height));
    if extra_nonce == 0 {
        script.push_opcode(opcodes::OP_0)
    } else {
        script.push_num(extra_nonce as i64)
    }
}

/// Replace the extra nonce of `block`'s coinbase and refresh its merkle root.
///
/// Returns false when the block has no coinbase.
pub fn set_extra_nonce(block: &mut Block, extra_nonce: u64) -> bool {
    let height = block.header.height;
    let Some(coinbase) = block.transactions.first_mut() else {
        return false;
    };
    if !coinbase.is_coinbase() {
        return false;
    }
    coinbase.inputs[0].script_sig = coinbase_script_sig(height, extra_nonce);
    block.header.merkle_root = block_merkle_root(block).0;
    trace!(height, extra_nonce, merkle_root = %block.header.merkle_root, "Extra nonce updated");
    true
}
