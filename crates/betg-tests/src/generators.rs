//! Test data generators for integration tests.
//!
//! Transaction builders over spendable outputs plus proptest strategies for
//! random transaction graphs.

use crate::harness::op_true;
use betg_consensus::{Amount, Block, OutPoint, Script, Transaction, TxIn, TxOut};
use betg_mempool::MAX_REPLACEABLE_SEQUENCE;
use proptest::prelude::*;

/// An output the tests may spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendableOutput {
    pub outpoint: OutPoint,
    pub value: Amount,
}

impl SpendableOutput {
    /// First output of a block's coinbase.
    pub fn coinbase_of(block: &Block) -> Self {
        Self::of(&block.transactions[0], 0)
    }

    pub fn of(tx: &Transaction, vout: u32) -> Self {
        Self {
            outpoint: OutPoint::new(tx.txid(), vout),
            value: tx.outputs[vout as usize].value,
        }
    }
}

/// Every output of `tx`.
pub fn outputs_of(tx: &Transaction) -> Vec<SpendableOutput> {
    (0..tx.outputs.len() as u32)
        .map(|vout| SpendableOutput::of(tx, vout))
        .collect()
}

/// Spend `inputs` into `outputs` equal [`op_true`] outputs, paying `fee`.
/// Any remainder of the split goes to the first output.
pub fn spend(inputs: &[SpendableOutput], outputs: usize, fee: Amount) -> Transaction {
    spend_with_sequence(inputs, outputs, fee, TxIn::SEQUENCE_FINAL)
}

/// Like [`spend`] with a BIP125 replacement signal on every input.
pub fn spend_replaceable(inputs: &[SpendableOutput], outputs: usize, fee: Amount) -> Transaction {
    spend_with_sequence(inputs, outputs, fee, MAX_REPLACEABLE_SEQUENCE)
}

fn spend_with_sequence(
    inputs: &[SpendableOutput],
    outputs: usize,
    fee: Amount,
    sequence: u32,
) -> Transaction {
    assert!(outputs > 0, "a spend needs at least one output");
    let total: Amount = inputs.iter().map(|input| input.value).sum::<Amount>() - fee;
    let share = total / outputs as Amount;
    let mut txouts: Vec<TxOut> = (0..outputs).map(|_| TxOut::new(share, op_true())).collect();
    txouts[0].value += total - share * outputs as Amount;

    Transaction {
        version: 2,
        inputs: inputs
            .iter()
            .map(|input| TxIn {
                prevout: input.outpoint,
                script_sig: Script::new(),
                sequence,
            })
            .collect(),
        outputs: txouts,
        lock_time: 0,
    }
}

/// Transaction with one output whose script carries `count` bare
/// CHECKMULTISIG opcodes.
pub fn spend_to_multisig_ops(input: SpendableOutput, count: usize, fee: Amount) -> Transaction {
    let script = (0..count).fold(Script::new(), |script, _| {
        script.push_opcode(betg_consensus::opcodes::OP_CHECKMULTISIG)
    });
    Transaction {
        version: 2,
        inputs: vec![TxIn::new(input.outpoint, Script::new())],
        outputs: vec![TxOut::new(input.value - fee, script)],
        lock_time: 0,
    }
}

/// One node of a random transaction graph.
#[derive(Debug, Clone, Copy)]
pub struct GraphTx {
    /// Index of an earlier transaction to spend from, or a fresh funding
    /// output when `None`.
    pub parent: Option<usize>,
    pub fee: Amount,
}

/// Fees from free up to well above the default relay rate.
pub fn arb_fee() -> impl Strategy<Value = Amount> {
    prop_oneof![
        1 => Just(0 as Amount),
        4 => 100i64..20_000,
        1 => 20_000i64..2_000_000,
    ]
}

/// Graph of up to `max_len` transactions where each spends a funding
/// output or an earlier transaction.
pub fn arb_tx_graph(max_len: usize) -> impl Strategy<Value = Vec<GraphTx>> {
    prop::collection::vec((any::<prop::sample::Index>(), any::<bool>(), arb_fee()), 1..=max_len)
        .prop_map(|raw| {
            raw.into_iter()
                .enumerate()
                .map(|(i, (index, fresh, fee))| GraphTx {
                    parent: if i == 0 || fresh { None } else { Some(index.index(i)) },
                    fee,
                })
                .collect()
        })
}

/// Materialize a graph. Each transaction has two outputs; a child takes its
/// parent's next unspent output, falling back to a funding output. Returns
/// the transactions with their fees in creation order, stopping when
/// funding runs out.
pub fn build_graph(graph: &[GraphTx], funding: &[SpendableOutput]) -> Vec<(Transaction, Amount)> {
    let mut funding = funding.iter().copied();
    let mut unspent: Vec<Vec<SpendableOutput>> = Vec::with_capacity(graph.len());
    let mut txs = Vec::with_capacity(graph.len());

    for node in graph {
        let from_parent = node.parent.and_then(|p| unspent.get_mut(p).and_then(|outs| outs.pop()));
        let Some(input) = from_parent.or_else(|| funding.next()) else {
            break;
        };
        let fee = node.fee.min(input.value / 2);
        let tx = spend(&[input], 2, fee);
        unspent.push(outputs_of(&tx));
        txs.push((tx, fee));
    }
    txs
}
