//! Block and transaction validation.
//!
//! Checks are split the usual way:
//! - context-free (`check_transaction`, `check_block_header`, `check_block`)
//! - against the parent (`contextual_check_block_header`, `contextual_check_block`)
//! - against the coin view (`check_tx_inputs`, `connect_block`)
//!
//! Script evaluation is delegated to an `InputVerifier`.

use crate::block::{block_merkle_root, Block, BlockHeader};
use crate::coins::{Coin, CoinsOverlay, CoinsView, UndoSet};
use crate::compact::{decode_compact, target_to_hash};
use crate::difficulty::check_proof_of_work;
use crate::finality::{calculate_sequence_locks, evaluate_sequence_locks, is_final_tx};
use crate::params::{
    COINBASE_MATURITY, MAX_BLOCK_SIGOPS_COST, MAX_BLOCK_WEIGHT, MAX_COINBASE_SCRIPT_SIZE,
    MAX_FUTURE_BLOCK_TIME, MAX_MONEY, MIN_COINBASE_SCRIPT_SIZE, WITNESS_SCALE_FACTOR,
};
use crate::script::Script;
use crate::subsidy::get_block_subsidy;
use crate::transaction::{Amount, Transaction};
use crate::{BlockFailure, ChainParams, ConsensusError, ConsensusResult, TxFailure};
use betg_pow::EpochContextCache;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, instrument, trace};

/// Script verification flags passed to the input verifier.
pub mod flags {
    pub const VERIFY_NONE: u32 = 0;
    pub const VERIFY_P2SH: u32 = 1 << 0;
    pub const VERIFY_DERSIG: u32 = 1 << 2;
    pub const VERIFY_CHECKLOCKTIMEVERIFY: u32 = 1 << 9;
    pub const VERIFY_CHECKSEQUENCEVERIFY: u32 = 1 << 10;
    pub const VERIFY_WITNESS: u32 = 1 << 11;

    /// Every rule is active from genesis.
    pub const BLOCK_SCRIPT_VERIFY_FLAGS: u32 = VERIFY_P2SH
        | VERIFY_DERSIG
        | VERIFY_CHECKLOCKTIMEVERIFY
        | VERIFY_CHECKSEQUENCEVERIFY
        | VERIFY_WITNESS;
}

/// Oldest header version accepted.
pub const MIN_BLOCK_VERSION: i32 = 4;

/// Script verification failure reported by an `InputVerifier`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// Input `input` did not satisfy the spent output's script.
    #[error("input {input}: {reason}")]
    Failed { input: usize, reason: String },
}

/// Script and signature checking for transaction inputs.
///
/// `spent[i]` is the coin consumed by input `i`.
pub trait InputVerifier: Send + Sync {
    fn verify_inputs(&self, tx: &Transaction, spent: &[Coin], flags: u32)
        -> Result<(), ScriptError>;
}

/// Verifier that accepts every input.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllVerifier;

impl InputVerifier for AcceptAllVerifier {
    fn verify_inputs(&self, _: &Transaction, _: &[Coin], _: u32) -> Result<(), ScriptError> {
        Ok(())
    }
}

// ============================================================================
// Transactions
// ============================================================================

fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Context-free transaction checks.
pub fn check_transaction(tx: &Transaction) -> ConsensusResult<()> {
    if tx.inputs.is_empty() {
        return Err(ConsensusError::tx("bad-txns-vin-empty", "no inputs"));
    }
    if tx.outputs.is_empty() {
        return Err(ConsensusError::tx("bad-txns-vout-empty", "no outputs"));
    }
    if tx.weight() > MAX_BLOCK_WEIGHT {
        return Err(ConsensusError::tx(
            "bad-txns-oversize",
            format!("weight {}", tx.weight()),
        ));
    }

    let mut total: Amount = 0;
    for output in &tx.outputs {
        if output.value < 0 {
            return Err(ConsensusError::tx("bad-txns-vout-negative", ""));
        }
        if output.value > MAX_MONEY {
            return Err(ConsensusError::tx("bad-txns-vout-toolarge", ""));
        }
        total += output.value;
        if !money_range(total) {
            return Err(ConsensusError::tx("bad-txns-txouttotal-toolarge", ""));
        }
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(ConsensusError::tx(
                "bad-txns-inputs-duplicate",
                format!("{}", input.prevout),
            ));
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&len) {
            return Err(ConsensusError::tx("bad-cb-length", format!("{} bytes", len)));
        }
    } else if tx.inputs.iter().any(|input| input.prevout.is_null()) {
        return Err(ConsensusError::tx("bad-txns-prevout-null", ""));
    }
    Ok(())
}

/// Check `tx` against the coins it spends and return its fee.
///
/// `spend_height` is the height of the block that would include it.
pub fn check_tx_inputs<V: CoinsView + ?Sized>(
    tx: &Transaction,
    view: &V,
    spend_height: u32,
) -> ConsensusResult<Amount> {
    let mut value_in: Amount = 0;
    for input in &tx.inputs {
        let coin = view.get_coin(&input.prevout).ok_or_else(|| {
            ConsensusError::tx_kind(
                TxFailure::MissingInputs,
                "bad-txns-inputs-missingorspent",
                format!("{} missing or spent", input.prevout),
            )
        })?;

        if coin.is_coinbase && spend_height.saturating_sub(coin.height) < COINBASE_MATURITY {
            return Err(ConsensusError::tx_kind(
                TxFailure::PrematureSpend,
                "bad-txns-premature-spend-of-coinbase",
                format!(
                    "tried to spend coinbase at depth {}",
                    spend_height.saturating_sub(coin.height)
                ),
            ));
        }

        value_in += coin.output.value;
        if !money_range(coin.output.value) || !money_range(value_in) {
            return Err(ConsensusError::tx("bad-txns-inputvalues-outofrange", ""));
        }
    }

    let value_out = tx
        .value_out()
        .ok_or_else(|| ConsensusError::tx("bad-txns-txouttotal-toolarge", ""))?;
    if value_in < value_out {
        return Err(ConsensusError::tx(
            "bad-txns-in-belowout",
            format!("value in ({}) < value out ({})", value_in, value_out),
        ));
    }

    let fee = value_in - value_out;
    if !money_range(fee) {
        return Err(ConsensusError::tx("bad-txns-fee-outofrange", ""));
    }
    Ok(fee)
}

/// Signature operation cost: legacy sigops plus P2SH redeem-script sigops,
/// scaled by the witness factor.
pub fn transaction_sigop_cost<V: CoinsView + ?Sized>(tx: &Transaction, view: &V) -> u64 {
    let mut cost = u64::from(tx.legacy_sigop_count()) * WITNESS_SCALE_FACTOR;
    if tx.is_coinbase() {
        return cost;
    }
    for input in &tx.inputs {
        if let Some(coin) = view.get_coin(&input.prevout) {
            let p2sh = coin.output.script_pubkey.p2sh_sigop_count(&input.script_sig);
            cost += u64::from(p2sh) * WITNESS_SCALE_FACTOR;
        }
    }
    cost
}

// ============================================================================
// Headers
// ============================================================================

/// Cheap proof-of-work check: the carried mix gives a hash below the target.
pub fn check_block_header(header: &BlockHeader, params: &ChainParams) -> ConsensusResult<()> {
    if !check_proof_of_work(&header.hash(), header.bits, params) {
        return Err(ConsensusError::block_kind(
            BlockFailure::InvalidHeader,
            "high-hash",
            "proof of work failed",
        ));
    }
    Ok(())
}

/// Full KawPow verification, recomputing the mix from the epoch light cache.
pub fn check_block_header_pow(
    header: &BlockHeader,
    params: &ChainParams,
    epochs: &EpochContextCache,
) -> ConsensusResult<()> {
    let decoded = decode_compact(header.bits);
    if !decoded.is_valid() || decoded.target > params.pow_limit {
        return Err(ConsensusError::block_kind(
            BlockFailure::InvalidHeader,
            "high-hash",
            format!("invalid target {:#010x}", header.bits),
        ));
    }

    let context = epochs.for_height(header.height)?;
    let boundary = target_to_hash(&decoded.target);
    if !betg_pow::verify(
        &context,
        header.height,
        &header.header_hash(),
        &header.mix_hash,
        header.nonce,
        &boundary,
    ) {
        return Err(ConsensusError::block_kind(
            BlockFailure::InvalidHeader,
            "high-hash",
            "kawpow verification failed",
        ));
    }
    Ok(())
}

/// The header's height must follow its parent's.
///
/// Runs before `check_block_header_pow`, since the height selects the epoch
/// whose context that check builds.
pub fn check_header_height(header: &BlockHeader, prev_height: u32) -> ConsensusResult<()> {
    if Some(header.height) != prev_height.checked_add(1) {
        return Err(ConsensusError::block_kind(
            BlockFailure::InvalidHeader,
            "bad-height",
            format!("height {} after parent {}", header.height, prev_height),
        ));
    }
    Ok(())
}

/// What a header is checked against: facts about its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderContext {
    pub prev_height: u32,
    /// Result of `get_next_work_required` for this header.
    pub expected_bits: u32,
    /// Median time past of the parent.
    pub median_time_past: i64,
    /// Network-adjusted current time.
    pub adjusted_time: i64,
}

/// Header checks that need the parent.
pub fn contextual_check_block_header(
    header: &BlockHeader,
    ctx: &HeaderContext,
) -> ConsensusResult<()> {
    // 1. Difficulty
    if header.bits != ctx.expected_bits {
        return Err(ConsensusError::block_kind(
            BlockFailure::InvalidHeader,
            "bad-diffbits",
            format!(
                "incorrect proof of work: {:#010x}, expected {:#010x}",
                header.bits, ctx.expected_bits
            ),
        ));
    }

    // 2. Height is carried explicitly and feeds the PoW
    check_header_height(header, ctx.prev_height)?;

    // 3. Timestamps
    if i64::from(header.time) <= ctx.median_time_past {
        return Err(ConsensusError::block_kind(
            BlockFailure::InvalidHeader,
            "time-too-old",
            format!(
                "block's timestamp {} is too early (mtp {})",
                header.time, ctx.median_time_past
            ),
        ));
    }
    if i64::from(header.time) > ctx.adjusted_time + MAX_FUTURE_BLOCK_TIME {
        return Err(ConsensusError::block_kind(
            BlockFailure::TimeFuture,
            "time-too-new",
            format!("block timestamp {} too far in the future", header.time),
        ));
    }

    // 4. Version
    if header.version < MIN_BLOCK_VERSION {
        return Err(ConsensusError::block_kind(
            BlockFailure::InvalidHeader,
            "bad-version",
            format!("rejected nVersion={:#x} block", header.version),
        ));
    }
    Ok(())
}

// ============================================================================
// Blocks
// ============================================================================

fn tx_to_block_error(err: ConsensusError, tx: &Transaction) -> ConsensusError {
    match err {
        ConsensusError::Transaction { reason, detail, .. } => ConsensusError::block(
            reason,
            format!("transaction {} failed: {}", tx.txid(), detail),
        ),
        other => other,
    }
}

/// Context-free block checks.
///
/// `check_pow` runs the cheap proof-of-work check; `check_merkle_root`
/// compares the header's merkle root and detects malleated transaction lists.
pub fn check_block(
    block: &Block,
    params: &ChainParams,
    check_pow: bool,
    check_merkle_root: bool,
) -> ConsensusResult<()> {
    if check_pow {
        check_block_header(&block.header, params)?;
    }

    if check_merkle_root {
        let (root, mutated) = block_merkle_root(block);
        if root != block.header.merkle_root {
            return Err(ConsensusError::block_kind(
                BlockFailure::Mutated,
                "bad-txnmrklroot",
                "hashMerkleRoot mismatch",
            ));
        }
        if mutated {
            return Err(ConsensusError::block_kind(
                BlockFailure::Mutated,
                "bad-txns-duplicate",
                "duplicate transaction",
            ));
        }
    }

    if block.transactions.is_empty()
        || block.transactions.len() as u64 * WITNESS_SCALE_FACTOR > MAX_BLOCK_WEIGHT
        || block.weight() > MAX_BLOCK_WEIGHT
    {
        return Err(ConsensusError::block("bad-blk-length", "size limits failed"));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ConsensusError::block("bad-cb-missing", "first tx is not coinbase"));
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(ConsensusError::block("bad-cb-multiple", "more than one coinbase"));
    }

    let mut sigops: u64 = 0;
    for tx in &block.transactions {
        check_transaction(tx).map_err(|e| tx_to_block_error(e, tx))?;
        sigops += u64::from(tx.legacy_sigop_count());
    }
    if sigops * WITNESS_SCALE_FACTOR > MAX_BLOCK_SIGOPS_COST {
        return Err(ConsensusError::block("bad-blk-sigops", "out-of-bounds SigOpCount"));
    }
    Ok(())
}

/// Block checks that need the parent: finality, BIP34 height, weight.
///
/// `prev_mtp` is the parent's median time past, used as the locktime cutoff.
pub fn contextual_check_block(block: &Block, prev_mtp: i64) -> ConsensusResult<()> {
    let height = block.header.height;

    for tx in &block.transactions {
        if !is_final_tx(tx, height, prev_mtp) {
            return Err(ConsensusError::block(
                "bad-txns-nonfinal",
                format!("non-final transaction {}", tx.txid()),
            ));
        }
    }

    let expected = Script::new().push_int(i64::from(height));
    let coinbase_ok = block
        .transactions
        .first()
        .and_then(|cb| cb.inputs.first())
        .map(|input| input.script_sig.as_bytes().starts_with(expected.as_bytes()))
        .unwrap_or(false);
    if !coinbase_ok {
        return Err(ConsensusError::block(
            "bad-cb-height",
            "block height mismatch in coinbase",
        ));
    }

    if block.weight() > MAX_BLOCK_WEIGHT {
        return Err(ConsensusError::block(
            "bad-blk-weight",
            format!("weight limit failed: {}", block.weight()),
        ));
    }
    Ok(())
}

/// Chain facts needed to connect a block.
pub struct ConnectContext<'a> {
    /// Median time past of the parent.
    pub prev_mtp: i64,
    /// Median time past of the block at a given height on the branch being
    /// connected.
    pub mtp_at: &'a dyn Fn(u32) -> i64,
    pub script_flags: u32,
}

/// Result of connecting a block to a coin view.
#[derive(Debug, Clone, Default)]
pub struct ConnectedBlock {
    pub undo: UndoSet,
    pub fees: Amount,
    pub sigop_cost: u64,
}

/// Spend and create the coins of `block` in `view`, enforcing every rule
/// that needs the coin set.
///
/// On error the overlay holds partial changes and must be discarded.
#[instrument(skip_all, fields(height = block.header.height))]
pub fn connect_block<V: CoinsView + ?Sized>(
    block: &Block,
    view: &mut CoinsOverlay<'_, V>,
    params: &ChainParams,
    ctx: &ConnectContext<'_>,
    verifier: &dyn InputVerifier,
) -> ConsensusResult<ConnectedBlock> {
    let height = block.header.height;
    let mut connected = ConnectedBlock::default();

    for tx in &block.transactions {
        let is_coinbase = tx.is_coinbase();
        let mut spent = Vec::new();

        if !is_coinbase {
            let fee = check_tx_inputs(tx, view, height).map_err(|e| tx_to_block_error(e, tx))?;
            connected.fees += fee;
            if !money_range(connected.fees) {
                return Err(ConsensusError::block("bad-txns-accumulated-fee-outofrange", ""));
            }

            spent = tx
                .inputs
                .iter()
                .filter_map(|input| view.get_coin(&input.prevout))
                .collect();
            let prev_heights: Vec<u32> = spent.iter().map(|coin| coin.height).collect();
            let locks = calculate_sequence_locks(tx, &prev_heights, ctx.mtp_at);
            if !evaluate_sequence_locks(height, ctx.prev_mtp, &locks) {
                return Err(ConsensusError::block(
                    "bad-txns-nonfinal",
                    format!("contains a non-BIP68-final transaction {}", tx.txid()),
                ));
            }
        }

        connected.sigop_cost += transaction_sigop_cost(tx, view);
        if connected.sigop_cost > MAX_BLOCK_SIGOPS_COST {
            return Err(ConsensusError::block("bad-blk-sigops", "too many sigops"));
        }

        if !is_coinbase {
            verifier
                .verify_inputs(tx, &spent, ctx.script_flags)
                .map_err(|e| {
                    ConsensusError::block(
                        "mandatory-script-verify-flag-failed",
                        format!("transaction {}: {}", tx.txid(), e),
                    )
                })?;
        }

        let undo = view.update_coins(tx, height)?;
        if !is_coinbase {
            connected.undo.txs.push(undo);
        }
    }

    let subsidy = get_block_subsidy(height, params);
    let coinbase_out = block.transactions[0].value_out().unwrap_or(Amount::MAX);
    if coinbase_out > connected.fees + subsidy {
        return Err(ConsensusError::block(
            "bad-cb-amount",
            format!(
                "coinbase pays too much (actual={} vs limit={})",
                coinbase_out,
                connected.fees + subsidy
            ),
        ));
    }

    view.set_best_block(block.hash());
    debug!(
        fees = connected.fees,
        sigop_cost = connected.sigop_cost,
        txs = block.transactions.len(),
        "Connected block"
    );
    Ok(connected)
}

/// Reverse `connect_block` using its undo data.
///
/// Returns false if the view disagreed with the undo data; the view is
/// still fully rolled back.
pub fn disconnect_block<V: CoinsView + ?Sized>(
    block: &Block,
    undo: &UndoSet,
    view: &mut CoinsOverlay<'_, V>,
) -> ConsensusResult<bool> {
    if undo.txs.len() + 1 != block.transactions.len() {
        return Err(ConsensusError::block(
            "bad-undo-data",
            format!(
                "{} undo entries for {} transactions",
                undo.txs.len(),
                block.transactions.len()
            ),
        ));
    }

    let mut clean = true;
    for (i, tx) in block.transactions.iter().enumerate().rev() {
        let tx_undo = if i == 0 { None } else { undo.txs.get(i - 1) };
        clean &= view.undo_coins(tx, tx_undo);
    }
    view.set_best_block(block.header.prev_hash);
    trace!(height = block.header.height, clean, "Disconnected block");
    Ok(clean)
}
