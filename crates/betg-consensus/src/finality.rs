//! Transaction finality: absolute locktime and relative sequence locks.

use crate::params::LOCKTIME_THRESHOLD;
use crate::transaction::{Transaction, TxIn};

/// Whether `tx` is final in a block at `height` with time reference `block_time`.
///
/// `block_time` is the median time past of the parent when locktime is
/// evaluated for inclusion.
pub fn is_final_tx(tx: &Transaction, height: u32, block_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let limit = if tx.lock_time < LOCKTIME_THRESHOLD {
        i64::from(height)
    } else {
        block_time
    };
    if i64::from(tx.lock_time) < limit {
        return true;
    }
    // A non-final locktime is ignored when every input opts out.
    tx.inputs
        .iter()
        .all(|input| input.sequence == TxIn::SEQUENCE_FINAL)
}

/// The last height and time at which a transaction is still locked.
///
/// `-1` means no constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceLocks {
    pub min_height: i64,
    pub min_time: i64,
}

impl SequenceLocks {
    pub const NONE: SequenceLocks = SequenceLocks {
        min_height: -1,
        min_time: -1,
    };
}

/// Relative lock bounds for `tx`.
///
/// `prev_heights[i]` is the height of the coin spent by input `i` (a coin
/// still in the mempool counts as the next block's height). `mtp_at(h)` is
/// the median time past of the block at height `h` on the chain being
/// evaluated.
pub fn calculate_sequence_locks<F>(
    tx: &Transaction,
    prev_heights: &[u32],
    mtp_at: F,
) -> SequenceLocks
where
    F: Fn(u32) -> i64,
{
    let mut locks = SequenceLocks::NONE;
    if tx.version < 2 {
        return locks;
    }

    for (input, &coin_height) in tx.inputs.iter().zip(prev_heights) {
        let sequence = input.sequence;
        if sequence & TxIn::SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            continue;
        }
        let value = i64::from(sequence & TxIn::SEQUENCE_LOCKTIME_MASK);

        if sequence & TxIn::SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
            let coin_time = mtp_at(coin_height.saturating_sub(1));
            let unlock = coin_time + (value << TxIn::SEQUENCE_LOCKTIME_GRANULARITY) - 1;
            locks.min_time = locks.min_time.max(unlock);
        } else {
            let unlock = i64::from(coin_height) + value - 1;
            locks.min_height = locks.min_height.max(unlock);
        }
    }
    locks
}

/// Whether `locks` are satisfied by a block at `height` whose parent has
/// median time past `prev_mtp`.
pub fn evaluate_sequence_locks(height: u32, prev_mtp: i64, locks: &SequenceLocks) -> bool {
    !(locks.min_height >= i64::from(height) || locks.min_time >= prev_mtp)
}
