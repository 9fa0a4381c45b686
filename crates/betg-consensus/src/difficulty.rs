//! Difficulty adjustment.
//!
//! Every block retargets. The next target is the running average of the
//! previous `pow_target_window` targets, scaled by how long those blocks
//! actually took against `window * spacing`. The timespan is clamped to a
//! factor of three either way and the result is capped at the pow limit.

use crate::compact::{decode_compact, encode_compact, hash_to_target};
use crate::{ChainParams, ConsensusError, ConsensusResult};
use betg_pow::Hash256;
use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};
use tracing::{debug, trace};

/// Header data needed for difficulty calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderForDifficulty {
    /// Block height.
    pub height: u32,
    /// Block timestamp in seconds.
    pub time: u32,
    /// Compact target (nBits).
    pub bits: u32,
}

fn truncate_256(value: BigUint) -> BigUint {
    if value.bits() <= 256 {
        value
    } else {
        value & ((BigUint::one() << 256u32) - BigUint::one())
    }
}

/// Required bits for the block after the last header in `window`.
///
/// `window` is ordered oldest first and ends at the current tip. An empty
/// window, or a tip below the retarget window, yields the pow limit.
pub fn calculate_next_work_required(
    window: &[HeaderForDifficulty],
    params: &ChainParams,
) -> ConsensusResult<u32> {
    let past_blocks = params.pow_target_window as usize;
    let last = match window.last() {
        Some(last) if last.height as usize >= past_blocks => last,
        _ => return Ok(encode_compact(&params.pow_limit)),
    };

    if window.len() < past_blocks {
        return Err(ConsensusError::DifficultyWindow {
            needed: past_blocks,
            got: window.len(),
        });
    }

    // Walk back from the tip: count 1 is the tip itself.
    let mut avg = BigUint::zero();
    for (i, header) in window.iter().rev().take(past_blocks).enumerate() {
        let count = (i + 1) as u32;
        let target = decode_compact(header.bits).target;
        avg = if count == 1 {
            target
        } else {
            truncate_256(avg * count + target) / (count + 1)
        };
    }
    let first = &window[window.len() - past_blocks];

    let target_timespan = past_blocks as i64 * params.pow_target_spacing;
    let actual_timespan = (i64::from(last.time) - i64::from(first.time))
        .clamp(target_timespan / 3, target_timespan * 3);

    let mut new_target = truncate_256(avg * BigUint::from(actual_timespan as u64));
    new_target /= BigUint::from(target_timespan as u64);
    if new_target > params.pow_limit {
        new_target = params.pow_limit.clone();
    }

    let bits = encode_compact(&new_target);
    trace!(
        height = last.height + 1,
        actual_timespan,
        target_timespan,
        bits,
        "Retargeted"
    );
    Ok(bits)
}

/// Required bits for a new block with timestamp `new_block_time`.
///
/// Networks that allow minimum-difficulty blocks relax the target when the
/// new block arrives well after the tip.
pub fn get_next_work_required(
    window: &[HeaderForDifficulty],
    new_block_time: i64,
    params: &ChainParams,
) -> ConsensusResult<u32> {
    let last = window
        .last()
        .ok_or(ConsensusError::DifficultyWindow { needed: 1, got: 0 })?;

    if params.pow_no_retargeting {
        return Ok(last.bits);
    }

    if params.pow_allow_min_difficulty_blocks {
        let last_time = i64::from(last.time);
        if new_block_time > last_time + params.pow_target_spacing * 5 {
            let relaxed = truncate_256(decode_compact(last.bits).target * 10u32);
            let capped = if relaxed > params.pow_limit {
                &params.pow_limit
            } else {
                &relaxed
            };
            debug!(height = last.height + 1, "Slow block, relaxing target tenfold");
            return Ok(encode_compact(capped));
        }
        // Shadowed by the 5x rule above.
        if new_block_time > last_time + params.pow_target_spacing * 30 {
            return Ok(encode_compact(&params.pow_limit));
        }
    }

    calculate_next_work_required(window, params)
}

/// Whether a change from `old_bits` to `new_bits` is within the permitted range.
///
/// The decoded new target must lie in `[old / 3, old * 3]` and not exceed the
/// pow limit.
pub fn permitted_difficulty_transition(params: &ChainParams, old_bits: u32, new_bits: u32) -> bool {
    let old_target = decode_compact(old_bits).target;
    let new_target = decode_compact(new_bits).target;

    let max_increase = &old_target * 3u32;
    let min_decrease = &old_target / 3u32;

    new_target <= params.pow_limit && new_target <= max_increase && new_target >= min_decrease
}

/// Check a block hash against its claimed target.
pub fn check_proof_of_work(hash: &Hash256, bits: u32, params: &ChainParams) -> bool {
    let decoded = decode_compact(bits);
    if !decoded.is_valid() || decoded.target > params.pow_limit {
        return false;
    }
    hash_to_target(hash) <= decoded.target
}

/// Expected number of hashes for a block at `bits`: `2^256 / (target + 1)`.
///
/// Invalid targets prove no work.
pub fn block_proof(bits: u32) -> BigUint {
    let decoded = decode_compact(bits);
    if !decoded.is_valid() {
        return BigUint::zero();
    }
    (BigUint::one() << 256u32) / (decoded.target + 1u32)
}

/// Seconds of mining at the tip's difficulty that separate two chain works.
///
/// Positive when `to_work` exceeds `from_work`. Saturates at `i64::MAX` in
/// magnitude.
pub fn block_proof_equivalent_time(
    to_work: &BigUint,
    from_work: &BigUint,
    tip_bits: u32,
    params: &ChainParams,
) -> i64 {
    let (diff, sign) = if to_work > from_work {
        (to_work - from_work, 1i64)
    } else {
        (from_work - to_work, -1i64)
    };

    let tip_proof = block_proof(tip_bits);
    if tip_proof.is_zero() {
        return sign * i64::MAX;
    }

    let r = diff * BigUint::from(params.pow_target_spacing as u64) / tip_proof;
    if r.bits() > 63 {
        return sign * i64::MAX;
    }
    sign * r.to_i64().unwrap_or(i64::MAX)
}
