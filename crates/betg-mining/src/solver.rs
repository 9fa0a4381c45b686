//! KawPow nonce search for CPU mining.
//!
//! The search runs over a fixed header: the header hash excludes the nonce
//! and mix digest, so it is computed once and every attempt only varies the
//! nonce. Cancellation is checked between batches, never inside one.

use crate::{MiningError, MiningResult};
use betg_consensus::{decode_compact, target_to_hash, BlockHeader};
use betg_pow::{search, DatasetLookup, Hash256, Solution};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace};

/// Nonces tried between cancellation checks.
pub const DEFAULT_BATCH_SIZE: u64 = 1_000;

/// Largest final hash accepted for `bits`.
pub fn boundary_for_bits(bits: u32) -> MiningResult<Hash256> {
    let target = decode_compact(bits);
    if !target.is_valid() {
        return Err(MiningError::InvalidTarget(bits));
    }
    Ok(target_to_hash(&target.target))
}

/// Write a found solution into `header`.
pub fn seal(header: &mut BlockHeader, solution: &Solution) {
    header.nonce = solution.nonce;
    header.mix_hash = solution.mix_hash;
}

/// Try `batch_size` nonces starting at `start_nonce`.
///
/// `hash_counter` grows by the number of nonces actually hashed.
pub fn try_solve_batch<D: DatasetLookup + ?Sized>(
    dataset: &D,
    height: u32,
    header_hash: &Hash256,
    boundary: &Hash256,
    start_nonce: u64,
    batch_size: u64,
    hash_counter: &AtomicU64,
) -> Option<Solution> {
    match search(dataset, height, header_hash, boundary, start_nonce, batch_size) {
        Some(solution) => {
            hash_counter.fetch_add(solution.nonce.wrapping_sub(start_nonce) + 1, Ordering::Relaxed);
            Some(solution)
        }
        None => {
            hash_counter.fetch_add(batch_size, Ordering::Relaxed);
            None
        }
    }
}

/// Search up to `max_attempts` nonces for `header`.
///
/// Returns `None` when cancelled or when the attempts run out.
pub fn try_solve<D: DatasetLookup + ?Sized>(
    dataset: &D,
    header: &BlockHeader,
    boundary: &Hash256,
    start_nonce: u64,
    max_attempts: u64,
    cancel: &AtomicBool,
    hash_counter: &AtomicU64,
) -> Option<Solution> {
    let header_hash = header.header_hash();
    let mut done = 0u64;
    while done < max_attempts {
        if cancel.load(Ordering::Relaxed) {
            trace!(height = header.height, attempts = done, "Nonce search cancelled");
            return None;
        }
        let batch = DEFAULT_BATCH_SIZE.min(max_attempts - done);
        let start = start_nonce.wrapping_add(done);
        if let Some(solution) = try_solve_batch(
            dataset,
            header.height,
            &header_hash,
            boundary,
            start,
            batch,
            hash_counter,
        ) {
            debug!(
                height = header.height,
                nonce = solution.nonce,
                attempts = done + solution.nonce.wrapping_sub(start) + 1,
                "Found KawPow solution"
            );
            return Some(solution);
        }
        done += batch;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use betg_consensus::{check_proof_of_work, ChainParams};
    use betg_pow::{verify, EpochContext};
    use once_cell::sync::Lazy;
    use std::sync::Arc;

    static EPOCH0: Lazy<Arc<EpochContext>> =
        Lazy::new(|| Arc::new(EpochContext::build(0).unwrap()));

    fn header() -> BlockHeader {
        let params = ChainParams::regtest();
        BlockHeader {
            version: 4,
            prev_hash: params.genesis_hash,
            merkle_root: Hash256::new([7; 32]),
            time: params.genesis.header.time + 60,
            bits: 0x207fffff,
            nonce: 0,
            height: 1,
            mix_hash: Hash256::ZERO,
        }
    }

    // ============ Boundary Tests ============

    #[test]
    fn test_boundary_for_bits() {
        let boundary = boundary_for_bits(0x207fffff).unwrap();
        assert_eq!(boundary.0[0], 0x7f);
        assert!(matches!(boundary_for_bits(0), Err(MiningError::InvalidTarget(0))));
        assert!(boundary_for_bits(0x04923456).is_err());
    }

    // ============ Solver Tests ============

    #[test]
    fn test_solve_and_seal() {
        let mut header = header();
        let boundary = boundary_for_bits(header.bits).unwrap();
        let cancel = AtomicBool::new(false);
        let counter = AtomicU64::new(0);

        let solution = try_solve(EPOCH0.as_ref(), &header, &boundary, 0, 10_000, &cancel, &counter)
            .expect("easy target");
        assert_eq!(counter.load(Ordering::Relaxed), solution.nonce + 1);

        seal(&mut header, &solution);
        assert!(verify(
            &EPOCH0,
            header.height,
            &header.header_hash(),
            &header.mix_hash,
            header.nonce,
            &boundary
        ));
        assert_eq!(header.hash(), solution.final_hash);
        assert!(check_proof_of_work(&header.hash(), header.bits, &ChainParams::regtest()));
    }

    #[test]
    fn test_cancelled_search() {
        let cancel = AtomicBool::new(true);
        let counter = AtomicU64::new(0);
        let result =
            try_solve(EPOCH0.as_ref(), &header(), &Hash256::ZERO, 0, 10, &cancel, &counter);
        assert!(result.is_none());
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_exhausted_batch_counts_every_nonce() {
        let counter = AtomicU64::new(0);
        let header = header();
        let result = try_solve_batch(
            EPOCH0.as_ref(),
            header.height,
            &header.header_hash(),
            &Hash256::ZERO,
            5,
            3,
            &counter,
        );
        assert!(result.is_none());
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }
}
