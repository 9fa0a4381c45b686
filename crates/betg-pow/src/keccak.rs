//! Keccak primitives used by the DAG and by KawPow.
//!
//! The DAG uses the original Keccak padding (not SHA-3), and KawPow runs the
//! bare Keccak-f\[800\] permutation without any padding.

use crate::hash::{Hash256, Hash512};
use sha3::{Digest, Keccak256, Keccak512};

/// Keccak-256 over arbitrary bytes.
pub(crate) fn keccak256(data: &[u8]) -> Hash256 {
    let digest = Keccak256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Hash256(out)
}

/// Keccak-512 over arbitrary bytes.
pub(crate) fn keccak512(data: &[u8]) -> Hash512 {
    let digest = Keccak512::digest(data);
    Hash512::from_le_bytes(&digest)
}

/// Keccak-512 of a 512-bit item.
pub(crate) fn keccak512_item(item: &Hash512) -> Hash512 {
    keccak512(&item.to_le_bytes())
}

/// Keccak-f\[800\] permutation (22 rounds) over a 25 word state.
pub(crate) fn keccak_f800(state: &mut [u32; 25]) {
    keccak::f800(state);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256_empty() {
        // Original Keccak padding, not SHA3-256.
        assert_eq!(
            keccak256(&[]).to_hex(),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_keccak512_empty() {
        let h = keccak512(&[]);
        assert_eq!(
            hex::encode(h.to_le_bytes()),
            "0eab42de4c3ceb9235fc91acffe746b29c29a8c366b7c60e4e67c466f36a4304\
             c00fa9caf9d87976ba469bcbe06713b435f091ef2769fb160cdab33d3670680e"
        );
    }

    #[test]
    fn test_keccak_f800_changes_state() {
        let mut state = [0u32; 25];
        keccak_f800(&mut state);
        assert!(state.iter().any(|&w| w != 0));
        let snapshot = state;
        keccak_f800(&mut state);
        assert_ne!(state, snapshot);
    }
}
