//! Compact target (`nBits`) encoding.
//!
//! A compact value is a base-256 float: the top byte is the length in bytes,
//! the low 23 bits are the mantissa and bit 23 is a sign flag. Decoding keeps
//! the sign and overflow flags so callers can reject them; values are
//! truncated to 256 bits exactly as a fixed-width integer would be.

use betg_pow::Hash256;
use num_bigint::BigUint;
use num_traits::{One, Zero};

/// A decoded compact target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactTarget {
    /// Magnitude, truncated to 256 bits.
    pub target: BigUint,
    /// Sign bit set with a non-zero mantissa.
    pub negative: bool,
    /// The encoded value does not fit in 256 bits.
    pub overflow: bool,
}

impl CompactTarget {
    /// Usable as a proof-of-work target: positive and in range.
    pub fn is_valid(&self) -> bool {
        !self.negative && !self.overflow && !self.target.is_zero()
    }
}

fn mask_256(value: BigUint) -> BigUint {
    if value.bits() <= 256 {
        value
    } else {
        value & ((BigUint::one() << 256u32) - BigUint::one())
    }
}

/// Decode `nBits`.
pub fn decode_compact(bits: u32) -> CompactTarget {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;

    let target = if size <= 3 {
        word >>= 8 * (3 - size);
        BigUint::from(word)
    } else {
        mask_256(BigUint::from(word) << (8 * (size - 3)))
    };

    let negative = word != 0 && (bits & 0x0080_0000) != 0;
    let overflow =
        word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));

    CompactTarget {
        target,
        negative,
        overflow,
    }
}

/// Encode a non-negative target as `nBits`, rounding the mantissa down.
pub fn encode_compact(target: &BigUint) -> u32 {
    let target = mask_256(target.clone());
    let mut size = ((target.bits() + 7) / 8) as u32;

    let mut compact: u32 = if size <= 3 {
        let low = target.iter_u64_digits().next().unwrap_or(0);
        (low << (8 * (3 - size))) as u32
    } else {
        let shifted = &target >> (8 * (size - 3));
        shifted.iter_u64_digits().next().unwrap_or(0) as u32
    };

    // Keep the sign bit clear by moving one byte into the exponent.
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// Read a display-order hash as a big-endian 256-bit integer.
pub fn hash_to_target(hash: &Hash256) -> BigUint {
    BigUint::from_bytes_be(hash.as_bytes())
}

/// Write a target as a display-order hash, truncating to 256 bits.
pub fn target_to_hash(target: &BigUint) -> Hash256 {
    let target = mask_256(target.clone());
    let bytes = target.to_bytes_be();
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    Hash256::new(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(bits: u32, target_hex: &str, negative: bool, overflow: bool, reencoded: u32) {
        let decoded = decode_compact(bits);
        let expected = BigUint::parse_bytes(target_hex.as_bytes(), 16).unwrap();
        assert_eq!(decoded.target, expected, "bits {:#010x}", bits);
        assert_eq!(decoded.negative, negative, "bits {:#010x}", bits);
        assert_eq!(decoded.overflow, overflow, "bits {:#010x}", bits);
        if !overflow {
            assert_eq!(encode_compact(&decoded.target), reencoded, "bits {:#010x}", bits);
        }
    }

    // ============ SetCompact / GetCompact Tests ============

    #[test]
    fn test_small_and_zero_values() {
        check(0x00000000, "0", false, false, 0);
        check(0x00123456, "0", false, false, 0);
        check(0x01003456, "0", false, false, 0);
        check(0x02000056, "0", false, false, 0);
        check(0x03000000, "0", false, false, 0);
        check(0x04000000, "0", false, false, 0);
        check(0x00923456, "0", false, false, 0);
        check(0x01803456, "0", false, false, 0);
        check(0x02800056, "0", false, false, 0);
        check(0x03800000, "0", false, false, 0);
        check(0x04800000, "0", false, false, 0);
    }

    #[test]
    fn test_mantissa_rounding() {
        check(0x01123456, "12", false, false, 0x01120000);
        check(0x02123456, "1234", false, false, 0x02123400);
        check(0x03123456, "123456", false, false, 0x03123456);
        check(0x04123456, "12345600", false, false, 0x04123456);
        check(0x05009234, "92340000", false, false, 0x05009234);
        check(
            0x20123456,
            "1234560000000000000000000000000000000000000000000000000000000000",
            false,
            false,
            0x20123456,
        );
    }

    #[test]
    fn test_sign_bit_moves_into_exponent() {
        // 0x80 would set the sign bit, so it is re-encoded with a larger size.
        let decoded = decode_compact(0x01fedcba);
        assert!(decoded.negative);
        assert_eq!(decoded.target, BigUint::from(0x7eu32));
        assert_eq!(encode_compact(&BigUint::from(0x80u32)), 0x02008000);

        let decoded = decode_compact(0x04923456);
        assert!(decoded.negative);
        assert!(!decoded.is_valid());
    }

    #[test]
    fn test_overflow_flag() {
        assert!(decode_compact(0xff123456).overflow);
        assert!(decode_compact(0x23000001).overflow);
        assert!(!decode_compact(0x22000001).overflow);
        assert!(decode_compact(0x22000100).overflow);
        assert!(decode_compact(0x21010000).overflow);
        assert!(!decode_compact(0x210000ff).overflow);
    }

    #[test]
    fn test_network_limits() {
        let main = decode_compact(0x1f0affff);
        assert!(main.is_valid());
        assert_eq!(
            target_to_hash(&main.target).to_hex(),
            "000affff00000000000000000000000000000000000000000000000000000000"
        );
        let regtest = decode_compact(0x207fffff);
        assert_eq!(
            target_to_hash(&regtest.target).to_hex(),
            "7fffff0000000000000000000000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn test_hash_target_conversion() {
        let h = Hash256::from_hex(
            "00000000000000000000000000000000000000000000000000000000000001ff",
        )
        .unwrap();
        assert_eq!(hash_to_target(&h), BigUint::from(0x1ffu32));
        assert_eq!(target_to_hash(&BigUint::from(0x1ffu32)), h);
    }
}
