//! Fixed-size digest types.
//!
//! `Hash256` keeps bytes in display order: the first byte is the most
//! significant when the digest is read as a 256-bit integer, so the derived
//! `Ord` is the numeric order used for target comparisons.

use crate::{PowError, PowResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 256-bit digest in display (big-endian) byte order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash256(#[serde(with = "hex")] pub [u8; 32]);

impl Hash256 {
    /// All-zero digest.
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// Wrap raw bytes.
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a 64 character hex string, with or without a `0x` prefix.
    pub fn from_hex(s: &str) -> PowResult<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).map_err(|e| PowError::InvalidHex(e.to_string()))?;
        Ok(Self(out))
    }

    /// Hex encoding in display order.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Bytes in reversed (internal serialization) order.
    pub fn reversed(&self) -> [u8; 32] {
        let mut out = self.0;
        out.reverse();
        out
    }

    /// Build from bytes in reversed (internal serialization) order.
    pub fn from_reversed(mut bytes: [u8; 32]) -> Self {
        bytes.reverse();
        Self(bytes)
    }

    /// True if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Interpret the bytes as eight little-endian words.
    pub fn to_le_words(&self) -> [u32; 8] {
        let mut words = [0u32; 8];
        for (i, chunk) in self.0.chunks_exact(4).enumerate() {
            words[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        words
    }

    /// Build from eight words written little-endian.
    pub fn from_le_words(words: &[u32; 8]) -> Self {
        let mut bytes = [0u8; 32];
        for (i, w) in words.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        Self(bytes)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

impl FromStr for Hash256 {
    type Err = PowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// A 512-bit value held as sixteen native words.
///
/// Words are decoded little-endian from the byte representation used by
/// Keccak-512.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Hash512(pub [u32; 16]);

impl Hash512 {
    /// Decode from 64 bytes.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let mut words = [0u32; 16];
        for (i, chunk) in bytes.chunks_exact(4).take(16).enumerate() {
            words[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self(words)
    }

    /// Encode to 64 bytes.
    pub fn to_le_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        for (i, w) in self.0.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        bytes
    }

    /// Word-wise XOR.
    pub fn xor(&self, other: &Hash512) -> Hash512 {
        let mut out = [0u32; 16];
        for (i, w) in out.iter_mut().enumerate() {
            *w = self.0[i] ^ other.0[i];
        }
        Hash512(out)
    }
}

impl fmt::Debug for Hash512 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash512({})", hex::encode(self.to_le_bytes()))
    }
}
