//! Consensus serialization.
//!
//! Little-endian integers, compact-size length prefixes and 32-byte hashes
//! written in internal (reversed display) order.

use crate::{ConsensusError, ConsensusResult};
use betg_pow::Hash256;
use bytes::{Buf, BufMut};
use sha2::{Digest, Sha256};

/// Largest compact-size value accepted when decoding.
const MAX_SIZE: u64 = 0x0200_0000;

/// Double SHA-256, returned in internal byte order.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Append-only serializer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32_le(v);
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    pub fn put_i64(&mut self, v: i64) -> &mut Self {
        self.buf.put_i64_le(v);
        self
    }

    /// Hash in internal order.
    pub fn put_hash(&mut self, h: &Hash256) -> &mut Self {
        self.buf.put_slice(&h.reversed());
        self
    }

    pub fn put_compact_size(&mut self, n: u64) -> &mut Self {
        if n < 253 {
            self.buf.put_u8(n as u8);
        } else if n <= 0xffff {
            self.buf.put_u8(253);
            self.buf.put_u16_le(n as u16);
        } else if n <= 0xffff_ffff {
            self.buf.put_u8(254);
            self.buf.put_u32_le(n as u32);
        } else {
            self.buf.put_u8(255);
            self.buf.put_u64_le(n);
        }
        self
    }

    /// Length-prefixed byte string.
    pub fn put_var_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.put_compact_size(data.len() as u64);
        self.buf.put_slice(data);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Reader over a byte slice.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> ConsensusResult<()> {
        if self.buf.remaining() < n {
            return Err(ConsensusError::Decode(format!(
                "unexpected end of data: need {} bytes, have {}",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn get_u8(&mut self) -> ConsensusResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn get_u16(&mut self) -> ConsensusResult<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn get_u32(&mut self) -> ConsensusResult<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn get_i32(&mut self) -> ConsensusResult<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn get_u64(&mut self) -> ConsensusResult<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn get_i64(&mut self) -> ConsensusResult<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    /// Hash stored in internal order.
    pub fn get_hash(&mut self) -> ConsensusResult<Hash256> {
        self.need(32)?;
        let mut bytes = [0u8; 32];
        self.buf.copy_to_slice(&mut bytes);
        Ok(Hash256::from_reversed(bytes))
    }

    /// Compact size with the canonical-encoding and range checks.
    pub fn get_compact_size(&mut self) -> ConsensusResult<u64> {
        let first = self.get_u8()?;
        let n = match first {
            0..=252 => u64::from(first),
            253 => {
                let v = u64::from(self.get_u16()?);
                if v < 253 {
                    return Err(ConsensusError::Decode("non-canonical compact size".into()));
                }
                v
            }
            254 => {
                let v = u64::from(self.get_u32()?);
                if v < 0x1_0000 {
                    return Err(ConsensusError::Decode("non-canonical compact size".into()));
                }
                v
            }
            255 => {
                let v = self.get_u64()?;
                if v < 0x1_0000_0000 {
                    return Err(ConsensusError::Decode("non-canonical compact size".into()));
                }
                v
            }
        };
        if n > MAX_SIZE {
            return Err(ConsensusError::Decode(format!("compact size {} too large", n)));
        }
        Ok(n)
    }

    pub fn get_var_bytes(&mut self) -> ConsensusResult<Vec<u8>> {
        let len = self.get_compact_size()? as usize;
        self.need(len)?;
        let mut out = vec![0u8; len];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Fail unless every byte was consumed.
    pub fn finish(&self) -> ConsensusResult<()> {
        if self.buf.has_remaining() {
            return Err(ConsensusError::Decode(format!(
                "{} trailing bytes",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}
