//! Script byte strings.
//!
//! Scripts are opaque to consensus except for three things: building pushes
//! (coinbase height, genesis message), counting legacy signature operations,
//! and recognising pay-to-script-hash outputs for sigop accounting.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opcodes referenced by consensus code.
pub mod opcodes {
    pub const OP_0: u8 = 0x00;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_PUSHDATA4: u8 = 0x4e;
    pub const OP_1NEGATE: u8 = 0x4f;
    pub const OP_1: u8 = 0x51;
    pub const OP_2: u8 = 0x52;
    pub const OP_16: u8 = 0x60;
    pub const OP_NOP: u8 = 0x61;
    pub const OP_RETURN: u8 = 0x6a;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKSIGVERIFY: u8 = 0xad;
    pub const OP_CHECKMULTISIG: u8 = 0xae;
    pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
}

use opcodes::*;

/// Sigops charged for a CHECKMULTISIG when the key count is not counted.
const MAX_PUBKEYS_PER_MULTISIG: u32 = 20;

/// A script as raw bytes.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Script(#[serde(with = "hex")] pub Vec<u8>);

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a bare opcode.
    pub fn push_opcode(mut self, op: u8) -> Self {
        self.0.push(op);
        self
    }

    /// Append an integer using the small-int opcodes where possible.
    pub fn push_int(mut self, n: i64) -> Self {
        if n == -1 || (1..=16).contains(&n) {
            self.0.push((n + i64::from(OP_1) - 1) as u8);
            self
        } else if n == 0 {
            self.0.push(OP_0);
            self
        } else {
            let encoded = encode_script_num(n);
            self.push_slice(&encoded)
        }
    }

    /// Append a minimal-length numeric push, always as data (never a small-int opcode).
    pub fn push_num(self, n: i64) -> Self {
        let encoded = encode_script_num(n);
        self.push_slice(&encoded)
    }

    /// Append a data push with the shortest push opcode.
    pub fn push_slice(mut self, data: &[u8]) -> Self {
        let len = data.len();
        if len < OP_PUSHDATA1 as usize {
            self.0.push(len as u8);
        } else if len <= 0xff {
            self.0.push(OP_PUSHDATA1);
            self.0.push(len as u8);
        } else if len <= 0xffff {
            self.0.push(OP_PUSHDATA2);
            self.0.extend_from_slice(&(len as u16).to_le_bytes());
        } else {
            self.0.push(OP_PUSHDATA4);
            self.0.extend_from_slice(&(len as u32).to_le_bytes());
        }
        self.0.extend_from_slice(data);
        self
    }

    /// Iterate over `(opcode, push data)` pairs. Stops at the first malformed push.
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions {
            bytes: &self.0,
            pos: 0,
        }
    }

    /// Signature operation count.
    ///
    /// With `accurate` set, a CHECKMULTISIG preceded by OP_1..OP_16 counts
    /// that many keys; otherwise it counts 20.
    pub fn sigop_count(&self, accurate: bool) -> u32 {
        let mut count = 0u32;
        let mut last_op = 0xffu8;
        for (op, _) in self.instructions() {
            match op {
                OP_CHECKSIG | OP_CHECKSIGVERIFY => count += 1,
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    if accurate && (OP_1..=OP_16).contains(&last_op) {
                        count += u32::from(last_op - OP_1 + 1);
                    } else {
                        count += MAX_PUBKEYS_PER_MULTISIG;
                    }
                }
                _ => {}
            }
            last_op = op;
        }
        count
    }

    /// `OP_HASH160 <20 bytes> OP_EQUAL`.
    pub fn is_pay_to_script_hash(&self) -> bool {
        self.0.len() == 23 && self.0[0] == OP_HASH160 && self.0[1] == 0x14 && self.0[22] == OP_EQUAL
    }

    /// True if the script contains only well-formed push operations.
    pub fn is_push_only(&self) -> bool {
        let mut iter = self.instructions();
        for (op, _) in iter.by_ref() {
            if op > OP_16 {
                return false;
            }
        }
        iter.pos == self.0.len()
    }

    /// Sigops of the redeem script in a P2SH spend: the last push of `script_sig`.
    pub fn p2sh_sigop_count(&self, script_sig: &Script) -> u32 {
        if !self.is_pay_to_script_hash() {
            return 0;
        }
        let mut last_data: Option<&[u8]> = None;
        for (op, data) in script_sig.instructions() {
            if op > OP_16 {
                return 0;
            }
            last_data = data;
        }
        match last_data {
            Some(redeem) => Script::from_bytes(redeem).sigop_count(true),
            None => 0,
        }
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script({})", hex::encode(&self.0))
    }
}

impl From<Vec<u8>> for Script {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Iterator over script operations.
pub struct Instructions<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Instructions<'a> {
    /// Decode the operation at `pos`, returning it with the next position.
    fn decode_at(&self, pos: usize) -> Option<(u8, Option<&'a [u8]>, usize)> {
        let bytes = self.bytes;
        let op = *bytes.get(pos)?;
        let mut pos = pos + 1;

        let len = match op {
            0x01..=0x4b => op as usize,
            OP_PUSHDATA1 => {
                let n = *bytes.get(pos)? as usize;
                pos += 1;
                n
            }
            OP_PUSHDATA2 => {
                let b = bytes.get(pos..pos + 2)?;
                pos += 2;
                u16::from_le_bytes([b[0], b[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let b = bytes.get(pos..pos + 4)?;
                pos += 4;
                u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
            }
            _ => return Some((op, None, pos)),
        };

        let end = pos.checked_add(len)?;
        let data = bytes.get(pos..end)?;
        Some((op, Some(data), end))
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = (u8, Option<&'a [u8]>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        match self.decode_at(self.pos) {
            Some((op, data, next)) => {
                self.pos = next;
                Some((op, data))
            }
            None => {
                // Malformed push: park past the end so callers can tell.
                self.pos = self.bytes.len() + 1;
                None
            }
        }
    }
}

/// Minimal little-endian sign-magnitude encoding.
fn encode_script_num(n: i64) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    let negative = n < 0;
    let mut abs = n.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let last = out.len() - 1;
    if out[last] & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        out[last] |= 0x80;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_int() {
        assert_eq!(Script::new().push_int(0).0, vec![OP_0]);
        assert_eq!(Script::new().push_int(1).0, vec![OP_1]);
        assert_eq!(Script::new().push_int(16).0, vec![OP_16]);
        assert_eq!(Script::new().push_int(-1).0, vec![OP_1NEGATE]);
        assert_eq!(Script::new().push_int(17).0, vec![0x01, 0x11]);
        assert_eq!(Script::new().push_int(128).0, vec![0x02, 0x80, 0x00]);
        assert_eq!(
            Script::new().push_int(0x1f0a_ffff).0,
            vec![0x04, 0xff, 0xff, 0x0a, 0x1f]
        );
    }

    #[test]
    fn test_push_num_is_always_data() {
        assert_eq!(Script::new().push_num(4).0, vec![0x01, 0x04]);
        assert_eq!(Script::new().push_num(-5).0, vec![0x01, 0x85]);
    }

    #[test]
    fn test_push_slice_pushdata1() {
        let data = vec![0xab; 90];
        let s = Script::new().push_slice(&data);
        assert_eq!(s.0[0], OP_PUSHDATA1);
        assert_eq!(s.0[1], 90);
        assert_eq!(s.len(), 92);
    }

    #[test]
    fn test_sigop_count() {
        let s = Script::new()
            .push_opcode(OP_0)
            .push_opcode(OP_0)
            .push_opcode(OP_0)
            .push_opcode(OP_NOP)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_1);
        assert_eq!(s.sigop_count(false), 20);

        let s = Script::new()
            .push_opcode(OP_2)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_CHECKSIG);
        assert_eq!(s.sigop_count(false), 21);
        assert_eq!(s.sigop_count(true), 3);
    }

    #[test]
    fn test_p2sh_sigops() {
        let redeem = Script::new()
            .push_opcode(OP_1)
            .push_opcode(OP_CHECKMULTISIG);
        let mut spk = vec![OP_HASH160, 0x14];
        spk.extend_from_slice(&[0u8; 20]);
        spk.push(OP_EQUAL);
        let spk = Script(spk);
        assert!(spk.is_pay_to_script_hash());

        let sig = Script::new().push_slice(redeem.as_bytes());
        assert_eq!(spk.p2sh_sigop_count(&sig), 1);
    }

    #[test]
    fn test_malformed_push_stops_iteration() {
        let s = Script(vec![OP_CHECKSIG, 0x05, 0x01]);
        assert_eq!(s.instructions().count(), 1);
        assert_eq!(s.sigop_count(false), 1);
        assert!(!s.is_push_only());
    }
}
