//! Transactions.
//!
//! Legacy (non-witness) serialization only. The txid is double SHA-256 of
//! that serialization, shown in reversed byte order.

use crate::encode::{sha256d, Decoder, Encoder};
use crate::params::WITNESS_SCALE_FACTOR;
use crate::script::Script;
use crate::ConsensusResult;
use betg_pow::Hash256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Amount in base units. Signed so that arithmetic on deltas stays natural.
pub type Amount = i64;

/// Reference to a transaction output.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash256,
    pub vout: u32,
}

impl OutPoint {
    /// The prevout of a coinbase input.
    pub const NULL: OutPoint = OutPoint {
        txid: Hash256::ZERO,
        vout: u32::MAX,
    };

    pub fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }

    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.vout == u32::MAX
    }
}

impl fmt::Debug for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Script,
    pub sequence: u32,
}

impl TxIn {
    /// Sequence value that disables both locktime and relative locks.
    pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;
    /// Largest sequence that still enables nLockTime.
    pub const MAX_SEQUENCE_NONFINAL: u32 = Self::SEQUENCE_FINAL - 1;
    /// Set: the input has no relative lock.
    pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
    /// Set: the relative lock is in units of 512 seconds, otherwise blocks.
    pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
    /// Bits holding the relative lock value.
    pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;
    /// Time-based relative locks are shifted by this many bits.
    pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

    pub fn new(prevout: OutPoint, script_sig: Script) -> Self {
        Self {
            prevout,
            script_sig,
            sequence: Self::SEQUENCE_FINAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Script,
}

impl TxOut {
    pub fn new(value: Amount, script_pubkey: Script) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }
}

/// A transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            version: 2,
            inputs: Vec::new(),
            outputs: Vec::new(),
            lock_time: 0,
        }
    }
}

impl Transaction {
    /// One input with a null prevout.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    pub fn encode_into(&self, enc: &mut Encoder) {
        enc.put_i32(self.version);
        enc.put_compact_size(self.inputs.len() as u64);
        for input in &self.inputs {
            enc.put_hash(&input.prevout.txid);
            enc.put_u32(input.prevout.vout);
            enc.put_var_bytes(input.script_sig.as_bytes());
            enc.put_u32(input.sequence);
        }
        enc.put_compact_size(self.outputs.len() as u64);
        for output in &self.outputs {
            enc.put_i64(output.value);
            enc.put_var_bytes(output.script_pubkey.as_bytes());
        }
        enc.put_u32(self.lock_time);
    }

    /// Legacy serialization.
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(128);
        self.encode_into(&mut enc);
        enc.into_bytes()
    }

    pub fn decode_from(dec: &mut Decoder<'_>) -> ConsensusResult<Self> {
        let version = dec.get_i32()?;
        let n_in = dec.get_compact_size()? as usize;
        let mut inputs = Vec::with_capacity(n_in.min(1024));
        for _ in 0..n_in {
            let txid = dec.get_hash()?;
            let vout = dec.get_u32()?;
            let script_sig = Script(dec.get_var_bytes()?);
            let sequence = dec.get_u32()?;
            inputs.push(TxIn {
                prevout: OutPoint { txid, vout },
                script_sig,
                sequence,
            });
        }
        let n_out = dec.get_compact_size()? as usize;
        let mut outputs = Vec::with_capacity(n_out.min(1024));
        for _ in 0..n_out {
            let value = dec.get_i64()?;
            let script_pubkey = Script(dec.get_var_bytes()?);
            outputs.push(TxOut {
                value,
                script_pubkey,
            });
        }
        let lock_time = dec.get_u32()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    /// Parse a complete serialized transaction.
    pub fn decode(bytes: &[u8]) -> ConsensusResult<Self> {
        let mut dec = Decoder::new(bytes);
        let tx = Self::decode_from(&mut dec)?;
        dec.finish()?;
        Ok(tx)
    }

    pub fn txid(&self) -> Hash256 {
        Hash256::from_reversed(sha256d(&self.encode()))
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> usize {
        self.encode().len()
    }

    /// Weight: size scaled by the witness factor (no witness data exists).
    pub fn weight(&self) -> u64 {
        self.size() as u64 * WITNESS_SCALE_FACTOR
    }

    /// Virtual size, rounded up.
    pub fn vsize(&self) -> u64 {
        self.weight().div_ceil(WITNESS_SCALE_FACTOR)
    }

    /// Legacy signature operations in every scriptSig and scriptPubKey.
    pub fn legacy_sigop_count(&self) -> u32 {
        let ins: u32 = self
            .inputs
            .iter()
            .map(|i| i.script_sig.sigop_count(false))
            .sum();
        let outs: u32 = self
            .outputs
            .iter()
            .map(|o| o.script_pubkey.sigop_count(false))
            .sum();
        ins + outs
    }

    /// Sum of output values, or `None` on overflow.
    pub fn value_out(&self) -> Option<Amount> {
        self.outputs
            .iter()
            .try_fold(0i64, |acc, o| acc.checked_add(o.value))
    }
}
