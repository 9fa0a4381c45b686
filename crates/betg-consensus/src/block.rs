//! Block headers and blocks.

use crate::difficulty::HeaderForDifficulty;
use crate::encode::{sha256d, Decoder, Encoder};
use crate::params::WITNESS_SCALE_FACTOR;
use crate::transaction::Transaction;
use crate::ConsensusResult;
use betg_pow::Hash256;
use serde::{Deserialize, Serialize};

/// Serialized header length.
pub const HEADER_SIZE: usize = 4 + 32 + 32 + 4 + 4 + 4 + 8 + 32;

/// Block header.
///
/// The nonce and mix digest seal the header; everything else goes into the
/// KawPow input hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u64,
    pub height: u32,
    pub mix_hash: Hash256,
}

impl BlockHeader {
    /// Double SHA-256 of the unsealed header, in display order.
    pub fn header_hash(&self) -> Hash256 {
        let mut enc = Encoder::with_capacity(80);
        enc.put_i32(self.version)
            .put_hash(&self.prev_hash)
            .put_hash(&self.merkle_root)
            .put_u32(self.time)
            .put_u32(self.bits)
            .put_u32(self.height);
        Hash256::from_reversed(sha256d(&enc.into_bytes()))
    }

    /// Block identity: the KawPow final digest over the carried mix.
    ///
    /// Does not check the mix; see `validation::check_block_header_pow`.
    pub fn hash(&self) -> Hash256 {
        betg_pow::hash_no_verify(&self.header_hash(), &self.mix_hash, self.nonce)
    }

    pub fn encode_into(&self, enc: &mut Encoder) {
        enc.put_i32(self.version)
            .put_hash(&self.prev_hash)
            .put_hash(&self.merkle_root)
            .put_u32(self.time)
            .put_u32(self.bits)
            .put_u32(self.height)
            .put_u64(self.nonce)
            .put_hash(&self.mix_hash);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(HEADER_SIZE);
        self.encode_into(&mut enc);
        enc.into_bytes()
    }

    pub fn decode_from(dec: &mut Decoder<'_>) -> ConsensusResult<Self> {
        Ok(Self {
            version: dec.get_i32()?,
            prev_hash: dec.get_hash()?,
            merkle_root: dec.get_hash()?,
            time: dec.get_u32()?,
            bits: dec.get_u32()?,
            height: dec.get_u32()?,
            nonce: dec.get_u64()?,
            mix_hash: dec.get_hash()?,
        })
    }

    pub fn decode(bytes: &[u8]) -> ConsensusResult<Self> {
        let mut dec = Decoder::new(bytes);
        let header = Self::decode_from(&mut dec)?;
        dec.finish()?;
        Ok(header)
    }

    pub fn for_difficulty(&self) -> HeaderForDifficulty {
        HeaderForDifficulty {
            height: self.height,
            time: self.time,
            bits: self.bits,
        }
    }
}

/// A header with its transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(HEADER_SIZE + 256 * self.transactions.len());
        self.header.encode_into(&mut enc);
        enc.put_compact_size(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_into(&mut enc);
        }
        enc.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ConsensusResult<Self> {
        let mut dec = Decoder::new(bytes);
        let header = BlockHeader::decode_from(&mut dec)?;
        let count = dec.get_compact_size()? as usize;
        let mut transactions = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            transactions.push(Transaction::decode_from(&mut dec)?);
        }
        dec.finish()?;
        Ok(Self {
            header,
            transactions,
        })
    }

    /// Serialized size times the witness scale factor.
    pub fn weight(&self) -> u64 {
        self.encode().len() as u64 * WITNESS_SCALE_FACTOR
    }
}

/// Merkle root over `hashes`, plus whether the tree is malleated.
///
/// A level containing two identical adjacent hashes at an even position can
/// be produced by a different transaction list with the same root, so it is
/// reported as mutated.
pub fn compute_merkle_root(hashes: &[Hash256]) -> (Hash256, bool) {
    if hashes.is_empty() {
        return (Hash256::ZERO, false);
    }
    let mut level: Vec<[u8; 32]> = hashes.iter().map(Hash256::reversed).collect();
    let mut mutated = false;

    while level.len() > 1 {
        for pair in level.chunks_exact(2) {
            if pair[0] == pair[1] {
                mutated = true;
            }
        }
        if level.len() % 2 == 1 {
            if let Some(&last) = level.last() {
                level.push(last);
            }
        }
        level = level
            .chunks_exact(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                sha256d(&buf)
            })
            .collect();
    }
    (Hash256::from_reversed(level[0]), mutated)
}

/// Merkle root over a block's transaction ids.
pub fn block_merkle_root(block: &Block) -> (Hash256, bool) {
    let txids: Vec<Hash256> = block.transactions.iter().map(Transaction::txid).collect();
    compute_merkle_root(&txids)
}
