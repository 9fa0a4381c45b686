//! Mempool dump and reload.

use crate::entry::NewEntry;
use crate::pool::Mempool;
use crate::{MempoolError, MempoolResult};
use betg_consensus::{Amount, CoinsView, Transaction};
use betg_pow::Hash256;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const DUMP_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct MempoolDump {
    version: u32,
    entries: Vec<DumpedEntry>,
    deltas: Vec<DumpedDelta>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DumpedEntry {
    /// Raw transaction, hex encoded.
    tx: String,
    fee: Amount,
    time: i64,
    sequence: u64,
    entry_height: u32,
    spends_coinbase: bool,
    sigop_cost: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct DumpedDelta {
    txid: Hash256,
    delta: Amount,
}

/// Result of a reload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub loaded: usize,
    /// Entries whose inputs are gone or already spent.
    pub skipped: usize,
    pub deltas: usize,
}

impl Mempool {
    /// Write every entry and outstanding priority delta to `path`.
    pub fn dump(&self, path: &Path) -> MempoolResult<usize> {
        let dump = {
            let inner = self.inner.read();
            let mut entries: Vec<DumpedEntry> = inner
                .entries
                .values()
                .map(|entry| DumpedEntry {
                    tx: hex::encode(entry.tx.encode()),
                    fee: entry.fee,
                    time: entry.time,
                    sequence: entry.sequence,
                    entry_height: entry.entry_height,
                    spends_coinbase: entry.spends_coinbase,
                    sigop_cost: entry.sigop_cost,
                })
                .collect();
            entries.sort_by_key(|entry| entry.sequence);
            let mut deltas: Vec<DumpedDelta> = inner
                .deltas
                .iter()
                .map(|(txid, delta)| DumpedDelta {
                    txid: *txid,
                    delta: *delta,
                })
                .collect();
            deltas.sort_by_key(|d| d.txid);
            MempoolDump {
                version: DUMP_VERSION,
                entries,
                deltas,
            }
        };

        let json = serde_json::to_vec_pretty(&dump)
            .map_err(|e| MempoolError::Persistence(e.to_string()))?;
        let tmp = path.with_extension("new");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;

        info!(entries = dump.entries.len(), path = %path.display(), "Dumped mempool");
        Ok(dump.entries.len())
    }

    /// Reinsert entries from a dump, in their original order.
    ///
    /// Entries keep their sequence numbers and times. An entry is skipped
    /// when one of its inputs is neither in `coins` nor created by an
    /// earlier reloaded entry, or is already spent in the pool.
    pub fn load(&self, path: &Path, coins: &dyn CoinsView) -> MempoolResult<LoadStats> {
        let bytes = fs::read(path)?;
        let mut dump: MempoolDump =
            serde_json::from_slice(&bytes).map_err(|e| MempoolError::Persistence(e.to_string()))?;
        if dump.version != DUMP_VERSION {
            return Err(MempoolError::Persistence(format!(
                "unsupported dump version {}",
                dump.version
            )));
        }
        dump.entries.sort_by_key(|entry| entry.sequence);

        let mut stats = LoadStats::default();
        let mut inner = self.inner.write();
        for delta in &dump.deltas {
            let stored = inner.deltas.entry(delta.txid).or_insert(0);
            *stored = stored.saturating_add(delta.delta);
            stats.deltas += 1;
        }

        for dumped in dump.entries {
            let raw =
                hex::decode(&dumped.tx).map_err(|e| MempoolError::Persistence(e.to_string()))?;
            let tx = Transaction::decode(&raw)?;
            let txid = tx.txid();

            let available = tx.inputs.iter().all(|input| {
                let created_in_pool = inner
                    .entries
                    .get(&input.prevout.txid)
                    .is_some_and(|parent| (input.prevout.vout as usize) < parent.tx.outputs.len());
                (created_in_pool || coins.have_coin(&input.prevout))
                    && !inner.spenders.contains_key(&input.prevout)
            });
            if inner.entries.contains_key(&txid) || !available {
                warn!(%txid, "Skipping unloadable mempool entry");
                stats.skipped += 1;
                continue;
            }

            inner.insert(
                NewEntry {
                    tx: Arc::new(tx),
                    fee: dumped.fee,
                    time: dumped.time,
                    entry_height: dumped.entry_height,
                    spends_coinbase: dumped.spends_coinbase,
                    sigop_cost: dumped.sigop_cost,
                },
                Some(dumped.sequence),
            );
            stats.loaded += 1;
        }

        info!(
            loaded = stats.loaded,
            skipped = stats.skipped,
            deltas = stats.deltas,
            "Loaded mempool"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::tests::{confirmed, spend};
    use betg_consensus::params::COIN;
    use betg_consensus::{Coin, MemoryCoins, OutPoint, Script, TxOut};

    fn coins_for(tags: &[u8]) -> MemoryCoins {
        let mut coins = MemoryCoins::new();
        for &tag in tags {
            coins.add_coin(
                confirmed(tag),
                Coin::new(TxOut::new(10 * COIN, Script::new()), 1, false),
            );
        }
        coins
    }

    // ============ Persistence Tests ============

    #[test]
    fn test_dump_load_preserves_order_and_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mempool.json");

        let pool = Mempool::default();
        let first = spend(&[confirmed(1)], 1, 1);
        let second = spend(&[confirmed(2)], 1, 2);
        let child = spend(&[OutPoint::new(first.txid(), 0)], 1, 3);
        // Equal feerates so only sequence orders them.
        for tx in [&first, &second, &child] {
            pool.add_unchecked(NewEntry::new(tx.clone(), 1_000).time(42)).unwrap();
        }
        pool.prioritise_transaction(&second.txid(), 500);
        let absent = Hash256::new([9; 32]);
        pool.prioritise_transaction(&absent, -7);
        assert_eq!(pool.dump(&path).unwrap(), 3);

        let restored = Mempool::default();
        let stats = restored.load(&path, &coins_for(&[1, 2])).unwrap();
        assert_eq!(
            stats,
            LoadStats {
                loaded: 3,
                skipped: 0,
                deltas: 2
            }
        );
        assert_eq!(restored.txids(), pool.txids());
        assert_eq!(restored.fee_delta(&absent), -7);

        let entry = restored.get(&second.txid()).unwrap();
        assert_eq!(entry.modified_fee(), 1_500);
        assert_eq!(entry.time, 42);
        assert_eq!(entry.sequence, pool.get(&second.txid()).unwrap().sequence);
        assert_eq!(restored.get(&child.txid()).unwrap().ancestor_count, 2);
        assert!(restored.check_consistency().is_ok());

        // New arrivals continue after the loaded sequences.
        let late = spend(&[confirmed(3)], 1, 4);
        restored.add_unchecked(NewEntry::new(late.clone(), 1)).unwrap();
        assert!(restored.get(&late.txid()).unwrap().sequence > entry.sequence);

        let view = restored.read();
        let tie_order: Vec<Hash256> = view
            .by_ancestor_score()
            .filter(|e| e.txid == first.txid() || e.txid == child.txid())
            .map(|e| e.txid)
            .collect();
        assert_eq!(tie_order, vec![first.txid(), child.txid()]);
    }

    #[test]
    fn test_load_skips_spent_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mempool.json");

        let pool = Mempool::default();
        let kept = spend(&[confirmed(1)], 1, 1);
        let gone = spend(&[confirmed(2)], 1, 2);
        let orphaned = spend(&[OutPoint::new(gone.txid(), 0)], 1, 3);
        for tx in [&kept, &gone, &orphaned] {
            pool.add_unchecked(NewEntry::new(tx.clone(), 1_000)).unwrap();
        }
        pool.dump(&path).unwrap();

        let restored = Mempool::default();
        let stats = restored.load(&path, &coins_for(&[1])).unwrap();
        assert_eq!(stats.loaded, 1);
        assert_eq!(stats.skipped, 2);
        assert_eq!(restored.txids(), vec![kept.txid()]);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mempool.json");
        std::fs::write(&path, b"not json").unwrap();
        let err = Mempool::default().load(&path, &MemoryCoins::new()).unwrap_err();
        assert_eq!(err.reason(), "persistence");

        let missing = dir.path().join("absent.json");
        assert!(matches!(
            Mempool::default().load(&missing, &MemoryCoins::new()),
            Err(MempoolError::Io(_))
        ));
    }
}
