//! Dataset item derivation.
//!
//! Every dataset item is computed from the light cache. Validators derive
//! the 64 items one hash needs directly from the light cache; miners keep a
//! `FullDataset` that memoizes items as they are first touched, so the
//! 1 GiB dataset is only ever partially materialized.

use crate::epoch::EpochContext;
use crate::hash::Hash512;
use crate::keccak::keccak512_item;
use crate::params::FULL_DATASET_ITEM_PARENTS;
use dashmap::DashMap;
use std::sync::Arc;

pub(crate) const FNV_PRIME: u32 = 0x0100_0193;
pub(crate) const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;

#[inline]
pub(crate) fn fnv1(u: u32, v: u32) -> u32 {
    u.wrapping_mul(FNV_PRIME) ^ v
}

#[inline]
pub(crate) fn fnv1a(u: u32, v: u32) -> u32 {
    (u ^ v).wrapping_mul(FNV_PRIME)
}

/// Four consecutive 512-bit dataset items, as read by one KawPow round.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Item2048(pub [u32; 64]);

impl Item2048 {
    /// Words per item.
    pub const WORDS: usize = 64;
}

impl std::fmt::Debug for Item2048 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Item2048({:08x}..)", self.0[0])
    }
}

/// Source of 2048-bit dataset items for one epoch.
pub trait DatasetLookup: Send + Sync {
    /// Epoch context backing the lookup.
    fn context(&self) -> &EpochContext;

    /// Item at `index`, in units of 2048 bits.
    fn item_2048(&self, index: u32) -> Item2048;
}

/// One 512-bit dataset item derived from the light cache.
pub(crate) fn calculate_dataset_item_512(context: &EpochContext, index: u32) -> Hash512 {
    let cache = context.light_cache();
    let num_cache_items = cache.len() as u32;

    let mut mix = cache[(index % num_cache_items) as usize];
    mix.0[0] ^= index;
    mix = keccak512_item(&mix);

    for j in 0..FULL_DATASET_ITEM_PARENTS {
        let t = fnv1(index ^ j, mix.0[(j % 16) as usize]);
        let parent = &cache[(t % num_cache_items) as usize];
        for (m, p) in mix.0.iter_mut().zip(parent.0.iter()) {
            *m = fnv1(*m, *p);
        }
    }

    keccak512_item(&mix)
}

/// One 2048-bit dataset item: 512-bit items `4i .. 4i+3` back to back.
pub(crate) fn calculate_dataset_item_2048(context: &EpochContext, index: u32) -> Item2048 {
    let mut out = [0u32; 64];
    for k in 0..4u32 {
        let item = calculate_dataset_item_512(context, index.wrapping_mul(4).wrapping_add(k));
        let start = (k as usize) * 16;
        out[start..start + 16].copy_from_slice(&item.0);
    }
    Item2048(out)
}

/// Full dataset materialized on demand.
///
/// Items are computed on first access and kept for the life of the value.
/// Concurrent readers of the same missing item may both compute it; the
/// result is identical so the second insert is harmless.
pub struct FullDataset {
    context: Arc<EpochContext>,
    items: DashMap<u32, Item2048>,
}

impl FullDataset {
    /// Wrap an epoch context.
    pub fn new(context: Arc<EpochContext>) -> Self {
        Self {
            context,
            items: DashMap::new(),
        }
    }

    /// Number of items materialized so far.
    pub fn materialized(&self) -> usize {
        self.items.len()
    }

    /// Shared epoch context.
    pub fn context_arc(&self) -> &Arc<EpochContext> {
        &self.context
    }
}

impl DatasetLookup for FullDataset {
    fn context(&self) -> &EpochContext {
        &self.context
    }

    fn item_2048(&self, index: u32) -> Item2048 {
        if let Some(item) = self.items.get(&index) {
            return *item;
        }
        let item = calculate_dataset_item_2048(&self.context, index);
        self.items.insert(index, item);
        item
    }
}

impl std::fmt::Debug for FullDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullDataset")
            .field("epoch", &self.context.epoch_number())
            .field("materialized", &self.items.len())
            .finish()
    }
}
