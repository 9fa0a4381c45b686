//! Epoch context construction and caching.
//!
//! An epoch context holds everything a verifier needs for one 7500 block
//! epoch: the light cache (about 16 MiB at epoch 0) and the 16 KiB L1 cache
//! that KawPow reads on every round. The full dataset is never stored here;
//! its items are derived from the light cache on demand.

use crate::dataset::{calculate_dataset_item_2048, DatasetLookup, Item2048};
use crate::hash::{Hash256, Hash512};
use crate::keccak::{keccak256, keccak512, keccak512_item};
use crate::params::{
    EPOCH_LENGTH, FULL_DATASET_GROWTH, FULL_DATASET_INIT_SIZE, FULL_DATASET_ITEM_SIZE,
    L1_CACHE_WORDS, LIGHT_CACHE_GROWTH, LIGHT_CACHE_INIT_SIZE, LIGHT_CACHE_ITEM_SIZE,
    LIGHT_CACHE_ROUNDS, MAX_EPOCH_NUMBER,
};
use crate::{PowError, PowResult};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Light cache items processed between cancellation checks.
const BUILD_CHUNK: usize = 4096;

/// Epoch number for a block height.
pub fn get_epoch_number(height: u32) -> u32 {
    height / EPOCH_LENGTH
}

/// Seed for an epoch: Keccak-256 applied `epoch` times to 32 zero bytes.
pub fn calculate_epoch_seed(epoch: u32) -> Hash256 {
    let mut seed = Hash256::ZERO;
    for _ in 0..epoch {
        seed = keccak256(seed.as_bytes());
    }
    seed
}

/// Number of 512-bit items in the light cache.
pub fn calculate_light_cache_num_items(epoch: u32) -> u32 {
    let init = LIGHT_CACHE_INIT_SIZE / LIGHT_CACHE_ITEM_SIZE;
    let growth = LIGHT_CACHE_GROWTH / LIGHT_CACHE_ITEM_SIZE;
    find_largest_prime(init + u64::from(epoch) * growth)
}

/// Number of 1024-bit items in the full dataset.
pub fn calculate_full_dataset_num_items(epoch: u32) -> u32 {
    let init = FULL_DATASET_INIT_SIZE / FULL_DATASET_ITEM_SIZE;
    let growth = FULL_DATASET_GROWTH / FULL_DATASET_ITEM_SIZE;
    find_largest_prime(init + u64::from(epoch) * growth)
}

/// Largest prime not above `upper_bound`.
fn find_largest_prime(upper_bound: u64) -> u32 {
    let mut n = upper_bound;
    if n < 2 {
        return 0;
    }
    if n == 2 {
        return 2;
    }
    if n % 2 == 0 {
        n -= 1;
    }
    while !is_odd_prime(n) {
        n -= 2;
    }
    n as u32
}

/// Trial division; `n` must be odd and greater than 2.
fn is_odd_prime(n: u64) -> bool {
    let mut d = 3u64;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// Verification state for one epoch.
pub struct EpochContext {
    epoch_number: u32,
    light_cache: Vec<Hash512>,
    l1_cache: Vec<u32>,
    full_dataset_num_items: u32,
}

impl EpochContext {
    /// Build the context for an epoch.
    pub fn build(epoch_number: u32) -> PowResult<Self> {
        Self::build_interruptible(epoch_number, &AtomicBool::new(false))
    }

    /// Build the context, checking `cancel` between light cache chunks.
    ///
    /// Returns `PowError::Interrupted` if the flag is raised; no partial
    /// context escapes.
    pub fn build_interruptible(epoch_number: u32, cancel: &AtomicBool) -> PowResult<Self> {
        if epoch_number > MAX_EPOCH_NUMBER {
            return Err(PowError::EpochOutOfRange {
                epoch: epoch_number,
                max: MAX_EPOCH_NUMBER,
            });
        }

        let started = Instant::now();
        let seed = calculate_epoch_seed(epoch_number);
        let light_items = calculate_light_cache_num_items(epoch_number);
        let full_items = calculate_full_dataset_num_items(epoch_number);

        let light_cache = build_light_cache(light_items as usize, &seed, cancel)?;

        let mut context = Self {
            epoch_number,
            light_cache,
            l1_cache: Vec::new(),
            full_dataset_num_items: full_items,
        };

        // The L1 cache is the head of the dataset: 64 items of 2048 bits.
        let l1_items = L1_CACHE_WORDS / Item2048::WORDS;
        let mut l1_cache = Vec::with_capacity(L1_CACHE_WORDS);
        for index in 0..l1_items as u32 {
            let item = calculate_dataset_item_2048(&context, index);
            l1_cache.extend_from_slice(&item.0);
        }
        context.l1_cache = l1_cache;

        info!(
            epoch = epoch_number,
            light_items,
            full_items,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Built epoch context"
        );
        Ok(context)
    }

    /// Epoch this context belongs to.
    pub fn epoch_number(&self) -> u32 {
        self.epoch_number
    }

    /// True if `height` falls inside this epoch.
    pub fn covers(&self, height: u32) -> bool {
        get_epoch_number(height) == self.epoch_number
    }

    /// Light cache items.
    pub fn light_cache(&self) -> &[Hash512] {
        &self.light_cache
    }

    /// Number of light cache items.
    pub fn light_cache_num_items(&self) -> u32 {
        self.light_cache.len() as u32
    }

    /// L1 cache words.
    pub fn l1_cache(&self) -> &[u32] {
        &self.l1_cache
    }

    /// Number of 1024-bit items in the full dataset.
    pub fn full_dataset_num_items(&self) -> u32 {
        self.full_dataset_num_items
    }
}

impl DatasetLookup for EpochContext {
    fn context(&self) -> &EpochContext {
        self
    }

    fn item_2048(&self, index: u32) -> Item2048 {
        calculate_dataset_item_2048(self, index)
    }
}

impl fmt::Debug for EpochContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochContext")
            .field("epoch_number", &self.epoch_number)
            .field("light_cache_num_items", &self.light_cache.len())
            .field("full_dataset_num_items", &self.full_dataset_num_items)
            .finish()
    }
}

/// Sequential Keccak-512 fill followed by RandMemoHash rounds.
fn build_light_cache(
    num_items: usize,
    seed: &Hash256,
    cancel: &AtomicBool,
) -> PowResult<Vec<Hash512>> {
    let mut cache = Vec::with_capacity(num_items);
    let mut item = keccak512(seed.as_bytes());
    cache.push(item);
    for i in 1..num_items {
        if i % BUILD_CHUNK == 0 && cancel.load(Ordering::Relaxed) {
            return Err(PowError::Interrupted);
        }
        item = keccak512_item(&item);
        cache.push(item);
    }

    let n = num_items as u32;
    for round in 0..LIGHT_CACHE_ROUNDS {
        if cancel.load(Ordering::Relaxed) {
            return Err(PowError::Interrupted);
        }
        debug!(round, "Light cache RandMemoHash round");
        for i in 0..num_items {
            if i % BUILD_CHUNK == 0 && cancel.load(Ordering::Relaxed) {
                return Err(PowError::Interrupted);
            }
            let v = (cache[i].0[0] % n) as usize;
            let w = ((n as usize) + i - 1) % num_items;
            let x = cache[v].xor(&cache[w]);
            cache[i] = keccak512_item(&x);
        }
    }

    Ok(cache)
}

/// Process-wide single-slot epoch context cache.
///
/// Holds the most recently requested epoch. Switching epochs replaces the
/// slot; callers still holding the previous `Arc` keep it alive until they
/// drop it.
#[derive(Default)]
pub struct EpochContextCache {
    slot: Mutex<Option<Arc<EpochContext>>>,
}

impl EpochContextCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the context for `epoch`, building it if the slot holds another epoch.
    pub fn get_or_build(&self, epoch: u32) -> PowResult<Arc<EpochContext>> {
        self.get_or_build_interruptible(epoch, &AtomicBool::new(false))
    }

    /// Same as `get_or_build`, but the build can be cancelled.
    pub fn get_or_build_interruptible(
        &self,
        epoch: u32,
        cancel: &AtomicBool,
    ) -> PowResult<Arc<EpochContext>> {
        let mut slot = self.slot.lock();
        if let Some(ctx) = slot.as_ref() {
            if ctx.epoch_number() == epoch {
                return Ok(Arc::clone(ctx));
            }
        }

        debug!(epoch, previous = ?slot.as_ref().map(|c| c.epoch_number()), "Epoch cache miss");
        let ctx = Arc::new(EpochContext::build_interruptible(epoch, cancel)?);
        *slot = Some(Arc::clone(&ctx));
        Ok(ctx)
    }

    /// Context for the epoch containing `height`.
    pub fn for_height(&self, height: u32) -> PowResult<Arc<EpochContext>> {
        self.get_or_build(get_epoch_number(height))
    }

    /// Epoch currently held, if any.
    pub fn current_epoch(&self) -> Option<u32> {
        self.slot.lock().as_ref().map(|c| c.epoch_number())
    }
}

impl fmt::Debug for EpochContextCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochContextCache")
            .field("epoch", &self.current_epoch())
            .finish()
    }
}
