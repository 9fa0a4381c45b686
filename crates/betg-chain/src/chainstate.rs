//! Header acceptance, block connection and best-chain activation.
//!
//! All mutable chain state lives behind one `RwLock`. Header insertion,
//! candidate selection and the switch to a new tip happen under the same
//! write lock, so readers never observe a tip that is not fully connected.

use crate::index::{ActiveChain, BlockStatus, CandidateKey, ChainIndex, NodeId};
use crate::store::{BlockStore, MemoryBlockStore};
use crate::{ChainError, ChainResult};
use betg_consensus::validation::{self, flags, ConnectContext, HeaderContext};
use betg_consensus::{
    get_next_work_required, AcceptAllVerifier, Block, BlockFailure, BlockHeader, ChainParams,
    CoinsOverlay, ConsensusError, ConsensusResult, InputVerifier, MemoryCoins,
};
use betg_pow::{EpochContextCache, Hash256};
use num_bigint::BigUint;
use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, instrument, warn};

/// Chain selection result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainSelection {
    /// The active chain grew on top of the previous tip.
    Extended,
    /// The active chain switched branches.
    Reorg {
        /// Height of the last common block.
        fork_height: u32,
        /// Blocks disconnected from the previous branch.
        rollback_count: u32,
    },
    /// The active tip did not change.
    Ignored,
}

/// Summary of a chain tip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipInfo {
    pub hash: Hash256,
    pub height: u32,
    pub time: u32,
    pub bits: u32,
    pub median_time_past: i64,
    #[serde(with = "chain_work_hex")]
    pub chain_work: BigUint,
}

mod chain_work_hex {
    use num_bigint::BigUint;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(work: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:064x}", work))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(deserializer)?;
        BigUint::parse_bytes(s.as_bytes(), 16)
            .ok_or_else(|| de::Error::custom(format!("invalid chain work '{}'", s)))
    }
}

/// What changed when a block was processed.
#[derive(Debug, Clone)]
pub struct TipUpdate {
    pub selection: ChainSelection,
    /// Newly connected blocks, lowest first.
    pub connected: Vec<Arc<Block>>,
    /// Disconnected blocks, previous tip first.
    pub disconnected: Vec<Arc<Block>>,
    /// Blocks that failed to connect and were marked invalid.
    pub rejected: Vec<(Hash256, ConsensusError)>,
    pub tip: TipInfo,
}

impl TipUpdate {
    pub fn rejection_of(&self, hash: &Hash256) -> Option<&ConsensusError> {
        self.rejected
            .iter()
            .find(|(h, _)| h == hash)
            .map(|(_, err)| err)
    }
}

fn tip_info(index: &ChainIndex, id: NodeId) -> TipInfo {
    let node = index.get(id);
    TipInfo {
        hash: node.hash,
        height: node.height,
        time: node.header.time,
        bits: node.header.bits,
        median_time_past: index.median_time_past(id),
        chain_work: node.chain_work.clone(),
    }
}

struct ChainInner {
    index: ChainIndex,
    active: ActiveChain,
    coins: MemoryCoins,
    /// Nodes whose whole branch has data, ordered by preference.
    candidates: BTreeSet<CandidateKey>,
    /// Nodes with data waiting on an ancestor's data, keyed by parent.
    unlinked: HashMap<NodeId, Vec<NodeId>>,
    /// Headers rejected before they entered the index.
    failed_headers: HashSet<Hash256>,
}

impl ChainInner {
    fn mark_invalid(&mut self, id: NodeId) {
        for marked in self.index.mark_invalid(id) {
            let key = self.index.candidate_key(marked);
            self.candidates.remove(&key);
        }
    }

    fn mtp_at_active(&self, height: u32) -> i64 {
        self.active
            .at_height(height.min(self.active.height()))
            .map(|id| self.index.median_time_past(id))
            .unwrap_or_default()
    }
}

enum SwitchError {
    /// A block on the new branch broke a consensus rule.
    Invalid(NodeId, ConsensusError),
    Fatal(ChainError),
}

impl From<ChainError> for SwitchError {
    fn from(e: ChainError) -> Self {
        SwitchError::Fatal(e)
    }
}

impl From<ConsensusError> for SwitchError {
    fn from(e: ConsensusError) -> Self {
        SwitchError::Fatal(ChainError::Consensus(e))
    }
}

/// The block tree, the active chain and its coin set.
pub struct Chainstate {
    params: Arc<ChainParams>,
    epochs: Arc<EpochContextCache>,
    verifier: Arc<dyn InputVerifier>,
    store: Arc<dyn BlockStore>,
    inner: RwLock<ChainInner>,
    mock_time: AtomicI64,
}

impl Chainstate {
    /// Create a chainstate holding only the genesis block.
    pub fn new(
        params: Arc<ChainParams>,
        store: Arc<dyn BlockStore>,
        epochs: Arc<EpochContextCache>,
        verifier: Arc<dyn InputVerifier>,
    ) -> ChainResult<Self> {
        store.put_block(Arc::new(params.genesis.clone()))?;

        let index = ChainIndex::new(&params.genesis.header);
        let genesis = index.genesis();
        let mut coins = MemoryCoins::new();
        coins.set_best_block(params.genesis_hash);
        let mut candidates = BTreeSet::new();
        candidates.insert(index.candidate_key(genesis));

        info!(
            network = %params.network,
            genesis = %params.genesis_hash,
            "Chainstate initialized"
        );

        Ok(Self {
            params,
            epochs,
            verifier,
            store,
            inner: RwLock::new(ChainInner {
                index,
                active: ActiveChain::new(genesis),
                coins,
                candidates,
                unlinked: HashMap::new(),
                failed_headers: HashSet::new(),
            }),
            mock_time: AtomicI64::new(0),
        })
    }

    /// In-memory chainstate that accepts every script.
    pub fn in_memory(params: Arc<ChainParams>) -> ChainResult<Self> {
        Self::new(
            params,
            Arc::new(MemoryBlockStore::new()),
            Arc::new(EpochContextCache::new()),
            Arc::new(AcceptAllVerifier),
        )
    }

    pub fn params(&self) -> &Arc<ChainParams> {
        &self.params
    }

    pub fn epochs(&self) -> &Arc<EpochContextCache> {
        &self.epochs
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn verifier(&self) -> &Arc<dyn InputVerifier> {
        &self.verifier
    }

    /// Pin the clock used for future-timestamp checks. Zero restores the
    /// system clock.
    pub fn set_mock_time(&self, time: i64) {
        self.mock_time.store(time, Ordering::Relaxed);
    }

    pub fn adjusted_time(&self) -> i64 {
        match self.mock_time.load(Ordering::Relaxed) {
            0 => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or_default(),
            mock => mock,
        }
    }

    // ==================== Queries ====================

    pub fn tip(&self) -> TipInfo {
        let inner = self.inner.read();
        tip_info(&inner.index, inner.active.tip())
    }

    pub fn height(&self) -> u32 {
        self.inner.read().active.height()
    }

    /// Most-work header that is not known invalid, with or without data.
    pub fn best_header(&self) -> TipInfo {
        let inner = self.inner.read();
        tip_info(&inner.index, inner.index.best_header())
    }

    pub fn block_status(&self, hash: &Hash256) -> Option<BlockStatus> {
        let inner = self.inner.read();
        inner.index.lookup(hash).map(|id| inner.index.get(id).status)
    }

    pub fn block_hash_at(&self, height: u32) -> Option<Hash256> {
        let inner = self.inner.read();
        inner.active.at_height(height).map(|id| inner.index.get(id).hash)
    }

    pub fn get_block(&self, hash: &Hash256) -> ChainResult<Option<Arc<Block>>> {
        self.store.get_block(hash)
    }

    /// Read-locked view of the active chain.
    pub fn view(&self) -> ChainView<'_> {
        ChainView {
            inner: self.inner.read(),
            params: &self.params,
            adjusted_time: self.adjusted_time(),
        }
    }

    // ==================== Headers ====================

    fn header_context(
        &self,
        index: &ChainIndex,
        parent: NodeId,
        time: u32,
    ) -> ConsensusResult<HeaderContext> {
        let window = index.difficulty_window(parent, self.params.pow_target_window as usize);
        let expected_bits = get_next_work_required(&window, i64::from(time), &self.params)?;
        Ok(HeaderContext {
            prev_height: index.get(parent).height,
            expected_bits,
            median_time_past: index.median_time_past(parent),
            adjusted_time: self.adjusted_time(),
        })
    }

    /// Header checks run before the chain write lock is taken.
    ///
    /// The parent and height are resolved first so that a header never
    /// selects an epoch context its position in the chain does not justify.
    fn precheck_header(&self, header: &BlockHeader) -> ChainResult<()> {
        let hash = header.hash();
        let placed = {
            let inner = self.inner.read();
            if let Some(id) = inner.index.lookup(&hash) {
                if inner.index.get(id).status == BlockStatus::Invalid {
                    return Err(ChainError::CachedInvalid(hash));
                }
                return Ok(());
            }
            if inner.failed_headers.contains(&hash) {
                return Err(ChainError::CachedInvalid(hash));
            }

            let parent = inner
                .index
                .lookup(&header.prev_hash)
                .ok_or(ChainError::PrevNotFound(header.prev_hash))?;
            let parent = inner.index.get(parent);
            if parent.status == BlockStatus::Invalid {
                Err(ChainError::InvalidPrev(header.prev_hash))
            } else {
                validation::check_header_height(header, parent.height).map_err(ChainError::from)
            }
        };
        if let Err(e) = placed {
            self.inner.write().failed_headers.insert(hash);
            return Err(e);
        }

        let checked = validation::check_block_header(header, &self.params).and_then(|()| {
            validation::check_block_header_pow(header, &self.params, &self.epochs)
        });
        if let Err(e) = checked {
            if !e.is_transient() {
                self.inner.write().failed_headers.insert(hash);
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn accept_header_locked(
        &self,
        inner: &mut ChainInner,
        header: &BlockHeader,
    ) -> ChainResult<NodeId> {
        let hash = header.hash();
        if let Some(id) = inner.index.lookup(&hash) {
            if inner.index.get(id).status == BlockStatus::Invalid {
                return Err(ChainError::CachedInvalid(hash));
            }
            return Ok(id);
        }
        if inner.failed_headers.contains(&hash) {
            return Err(ChainError::CachedInvalid(hash));
        }

        let parent = inner
            .index
            .lookup(&header.prev_hash)
            .ok_or(ChainError::PrevNotFound(header.prev_hash))?;
        if inner.index.get(parent).status == BlockStatus::Invalid {
            inner.failed_headers.insert(hash);
            return Err(ChainError::InvalidPrev(header.prev_hash));
        }

        let ctx = self.header_context(&inner.index, parent, header.time)?;
        if let Err(e) = validation::contextual_check_block_header(header, &ctx) {
            if !e.is_transient() {
                inner.failed_headers.insert(hash);
            }
            return Err(e.into());
        }

        let id = inner
            .index
            .insert(header.clone())
            .ok_or(ChainError::PrevNotFound(header.prev_hash))?;
        debug!(height = header.height, %hash, "Accepted header");
        Ok(id)
    }

    /// Validate and index a header without its block.
    #[instrument(skip(self, header), fields(height = header.height))]
    pub fn accept_header(&self, header: &BlockHeader) -> ChainResult<Hash256> {
        self.precheck_header(header)?;
        let mut inner = self.inner.write();
        self.accept_header_locked(&mut inner, header)?;
        Ok(header.hash())
    }

    // ==================== Blocks ====================

    fn receive_block_data(&self, inner: &mut ChainInner, id: NodeId) {
        inner.index.get_mut(id).has_data = true;
        if let Some(parent) = inner.index.get(id).parent {
            if !inner.index.get(parent).chain_complete {
                inner.unlinked.entry(parent).or_default().push(id);
                return;
            }
        }

        let mut queue = vec![id];
        while let Some(node_id) = queue.pop() {
            let node = inner.index.get_mut(node_id);
            node.chain_complete = true;
            if node.status != BlockStatus::Invalid {
                let key = inner.index.candidate_key(node_id);
                inner.candidates.insert(key);
            }
            if let Some(children) = inner.unlinked.remove(&node_id) {
                queue.extend(children);
            }
        }
    }

    /// Validate a full block, store it and move the active chain to the
    /// best candidate.
    ///
    /// Fails if the block itself is invalid. A block that is valid but not
    /// on the best chain returns `ChainSelection::Ignored`.
    #[instrument(skip(self, block), fields(height = block.header.height))]
    pub fn process_block(&self, block: Block) -> ChainResult<TipUpdate> {
        let hash = block.hash();
        self.precheck_header(&block.header)?;

        if let Err(e) = validation::check_block(&block, &self.params, false, true) {
            // A mutated block says nothing about its header.
            if !matches!(e, ConsensusError::Block { kind: BlockFailure::Mutated, .. }) {
                let mut inner = self.inner.write();
                match inner.index.lookup(&hash) {
                    Some(id) => inner.mark_invalid(id),
                    None => {
                        inner.failed_headers.insert(hash);
                    }
                }
            }
            return Err(e.into());
        }

        let mut inner = self.inner.write();
        let id = self.accept_header_locked(&mut inner, &block.header)?;
        if inner.index.get(id).has_data {
            return Err(ChainError::Duplicate(hash));
        }
        let parent = inner
            .index
            .get(id)
            .parent
            .ok_or(ChainError::Duplicate(hash))?;

        let prev_mtp = inner.index.median_time_past(parent);
        if let Err(e) = validation::contextual_check_block(&block, prev_mtp) {
            inner.mark_invalid(id);
            return Err(e.into());
        }

        self.store.put_block(Arc::new(block))?;
        self.receive_block_data(&mut inner, id);

        let update = self.activate_best_chain(&mut inner)?;
        if update.selection == ChainSelection::Ignored {
            if let Some(err) = update.rejection_of(&hash) {
                return Err(err.clone().into());
            }
        }
        Ok(update)
    }

    fn load_block(&self, hash: &Hash256) -> ChainResult<Arc<Block>> {
        self.store
            .get_block(hash)?
            .ok_or(ChainError::BlockNotFound(*hash))
    }

    fn activate_best_chain(&self, inner: &mut ChainInner) -> ChainResult<TipUpdate> {
        let old_tip = inner.active.tip();
        let mut connected = Vec::new();
        let mut disconnected = Vec::new();
        let mut rejected = Vec::new();

        loop {
            let best = match inner.candidates.iter().next_back() {
                Some(key) => key.id,
                None => break,
            };
            let tip = inner.active.tip();
            if best == tip || !inner.index.is_better(best, tip) {
                break;
            }

            match self.switch_to(inner, best) {
                Ok((down, up)) => {
                    disconnected = down;
                    connected = up;
                }
                Err(SwitchError::Invalid(id, err)) => {
                    let hash = inner.index.get(id).hash;
                    warn!(%hash, reason = err.reason(), "Block failed to connect");
                    inner.mark_invalid(id);
                    rejected.push((hash, err));
                }
                Err(SwitchError::Fatal(e)) => return Err(e),
            }
        }

        let new_tip = inner.active.tip();
        let tip_key = inner.index.candidate_key(new_tip);
        inner.candidates = inner.candidates.split_off(&tip_key);

        let selection = if new_tip == old_tip {
            ChainSelection::Ignored
        } else {
            let fork = inner.index.last_common_ancestor(old_tip, new_tip);
            if fork == old_tip {
                ChainSelection::Extended
            } else {
                let fork_height = inner.index.get(fork).height;
                ChainSelection::Reorg {
                    fork_height,
                    rollback_count: inner.index.get(old_tip).height - fork_height,
                }
            }
        };

        let tip = tip_info(&inner.index, new_tip);
        match &selection {
            ChainSelection::Extended => {
                info!(height = tip.height, hash = %tip.hash, "New best block");
            }
            ChainSelection::Reorg {
                fork_height,
                rollback_count,
            } => {
                warn!(
                    height = tip.height,
                    fork_height,
                    rollback_count,
                    chain_work = %tip.chain_work,
                    "Chain reorganization to higher cumulative work"
                );
            }
            ChainSelection::Ignored => {
                debug!(tip = %tip.hash, "Active tip unchanged");
            }
        }

        Ok(TipUpdate {
            selection,
            connected,
            disconnected,
            rejected,
            tip,
        })
    }

    /// Move the active chain to `target`. Nothing changes unless every block
    /// on the new branch connects.
    fn switch_to(
        &self,
        inner: &mut ChainInner,
        target: NodeId,
    ) -> Result<(Vec<Arc<Block>>, Vec<Arc<Block>>), SwitchError> {
        let ChainInner {
            index,
            active,
            coins,
            ..
        } = inner;
        let fork = active.find_fork(index, target);
        let mut overlay = CoinsOverlay::new(&*coins);

        let mut disconnected = Vec::new();
        let mut walk = active.tip();
        while walk != fork {
            let node = index.get(walk);
            let block = self.load_block(&node.hash)?;
            let undo = self
                .store
                .get_undo_data(&node.hash)?
                .ok_or(ChainError::UndoNotFound(node.hash))?;
            if !validation::disconnect_block(&block, &undo, &mut overlay)? {
                warn!(
                    height = node.height,
                    hash = %node.hash,
                    "Disconnect found inconsistent coins"
                );
            }
            disconnected.push(block);
            walk = node
                .parent
                .ok_or_else(|| ChainError::Inconsistent("fork below genesis".into()))?;
        }

        let mut path = Vec::new();
        let mut walk = target;
        while walk != fork {
            path.push(walk);
            walk = index
                .get(walk)
                .parent
                .ok_or_else(|| ChainError::Inconsistent("branch does not reach fork".into()))?;
        }
        path.reverse();

        let mut connected = Vec::with_capacity(path.len());
        let mut undos = Vec::with_capacity(path.len());
        for &id in &path {
            let node = index.get(id);
            let parent = node
                .parent
                .ok_or_else(|| ChainError::Inconsistent("connecting genesis".into()))?;
            let block = self.load_block(&node.hash)?;

            let mtp_at = |height: u32| {
                index
                    .get_ancestor(parent, height)
                    .map(|ancestor| index.median_time_past(ancestor))
                    .unwrap_or_default()
            };
            let ctx = ConnectContext {
                prev_mtp: index.median_time_past(parent),
                mtp_at: &mtp_at,
                script_flags: flags::BLOCK_SCRIPT_VERIFY_FLAGS,
            };
            let result = validation::connect_block(
                &block,
                &mut overlay,
                &self.params,
                &ctx,
                self.verifier.as_ref(),
            )
            .map_err(|e| SwitchError::Invalid(id, e))?;

            undos.push((node.hash, result.undo));
            connected.push(block);
        }

        let changes = overlay.into_changes();
        coins.apply(changes);
        for (hash, undo) in undos {
            self.store.put_undo(hash, undo)?;
        }
        for &id in &path {
            index.set_valid(id);
        }
        active.set_tip(index, target);
        Ok((disconnected, connected))
    }

    /// Run every rule except proof of work on `block` as the next block on
    /// the active tip. Nothing is stored.
    pub fn test_block_validity(&self, block: &Block) -> ChainResult<()> {
        let view = self.view();
        self.test_block_validity_in(&view, block)
    }

    /// `test_block_validity` under a view the caller already holds.
    pub fn test_block_validity_in(&self, view: &ChainView<'_>, block: &Block) -> ChainResult<()> {
        let inner: &ChainInner = &view.inner;
        let tip = inner.active.tip();
        if block.header.prev_hash != inner.index.get(tip).hash {
            return Err(
                ConsensusError::block("bad-prevblk", "block does not build on the tip").into(),
            );
        }

        let header_ctx = self.header_context(&inner.index, tip, block.header.time)?;
        validation::contextual_check_block_header(&block.header, &header_ctx)?;
        validation::check_block(block, &self.params, false, true)?;
        validation::contextual_check_block(block, header_ctx.median_time_past)?;

        let mut overlay = CoinsOverlay::new(&inner.coins);
        let mtp_at = |height: u32| inner.mtp_at_active(height);
        let ctx = ConnectContext {
            prev_mtp: header_ctx.median_time_past,
            mtp_at: &mtp_at,
            script_flags: flags::BLOCK_SCRIPT_VERIFY_FLAGS,
        };
        validation::connect_block(block, &mut overlay, &self.params, &ctx, self.verifier.as_ref())?;
        Ok(())
    }
}

/// Read-locked view of the active chain and its coins.
///
/// Holds the chain lock until dropped.
pub struct ChainView<'a> {
    inner: RwLockReadGuard<'a, ChainInner>,
    params: &'a ChainParams,
    adjusted_time: i64,
}

impl ChainView<'_> {
    pub fn tip(&self) -> TipInfo {
        tip_info(&self.inner.index, self.inner.active.tip())
    }

    pub fn height(&self) -> u32 {
        self.inner.active.height()
    }

    pub fn coins(&self) -> &MemoryCoins {
        &self.inner.coins
    }

    /// Median time past of the active block at `height`, clamped to the tip.
    pub fn median_time_past_at(&self, height: u32) -> i64 {
        self.inner.mtp_at_active(height)
    }

    /// Bits required for a block on the tip with timestamp `block_time`.
    pub fn next_work_required(&self, block_time: i64) -> ConsensusResult<u32> {
        let window = self
            .inner
            .index
            .difficulty_window(self.inner.active.tip(), self.params.pow_target_window as usize);
        get_next_work_required(&window, block_time, self.params)
    }

    pub fn block_hash_at(&self, height: u32) -> Option<Hash256> {
        self.inner
            .active
            .at_height(height)
            .map(|id| self.inner.index.get(id).hash)
    }

    pub fn adjusted_time(&self) -> i64 {
        self.adjusted_time
    }

    pub fn locator(&self) -> Vec<Hash256> {
        self.inner.active.locator(&self.inner.index)
    }
}
