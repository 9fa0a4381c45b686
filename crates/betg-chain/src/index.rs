//! In-memory block index.
//!
//! Every accepted header becomes a `ChainNode` in an arena and is addressed
//! by `NodeId`. Nodes are never removed. A node's parent always has a lower
//! id, so a single forward pass over the arena visits parents before
//! children.

use betg_consensus::params::MEDIAN_TIME_SPAN;
use betg_consensus::{block_proof, BlockHeader, HeaderForDifficulty};
use betg_pow::Hash256;
use num_bigint::BigUint;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Index of a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Validation status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Header checks passed; the block has not been connected.
    Unvalidated,
    /// Connected successfully at least once.
    Valid,
    /// Failed validation, or descends from a node that did.
    Invalid,
}

/// A header in the block tree.
#[derive(Debug, Clone)]
pub struct ChainNode {
    pub header: BlockHeader,
    pub hash: Hash256,
    pub height: u32,
    pub parent: Option<NodeId>,
    /// Ancestor at `skip_height(height)`.
    pub skip: Option<NodeId>,
    /// Total work of the chain ending here.
    pub chain_work: BigUint,
    /// Order of first arrival.
    pub sequence_id: u64,
    pub status: BlockStatus,
    /// Full block data is stored.
    pub has_data: bool,
    /// This node and all its ancestors have data.
    pub chain_complete: bool,
}

impl ChainNode {
    pub fn for_difficulty(&self) -> HeaderForDifficulty {
        self.header.for_difficulty()
    }
}

/// Ordering key for tip selection: more work first, then earlier arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateKey {
    pub chain_work: BigUint,
    pub sequence_id: u64,
    pub id: NodeId,
}

impl Ord for CandidateKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.chain_work
            .cmp(&other.chain_work)
            .then_with(|| other.sequence_id.cmp(&self.sequence_id))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for CandidateKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn invert_lowest_one(n: u32) -> u32 {
    n & n.wrapping_sub(1)
}

/// Height of the skip target for a node at `height`.
///
/// Any height is reachable from any higher one in O(log n) skip and parent
/// steps.
pub fn skip_height(height: u32) -> u32 {
    if height < 2 {
        return 0;
    }
    if height & 1 == 1 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

/// Arena of every known header.
#[derive(Debug)]
pub struct ChainIndex {
    nodes: Vec<ChainNode>,
    by_hash: HashMap<Hash256, NodeId>,
    next_sequence: u64,
    best_header: NodeId,
}

impl ChainIndex {
    /// Index holding only `genesis`, which is valid and has data.
    pub fn new(genesis: &BlockHeader) -> Self {
        let hash = genesis.hash();
        let node = ChainNode {
            header: genesis.clone(),
            hash,
            height: genesis.height,
            parent: None,
            skip: None,
            chain_work: block_proof(genesis.bits),
            sequence_id: 0,
            status: BlockStatus::Valid,
            has_data: true,
            chain_complete: true,
        };
        let mut by_hash = HashMap::new();
        by_hash.insert(hash, NodeId(0));
        Self {
            nodes: vec![node],
            by_hash,
            next_sequence: 1,
            best_header: NodeId(0),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn genesis(&self) -> NodeId {
        NodeId(0)
    }

    pub fn get(&self, id: NodeId) -> &ChainNode {
        &self.nodes[id.0]
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> &mut ChainNode {
        &mut self.nodes[id.0]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<NodeId> {
        self.by_hash.get(hash).copied()
    }

    /// Header with the most work that is not invalid.
    pub fn best_header(&self) -> NodeId {
        self.best_header
    }

    pub fn candidate_key(&self, id: NodeId) -> CandidateKey {
        let node = self.get(id);
        CandidateKey {
            chain_work: node.chain_work.clone(),
            sequence_id: node.sequence_id,
            id,
        }
    }

    /// True if `a` should be preferred over `b` as a tip.
    pub fn is_better(&self, a: NodeId, b: NodeId) -> bool {
        self.candidate_key(a) > self.candidate_key(b)
    }

    /// Add a header whose parent is already indexed.
    ///
    /// Returns the existing id if the header is known. Returns `None` if the
    /// parent is unknown.
    pub fn insert(&mut self, header: BlockHeader) -> Option<NodeId> {
        let hash = header.hash();
        if let Some(id) = self.lookup(&hash) {
            return Some(id);
        }
        let parent = self.lookup(&header.prev_hash)?;

        let height = self.get(parent).height + 1;
        let skip = self.get_ancestor(parent, skip_height(height));
        let chain_work = &self.get(parent).chain_work + block_proof(header.bits);
        let status = match self.get(parent).status {
            BlockStatus::Invalid => BlockStatus::Invalid,
            _ => BlockStatus::Unvalidated,
        };

        let id = NodeId(self.nodes.len());
        self.nodes.push(ChainNode {
            header,
            hash,
            height,
            parent: Some(parent),
            skip,
            chain_work,
            sequence_id: self.next_sequence,
            status,
            has_data: false,
            chain_complete: false,
        });
        self.next_sequence += 1;
        self.by_hash.insert(hash, id);

        if status != BlockStatus::Invalid && self.is_better(id, self.best_header) {
            self.best_header = id;
        }
        Some(id)
    }

    /// Ancestor of `id` at `height`, or `None` if `height` is above it.
    pub fn get_ancestor(&self, id: NodeId, height: u32) -> Option<NodeId> {
        let mut walk = id;
        let mut walk_height = self.get(id).height;
        if height > walk_height {
            return None;
        }

        while walk_height > height {
            let node = self.get(walk);
            let h_skip = skip_height(walk_height);
            let h_skip_prev = skip_height(walk_height - 1);
            let take_skip = match node.skip {
                Some(_) => {
                    h_skip == height
                        || (h_skip > height
                            && !(i64::from(h_skip_prev) < i64::from(h_skip) - 2
                                && h_skip_prev >= height))
                }
                None => false,
            };
            match (take_skip, node.skip, node.parent) {
                (true, Some(skip), _) => {
                    walk = skip;
                    walk_height = h_skip;
                }
                (_, _, Some(parent)) => {
                    walk = parent;
                    walk_height -= 1;
                }
                _ => return None,
            }
        }
        Some(walk)
    }

    /// Deepest node that is an ancestor of both `a` and `b`.
    pub fn last_common_ancestor(&self, a: NodeId, b: NodeId) -> NodeId {
        let (ha, hb) = (self.get(a).height, self.get(b).height);
        let mut a = if ha > hb { self.get_ancestor(a, hb).unwrap_or(a) } else { a };
        let mut b = if hb > ha { self.get_ancestor(b, ha).unwrap_or(b) } else { b };

        while a != b {
            match (self.get(a).parent, self.get(b).parent) {
                (Some(pa), Some(pb)) => {
                    a = pa;
                    b = pb;
                }
                _ => break,
            }
        }
        a
    }

    /// Median timestamp of `id` and up to ten of its ancestors.
    pub fn median_time_past(&self, id: NodeId) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut walk = Some(id);
        while let Some(node_id) = walk {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let node = self.get(node_id);
            times.push(i64::from(node.header.time));
            walk = node.parent;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    /// Up to `len` headers ending at `id`, oldest first.
    pub fn difficulty_window(&self, id: NodeId, len: usize) -> Vec<HeaderForDifficulty> {
        let mut window = Vec::with_capacity(len);
        let mut walk = Some(id);
        while let Some(node_id) = walk {
            if window.len() == len {
                break;
            }
            let node = self.get(node_id);
            window.push(node.for_difficulty());
            walk = node.parent;
        }
        window.reverse();
        window
    }

    /// Mark `id` and every descendant invalid. Returns the newly marked nodes.
    pub fn mark_invalid(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut marked = Vec::new();
        if self.nodes[id.0].status != BlockStatus::Invalid {
            self.nodes[id.0].status = BlockStatus::Invalid;
            marked.push(id);
        }
        for i in id.0 + 1..self.nodes.len() {
            let parent_invalid = self.nodes[i]
                .parent
                .map(|p| self.nodes[p.0].status == BlockStatus::Invalid)
                .unwrap_or(false);
            if parent_invalid && self.nodes[i].status != BlockStatus::Invalid {
                self.nodes[i].status = BlockStatus::Invalid;
                marked.push(NodeId(i));
            }
        }

        if self.get(self.best_header).status == BlockStatus::Invalid {
            self.best_header = (0..self.nodes.len())
                .map(NodeId)
                .filter(|&n| self.get(n).status != BlockStatus::Invalid)
                .max_by(|&a, &b| self.candidate_key(a).cmp(&self.candidate_key(b)))
                .unwrap_or(NodeId(0));
        }
        warn!(
            hash = %self.get(id).hash,
            height = self.get(id).height,
            descendants = marked.len().saturating_sub(1),
            "Marked block invalid"
        );
        marked
    }

    pub(crate) fn set_valid(&mut self, id: NodeId) {
        let node = &mut self.nodes[id.0];
        if node.status == BlockStatus::Unvalidated {
            node.status = BlockStatus::Valid;
        }
    }
}

/// The currently connected chain, indexed by height.
#[derive(Debug, Clone)]
pub struct ActiveChain {
    nodes: Vec<NodeId>,
}

impl ActiveChain {
    pub fn new(genesis: NodeId) -> Self {
        Self {
            nodes: vec![genesis],
        }
    }

    pub fn tip(&self) -> NodeId {
        self.nodes[self.nodes.len() - 1]
    }

    pub fn height(&self) -> u32 {
        (self.nodes.len() - 1) as u32
    }

    pub fn at_height(&self, height: u32) -> Option<NodeId> {
        self.nodes.get(height as usize).copied()
    }

    pub fn contains(&self, index: &ChainIndex, id: NodeId) -> bool {
        self.at_height(index.get(id).height) == Some(id)
    }

    /// Last node of the active chain that is an ancestor of `id`.
    pub fn find_fork(&self, index: &ChainIndex, id: NodeId) -> NodeId {
        let mut walk = id;
        if index.get(walk).height > self.height() {
            walk = index.get_ancestor(walk, self.height()).unwrap_or(walk);
        }
        while !self.contains(index, walk) {
            match index.get(walk).parent {
                Some(parent) => walk = parent,
                None => break,
            }
        }
        walk
    }

    /// Make `id` the tip, rewriting only the entries above the fork.
    pub fn set_tip(&mut self, index: &ChainIndex, id: NodeId) {
        let height = index.get(id).height as usize;
        self.nodes.truncate(height + 1);
        self.nodes.resize(height + 1, id);
        let mut walk = Some(id);
        while let Some(node_id) = walk {
            let h = index.get(node_id).height as usize;
            if self.nodes[h] == node_id && h != height {
                break;
            }
            self.nodes[h] = node_id;
            walk = index.get(node_id).parent;
        }
        debug!(height, hash = %index.get(id).hash, "Active chain tip set");
    }

    /// Hashes stepping back from the tip, dense for ten entries then
    /// exponentially spaced, always ending at genesis.
    pub fn locator(&self, index: &ChainIndex) -> Vec<Hash256> {
        let mut locator = Vec::new();
        let mut step = 1u32;
        let mut height = self.height();
        loop {
            if let Some(id) = self.at_height(height) {
                locator.push(index.get(id).hash);
            }
            if height == 0 {
                break;
            }
            height = height.saturating_sub(step);
            if locator.len() > 10 {
                step *= 2;
            }
        }
        locator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use betg_consensus::ChainParams;
    use proptest::prelude::*;

    fn child(parent: &BlockHeader, salt: u32, bits: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_hash: parent.hash(),
            merkle_root: Hash256::new([salt as u8; 32]),
            time: parent.time + 60 + salt,
            bits,
            nonce: u64::from(salt),
            height: parent.height + 1,
            mix_hash: Hash256::new([(salt >> 8) as u8; 32]),
        }
    }

    /// Linear chain of `len` headers after genesis.
    fn linear_index(len: u32) -> (ChainIndex, Vec<NodeId>) {
        let params = ChainParams::regtest();
        let mut index = ChainIndex::new(&params.genesis.header);
        let mut ids = vec![index.genesis()];
        let mut prev = params.genesis.header.clone();
        for i in 0..len {
            let header = child(&prev, i, 0x207fffff);
            ids.push(index.insert(header.clone()).unwrap());
            prev = header;
        }
        (index, ids)
    }

    // ============ Skip List Tests ============

    #[test]
    fn test_skip_height_is_lower() {
        assert_eq!(skip_height(0), 0);
        assert_eq!(skip_height(1), 0);
        for h in 2..10_000u32 {
            assert!(skip_height(h) < h);
        }
    }

    #[test]
    fn test_ancestor_matches_linear_walk() {
        let (index, ids) = linear_index(2_000);
        let tip = *ids.last().unwrap();
        for (height, &id) in ids.iter().enumerate() {
            assert_eq!(index.get_ancestor(tip, height as u32), Some(id));
        }
        assert_eq!(index.get_ancestor(ids[10], 11), None);
    }

    proptest! {
        #[test]
        fn prop_ancestor_from_any_node(from in 0usize..600, to in 0u32..600) {
            let (index, ids) = linear_index(600);
            let id = ids[from];
            let expected = if (to as usize) <= from { Some(ids[to as usize]) } else { None };
            prop_assert_eq!(index.get_ancestor(id, to), expected);
        }
    }

    // ============ Tree Tests ============

    #[test]
    fn test_chain_work_accumulates() {
        let (index, ids) = linear_index(3);
        let unit = block_proof(0x207fffff);
        assert_eq!(index.get(ids[3]).chain_work, unit * 4u32);
        assert_eq!(index.best_header(), ids[3]);
    }

    #[test]
    fn test_equal_work_keeps_first_seen() {
        let params = ChainParams::regtest();
        let genesis = params.genesis.header.clone();
        let mut index = ChainIndex::new(&genesis);
        let a = index.insert(child(&genesis, 1, 0x207fffff)).unwrap();
        let b = index.insert(child(&genesis, 2, 0x207fffff)).unwrap();
        assert_eq!(index.get(a).chain_work, index.get(b).chain_work);
        assert_eq!(index.best_header(), a);
        assert!(index.is_better(a, b));
        assert!(!index.is_better(b, a));
    }

    #[test]
    fn test_insert_is_idempotent_and_needs_parent() {
        let params = ChainParams::regtest();
        let genesis = params.genesis.header.clone();
        let mut index = ChainIndex::new(&genesis);
        let header = child(&genesis, 1, 0x207fffff);
        let id = index.insert(header.clone()).unwrap();
        assert_eq!(index.insert(header.clone()), Some(id));
        assert_eq!(index.len(), 2);

        let orphan = child(&child(&header, 5, 0x207fffff), 6, 0x207fffff);
        assert_eq!(index.insert(orphan), None);
    }

    #[test]
    fn test_last_common_ancestor() {
        let params = ChainParams::regtest();
        let genesis = params.genesis.header.clone();
        let mut index = ChainIndex::new(&genesis);
        let base = child(&genesis, 1, 0x207fffff);
        let base_id = index.insert(base.clone()).unwrap();

        let mut left = base.clone();
        let mut right = base;
        let (mut left_id, mut right_id) = (base_id, base_id);
        for i in 0..5 {
            left = child(&left, 10 + i, 0x207fffff);
            left_id = index.insert(left.clone()).unwrap();
        }
        for i in 0..3 {
            right = child(&right, 20 + i, 0x207fffff);
            right_id = index.insert(right.clone()).unwrap();
        }
        assert_eq!(index.last_common_ancestor(left_id, right_id), base_id);
        assert_eq!(index.last_common_ancestor(left_id, base_id), base_id);
        assert_eq!(index.last_common_ancestor(left_id, left_id), left_id);
    }

    #[test]
    fn test_median_time_past() {
        let (index, ids) = linear_index(20);
        // Times increase by 60 + i, so the median of 11 is the 6th newest.
        let tip = ids[20];
        let expected = i64::from(index.get(ids[15]).header.time);
        assert_eq!(index.median_time_past(tip), expected);
        assert_eq!(
            index.median_time_past(index.genesis()),
            i64::from(index.get(ids[0]).header.time)
        );
    }

    #[test]
    fn test_difficulty_window_order() {
        let (index, ids) = linear_index(30);
        let window = index.difficulty_window(ids[30], 20);
        assert_eq!(window.len(), 20);
        assert_eq!(window[0].height, 11);
        assert_eq!(window[19].height, 30);
        assert_eq!(index.difficulty_window(ids[3], 20).len(), 4);
    }

    // ============ Invalidity Tests ============

    #[test]
    fn test_invalid_is_contagious() {
        let params = ChainParams::regtest();
        let genesis = params.genesis.header.clone();
        let mut index = ChainIndex::new(&genesis);
        let a = child(&genesis, 1, 0x207fffff);
        let a_id = index.insert(a.clone()).unwrap();
        let b = child(&a, 2, 0x207fffff);
        let b_id = index.insert(b.clone()).unwrap();
        let side = child(&genesis, 3, 0x207fffff);
        let side_id = index.insert(side).unwrap();
        assert_eq!(index.best_header(), b_id);

        let marked = index.mark_invalid(a_id);
        assert_eq!(marked, vec![a_id, b_id]);
        assert_eq!(index.get(b_id).status, BlockStatus::Invalid);
        assert_eq!(index.get(side_id).status, BlockStatus::Unvalidated);
        assert_eq!(index.best_header(), side_id);

        // Late children inherit the status.
        let c_id = index.insert(child(&b, 4, 0x207fffff)).unwrap();
        assert_eq!(index.get(c_id).status, BlockStatus::Invalid);
        assert_eq!(index.best_header(), side_id);
    }

    // ============ Active Chain Tests ============

    #[test]
    fn test_active_chain_switch() {
        let params = ChainParams::regtest();
        let genesis = params.genesis.header.clone();
        let mut index = ChainIndex::new(&genesis);
        let mut active = ActiveChain::new(index.genesis());

        let a1 = child(&genesis, 1, 0x207fffff);
        let a1_id = index.insert(a1.clone()).unwrap();
        let a2_id = index.insert(child(&a1, 2, 0x207fffff)).unwrap();
        active.set_tip(&index, a2_id);
        assert_eq!(active.height(), 2);
        assert_eq!(active.at_height(1), Some(a1_id));

        let b1 = child(&genesis, 3, 0x207fffff);
        let b1_id = index.insert(b1.clone()).unwrap();
        let b2 = child(&b1, 4, 0x207fffff);
        let b2_id = index.insert(b2.clone()).unwrap();
        let b3_id = index.insert(child(&b2, 5, 0x207fffff)).unwrap();
        assert_eq!(active.find_fork(&index, b3_id), index.genesis());

        active.set_tip(&index, b3_id);
        assert_eq!(active.tip(), b3_id);
        assert_eq!(active.at_height(1), Some(b1_id));
        assert_eq!(active.at_height(2), Some(b2_id));
        assert!(!active.contains(&index, a1_id));

        active.set_tip(&index, a1_id);
        assert_eq!(active.height(), 1);
        assert_eq!(active.tip(), a1_id);
    }

    #[test]
    fn test_locator_ends_at_genesis() {
        let (index, ids) = linear_index(100);
        let mut active = ActiveChain::new(index.genesis());
        active.set_tip(&index, ids[100]);
        let locator = active.locator(&index);
        assert_eq!(locator[0], index.get(ids[100]).hash);
        assert_eq!(locator[10], index.get(ids[90]).hash);
        assert_eq!(*locator.last().unwrap(), index.get(ids[0]).hash);
        assert!(locator.len() < 25);
    }
}
