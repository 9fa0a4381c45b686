//! Block and undo data storage.

use crate::ChainResult;
use betg_consensus::{Block, BlockHeader, UndoSet};
use betg_pow::Hash256;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Storage for full blocks and their undo data.
pub trait BlockStore: Send + Sync {
    fn get_block(&self, hash: &Hash256) -> ChainResult<Option<Arc<Block>>>;

    fn get_header(&self, hash: &Hash256) -> ChainResult<Option<BlockHeader>> {
        Ok(self.get_block(hash)?.map(|block| block.header.clone()))
    }

    fn get_undo_data(&self, hash: &Hash256) -> ChainResult<Option<UndoSet>>;

    fn put_block(&self, block: Arc<Block>) -> ChainResult<()>;

    fn put_undo(&self, hash: Hash256, undo: UndoSet) -> ChainResult<()>;

    fn has_block(&self, hash: &Hash256) -> ChainResult<bool> {
        Ok(self.get_block(hash)?.is_some())
    }
}

/// Block store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Hash256, Arc<Block>>>,
    undo: RwLock<HashMap<Hash256, UndoSet>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }
}

impl BlockStore for MemoryBlockStore {
    fn get_block(&self, hash: &Hash256) -> ChainResult<Option<Arc<Block>>> {
        Ok(self.blocks.read().get(hash).cloned())
    }

    fn get_undo_data(&self, hash: &Hash256) -> ChainResult<Option<UndoSet>> {
        Ok(self.undo.read().get(hash).cloned())
    }

    fn put_block(&self, block: Arc<Block>) -> ChainResult<()> {
        self.blocks.write().insert(block.hash(), block);
        Ok(())
    }

    fn put_undo(&self, hash: Hash256, undo: UndoSet) -> ChainResult<()> {
        self.undo.write().insert(hash, undo);
        Ok(())
    }

    fn has_block(&self, hash: &Hash256) -> ChainResult<bool> {
        Ok(self.blocks.read().contains_key(hash))
    }
}
