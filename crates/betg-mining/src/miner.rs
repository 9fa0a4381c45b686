//! Miner: template bookkeeping and solution checking.

use crate::assembler::{AssemblerOptions, BlockAssembler, BlockTemplate};
use crate::solver::{boundary_for_bits, seal, try_solve};
use crate::worker::{FoundSolution, MiningTask};
use crate::{MiningError, MiningResult};
use betg_chain::Chainstate;
use betg_consensus::{Block, BlockHeader, Script};
use betg_mempool::Mempool;
use betg_pow::{get_epoch_number, verify, FullDataset};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Miner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    /// Run the internal CPU miner.
    pub enabled: bool,
    /// Worker threads.
    pub threads: usize,
    /// Output script paid by the coinbase.
    pub coinbase_script: Script,
    #[serde(flatten)]
    pub assembler: AssemblerOptions,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threads: 1,
            coinbase_script: Script::new(),
            assembler: AssemblerOptions::default(),
        }
    }
}

/// Mining statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MiningStats {
    pub templates_created: u64,
    pub solutions_received: u64,
    pub valid_solutions: u64,
    pub invalid_solutions: u64,
    pub stale_solutions: u64,
}

/// A template together with the id workers report back.
#[derive(Debug, Clone)]
pub struct CurrentTemplate {
    pub id: u64,
    pub template: Arc<BlockTemplate>,
}

/// Block miner.
///
/// Owns the current template. A solution is only accepted for the
/// template that is current when it arrives.
pub struct Miner {
    config: MinerConfig,
    chain: Arc<Chainstate>,
    assembler: BlockAssembler,
    enabled: AtomicBool,
    next_id: AtomicU64,
    current: RwLock<Option<CurrentTemplate>>,
    dataset: RwLock<Option<Arc<FullDataset>>>,
    stats: RwLock<MiningStats>,
}

impl Miner {
    pub fn new(config: MinerConfig, chain: Arc<Chainstate>, mempool: Arc<Mempool>) -> Self {
        let assembler = BlockAssembler::new(Arc::clone(&chain), mempool, config.assembler);
        Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            chain,
            assembler,
            next_id: AtomicU64::new(1),
            current: RwLock::new(None),
            dataset: RwLock::new(None),
            stats: RwLock::new(MiningStats::default()),
        }
    }

    pub fn config(&self) -> &MinerConfig {
        &self.config
    }

    pub fn assembler(&self) -> &BlockAssembler {
        &self.assembler
    }

    pub fn start(&self) {
        self.enabled.store(true, Ordering::SeqCst);
        info!("Mining enabled");
    }

    pub fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        info!("Mining disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Assemble a fresh template and make it current.
    pub fn create_template(&self) -> MiningResult<CurrentTemplate> {
        if !self.is_enabled() {
            return Err(MiningError::NotEnabled);
        }
        let template = Arc::new(self.assembler.create_new_block(&self.config.coinbase_script)?);
        let current = CurrentTemplate {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            template,
        };
        *self.current.write() = Some(current.clone());
        self.stats.write().templates_created += 1;
        debug!(template_id = current.id, height = current.template.height, "New current template");
        Ok(current)
    }

    pub fn current_template(&self) -> Option<CurrentTemplate> {
        self.current.read().clone()
    }

    /// Drop the current template, e.g. after the tip moved.
    pub fn invalidate(&self) {
        if self.current.write().take().is_some() {
            debug!("Mining work invalidated");
        }
    }

    /// Worker task for `current`, reusing the dataset while the epoch holds.
    pub fn mining_task(&self, current: &CurrentTemplate) -> MiningResult<MiningTask> {
        let header = current.template.block.header.clone();
        let dataset = self.dataset_for(header.height)?;
        Ok(MiningTask {
            template_id: current.id,
            boundary: current.template.target,
            header,
            dataset,
        })
    }

    fn dataset_for(&self, height: u32) -> MiningResult<Arc<FullDataset>> {
        let epoch = get_epoch_number(height);
        if let Some(dataset) = self.dataset.read().as_ref() {
            if dataset.context_arc().epoch_number() == epoch {
                return Ok(Arc::clone(dataset));
            }
        }
        let context = self.chain.epochs().get_or_build(epoch)?;
        let dataset = Arc::new(FullDataset::new(context));
        *self.dataset.write() = Some(Arc::clone(&dataset));
        info!(epoch, "Mining dataset switched");
        Ok(dataset)
    }

    /// Turn a worker's solution into a full block.
    pub fn complete_block(&self, found: &FoundSolution) -> MiningResult<Block> {
        self.stats.write().solutions_received += 1;
        let current = self.current_template().ok_or(MiningError::NoTemplate)?;
        if current.id != found.template_id {
            self.stats.write().stale_solutions += 1;
            return Err(MiningError::StaleSolution(found.template_id));
        }

        let mut block = current.template.block.clone();
        block.header.nonce = found.solution.nonce;
        block.header.mix_hash = found.solution.mix_hash;
        if let Err(e) = self.check_seal(&block.header) {
            self.stats.write().invalid_solutions += 1;
            warn!(template_id = found.template_id, error = %e, "Rejected mining solution");
            return Err(e);
        }

        self.stats.write().valid_solutions += 1;
        *self.current.write() = None;
        info!(height = block.header.height, hash = %block.hash(), "Mined block");
        Ok(block)
    }

    fn check_seal(&self, header: &BlockHeader) -> MiningResult<()> {
        let boundary = boundary_for_bits(header.bits)?;
        let context = self.chain.epochs().for_height(header.height)?;
        if !verify(
            &context,
            header.height,
            &header.header_hash(),
            &header.mix_hash,
            header.nonce,
            &boundary,
        ) {
            return Err(MiningError::InvalidSolution(format!(
                "nonce {} does not meet target {:#010x}",
                header.nonce, header.bits
            )));
        }
        Ok(())
    }

    /// Assemble a template and search it on the calling thread.
    ///
    /// Returns `None` when cancelled or when `max_attempts` nonces fail.
    pub fn mine_block(
        &self,
        max_attempts: u64,
        cancel: &AtomicBool,
    ) -> MiningResult<Option<Block>> {
        let current = self.create_template()?;
        let mut block = current.template.block.clone();
        let context = self.chain.epochs().for_height(block.header.height)?;
        let start_nonce: u64 = rand::thread_rng().gen::<u32>().into();
        let hashes = AtomicU64::new(0);

        let Some(solution) = try_solve(
            context.as_ref(),
            &block.header,
            &current.template.target,
            start_nonce,
            max_attempts,
            cancel,
            &hashes,
        ) else {
            debug!(hashes = hashes.load(Ordering::Relaxed), "No solution found");
            return Ok(None);
        };

        seal(&mut block.header, &solution);
        self.stats.write().valid_solutions += 1;
        *self.current.write() = None;
        info!(
            height = block.header.height,
            hash = %block.hash(),
            hashes = hashes.load(Ordering::Relaxed),
            "Mined block"
        );
        Ok(Some(block))
    }

    pub fn stats(&self) -> MiningStats {
        self.stats.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use betg_consensus::ChainParams;
    use betg_pow::{EpochContextCache, Hash256, Solution};
    use betg_chain::MemoryBlockStore;
    use betg_consensus::AcceptAllVerifier;
    use once_cell::sync::Lazy;

    static EPOCHS: Lazy<Arc<EpochContextCache>> = Lazy::new(|| Arc::new(EpochContextCache::new()));

    fn miner(enabled: bool) -> (Miner, Arc<Chainstate>) {
        let chain = Arc::new(
            Chainstate::new(
                Arc::new(ChainParams::regtest()),
                Arc::new(MemoryBlockStore::new()),
                Arc::clone(&EPOCHS),
                Arc::new(AcceptAllVerifier),
            )
            .unwrap(),
        );
        let config = MinerConfig {
            enabled,
            coinbase_script: Script::new().push_int(1),
            ..Default::default()
        };
        (
            Miner::new(config, Arc::clone(&chain), Arc::new(Mempool::default())),
            chain,
        )
    }

    // ============ Miner Tests ============

    #[test]
    fn test_disabled_miner() {
        let (miner, _chain) = miner(false);
        assert!(matches!(miner.create_template(), Err(MiningError::NotEnabled)));
        miner.start();
        assert!(miner.is_enabled());
        assert!(miner.create_template().is_ok());
        miner.stop();
        assert!(!miner.is_enabled());
    }

    #[test]
    fn test_template_ids_advance() {
        let (miner, _chain) = miner(true);
        let first = miner.create_template().unwrap();
        let second = miner.create_template().unwrap();
        assert!(second.id > first.id);
        assert_eq!(miner.current_template().unwrap().id, second.id);
        assert_eq!(miner.stats().templates_created, 2);

        miner.invalidate();
        assert!(miner.current_template().is_none());
    }

    #[test]
    fn test_mine_and_connect() {
        let (miner, chain) = miner(true);
        let block = miner
            .mine_block(10_000, &AtomicBool::new(false))
            .unwrap()
            .expect("regtest target");
        let update = chain.process_block(block.clone()).unwrap();
        assert_eq!(update.tip.hash, block.hash());
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn test_complete_block_checks() {
        let (miner, chain) = miner(true);
        let current = miner.create_template().unwrap();
        let task = miner.mining_task(&current).unwrap();
        let solution = betg_pow::search(
            task.dataset.as_ref(),
            task.header.height,
            &task.header.header_hash(),
            &task.boundary,
            0,
            10_000,
        )
        .unwrap();

        let mut header = task.header.clone();
        seal(&mut header, &solution);
        let found = |template_id, solution: Solution| FoundSolution {
            template_id,
            header: header.clone(),
            solution,
            worker_id: 0,
            hashes_computed: 1,
        };

        let stale = miner.complete_block(&found(current.id + 1, solution)).unwrap_err();
        assert_eq!(stale.reason(), "stale");

        let bogus = Solution {
            mix_hash: Hash256::new([1; 32]),
            ..solution
        };
        let invalid = miner.complete_block(&found(current.id, bogus)).unwrap_err();
        assert_eq!(invalid.reason(), "high-hash");

        let block = miner.complete_block(&found(current.id, solution)).unwrap();
        assert!(chain.process_block(block).is_ok());
        assert!(matches!(
            miner.complete_block(&found(current.id, solution)),
            Err(MiningError::NoTemplate)
        ));

        let stats = miner.stats();
        assert_eq!(stats.solutions_received, 4);
        assert_eq!(stats.valid_solutions, 1);
        assert_eq!(stats.invalid_solutions, 1);
        assert_eq!(stats.stale_solutions, 1);
    }
}
