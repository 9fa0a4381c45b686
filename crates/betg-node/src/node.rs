//! Node implementation.

use crate::config::NodeConfig;
use crate::notify::{Notification, NotificationBus, ValidationInterface};
use anyhow::{Context, Result};
use betg_chain::{ChainResult, ChainSelection, Chainstate, MemoryBlockStore, TipUpdate};
use betg_consensus::{AcceptAllVerifier, Block, ChainParams, Script, Transaction};
use betg_mempool::{AcceptedTx, LoadStats, Mempool, MempoolError, MempoolResult};
use betg_mining::{BlockTemplate, FoundSolution, Miner, MiningResult, WorkerPool};
use betg_pow::{EpochContextCache, Hash256};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Recently rejected transactions remembered until the tip moves.
const REJECT_CACHE_SIZE: usize = 120_000;

/// Interval between mempool expiry passes.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between mining template checks.
const MINING_TICK: Duration = Duration::from_secs(1);

/// A template older than this is rebuilt to pick up new transactions.
const TEMPLATE_MAX_AGE: Duration = Duration::from_secs(30);

/// The node: chain, mempool and miner wired together.
pub struct Node {
    config: NodeConfig,
    chain: Arc<Chainstate>,
    mempool: Arc<Mempool>,
    miner: Arc<Miner>,
    bus: NotificationBus,
    rejects: Mutex<LruCache<Hash256, ()>>,
    shutdown: AtomicBool,
}

enum Event {
    Maintenance,
    MiningTick,
    Solution(Option<FoundSolution>),
}

impl Node {
    /// Create a node with an in-memory block store.
    pub fn new(config: NodeConfig) -> Result<Arc<Self>> {
        let params = Arc::new(ChainParams::for_network(config.network));
        let chain = Chainstate::new(
            params,
            Arc::new(MemoryBlockStore::new()),
            Arc::new(EpochContextCache::new()),
            Arc::new(AcceptAllVerifier),
        )
        .context("Failed to initialize chainstate")?;
        Self::with_chain(config, Arc::new(chain))
    }

    /// Create a node around an existing chainstate.
    pub fn with_chain(config: NodeConfig, chain: Arc<Chainstate>) -> Result<Arc<Self>> {
        let mempool = Arc::new(Mempool::new(config.mempool.to_mempool_config()));
        let miner_config = config.mining.to_miner_config()?;
        let miner = Arc::new(Miner::new(miner_config, Arc::clone(&chain), Arc::clone(&mempool)));
        let capacity = NonZeroUsize::new(REJECT_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);

        let node = Arc::new(Self {
            config,
            chain,
            mempool,
            miner,
            bus: NotificationBus::new(),
            rejects: Mutex::new(LruCache::new(capacity)),
            shutdown: AtomicBool::new(false),
        });

        if node.config.mempool.persist && node.config.mempool_path().exists() {
            match node.load_mempool() {
                Ok(stats) => {
                    info!(loaded = stats.loaded, skipped = stats.skipped, "Restored mempool")
                }
                Err(e) => warn!(error = %e, "Failed to restore mempool"),
            }
        }
        Ok(node)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn chain(&self) -> &Arc<Chainstate> {
        &self.chain
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn miner(&self) -> &Arc<Miner> {
        &self.miner
    }

    pub fn register(&self, listener: Arc<dyn ValidationInterface>) {
        self.bus.register(listener);
    }

    /// Validate and connect a block, then bring the mempool in line with
    /// the new tip.
    ///
    /// Returns the block's own rejection even when another branch became
    /// active in the same call.
    #[instrument(skip(self, block), fields(height = block.header.height, hash = %block.hash()))]
    pub fn submit_block(&self, block: Block) -> ChainResult<ChainSelection> {
        let hash = block.hash();
        let update = self.chain.process_block(block)?;
        let own_rejection = update.rejection_of(&hash).cloned();

        let events = self.update_for_tip(&update);
        self.bus.dispatch(events);

        match own_rejection {
            Some(err) => Err(err.into()),
            None => Ok(update.selection),
        }
    }

    /// Assemble a block template on the current tip.
    pub fn create_new_block(&self, coinbase_script: &Script) -> MiningResult<BlockTemplate> {
        self.miner.assembler().create_new_block(coinbase_script)
    }

    /// Admit a transaction to the mempool under node policy.
    #[instrument(skip(self, tx), fields(txid = %tx.txid()))]
    pub fn accept_transaction(&self, tx: Transaction) -> MempoolResult<AcceptedTx> {
        let txid = tx.txid();
        if self.rejects.lock().contains(&txid) {
            return Err(MempoolError::RecentlyRejected(txid));
        }

        match self
            .mempool
            .accept_transaction(&self.chain, tx, self.chain.adjusted_time())
        {
            Ok(accepted) => {
                self.bus.dispatch(self.accepted_events(&accepted));
                Ok(accepted)
            }
            Err(e) => {
                if should_cache_reject(&e) {
                    self.rejects.lock().put(txid, ());
                }
                debug!(%txid, reason = e.reason(), "Transaction rejected");
                Err(e)
            }
        }
    }

    fn accepted_events(&self, accepted: &AcceptedTx) -> Vec<Notification> {
        let mut events: Vec<Notification> = accepted
            .replaced
            .iter()
            .chain(&accepted.evicted)
            .cloned()
            .map(Notification::removed)
            .collect();
        if let Some(tx) = self.mempool.get_tx(&accepted.txid) {
            events.push(Notification::TransactionAdded(tx));
        }
        events
    }

    /// Mempool and miner follow-up after the tip moved.
    fn update_for_tip(&self, update: &TipUpdate) -> Vec<Notification> {
        let mut events = Vec::new();
        if update.selection == ChainSelection::Ignored {
            return events;
        }
        self.rejects.lock().clear();
        self.miner.invalidate();

        for block in &update.disconnected {
            events.push(Notification::BlockDisconnected(Arc::clone(block)));
        }
        for block in &update.connected {
            let removed = self.mempool.remove_for_block(&block.transactions);
            events.extend(removed.into_iter().map(Notification::removed));
            events.push(Notification::BlockConnected(Arc::clone(block)));
        }

        if !update.disconnected.is_empty() {
            let time = self.chain.adjusted_time();
            let mut resurrected = 0usize;
            // Oldest disconnected block first so parents precede children.
            for block in update.disconnected.iter().rev() {
                for tx in block.transactions.iter().skip(1) {
                    match self.mempool.accept_transaction(&self.chain, tx.clone(), time) {
                        Ok(accepted) => {
                            resurrected += 1;
                            events.extend(self.accepted_events(&accepted));
                        }
                        Err(e) => debug!(
                            txid = %tx.txid(),
                            reason = e.reason(),
                            "Disconnected transaction dropped"
                        ),
                    }
                }
            }
            let removed = self.mempool.remove_for_reorg(&self.chain);
            info!(resurrected, removed = removed.len(), "Mempool updated for reorg");
            events.extend(removed.into_iter().map(Notification::removed));
        }

        let fork_height = match update.selection {
            ChainSelection::Reorg { fork_height, .. } => Some(fork_height),
            _ => None,
        };
        events.push(Notification::UpdatedBlockTip {
            tip: update.tip.clone(),
            fork_height,
        });
        events
    }

    /// Drop mempool entries past their expiry.
    pub fn expire_mempool(&self) -> usize {
        let cutoff = self.chain.adjusted_time() - self.mempool.config().expiry_secs;
        let removed = self.mempool.expire(cutoff);
        let count = removed.len();
        self.bus
            .dispatch(removed.into_iter().map(Notification::removed).collect());
        count
    }

    pub fn load_mempool(&self) -> Result<LoadStats> {
        let path = self.config.mempool_path();
        let view = self.chain.view();
        let stats = self
            .mempool
            .load(&path, view.coins())
            .with_context(|| format!("Failed to load mempool from {}", path.display()))?;
        Ok(stats)
    }

    pub fn dump_mempool(&self) -> Result<usize> {
        std::fs::create_dir_all(&self.config.data_dir).context("Failed to create data directory")?;
        let path = self.config.mempool_path();
        self.mempool
            .dump(&path)
            .with_context(|| format!("Failed to dump mempool to {}", path.display()))
    }

    /// Run maintenance and, when enabled, the internal miner until shutdown.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        info!(
            network = %self.config.network,
            tip = %self.chain.tip().hash,
            "Starting node services"
        );

        let mut workers = if self.miner.is_enabled() {
            Some(WorkerPool::new(self.miner.config().threads)?)
        } else {
            None
        };
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut mining_tick = tokio::time::interval(MINING_TICK);
        mining_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut broadcast: Option<(u64, Instant)> = None;

        while !self.shutdown.load(Ordering::SeqCst) {
            let event = tokio::select! {
                _ = maintenance.tick() => Event::Maintenance,
                _ = mining_tick.tick() => Event::MiningTick,
                found = next_solution(&mut workers) => Event::Solution(found),
            };

            match event {
                Event::Maintenance => {
                    let expired = self.expire_mempool();
                    if expired > 0 {
                        info!(expired, "Expired mempool transactions");
                    }
                }
                Event::MiningTick => {
                    if let Some(pool) = &workers {
                        self.refresh_mining_task(pool, &mut broadcast);
                    }
                }
                Event::Solution(Some(found)) => self.handle_solution(&found),
                Event::Solution(None) => {
                    warn!("Mining workers stopped");
                    workers = None;
                }
            }
        }

        if let Some(pool) = workers {
            pool.clear_task();
            tokio::task::spawn_blocking(move || pool.shutdown())
                .await
                .context("Mining worker shutdown failed")?;
        }
        info!("Node services stopped");
        Ok(())
    }

    fn refresh_mining_task(&self, pool: &WorkerPool, broadcast: &mut Option<(u64, Instant)>) {
        let current_id = self.miner.current_template().map(|current| current.id);
        let fresh = matches!(
            (*broadcast, current_id),
            (Some((sent, at)), Some(id)) if sent == id && at.elapsed() < TEMPLATE_MAX_AGE
        );
        if fresh {
            return;
        }

        let task = self
            .miner
            .create_template()
            .and_then(|current| self.miner.mining_task(&current));
        match task {
            Ok(task) => {
                *broadcast = Some((task.template_id, Instant::now()));
                pool.broadcast_task(task);
            }
            Err(e) => {
                warn!(error = %e, reason = e.reason(), "Failed to create mining task");
                *broadcast = None;
                pool.clear_task();
            }
        }
    }

    fn handle_solution(&self, found: &FoundSolution) {
        let block = match self.miner.complete_block(found) {
            Ok(block) => block,
            Err(e) => {
                debug!(template_id = found.template_id, reason = e.reason(), "Discarding solution");
                return;
            }
        };
        let height = block.header.height;
        match self.submit_block(block) {
            Ok(selection) => info!(height, ?selection, "Submitted mined block"),
            Err(e) => warn!(height, reason = e.reason(), error = %e, "Mined block rejected"),
        }
    }

    /// Stop the run loop and persist the mempool.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.miner.stop();
        if self.config.mempool.persist {
            match self.dump_mempool() {
                Ok(count) => info!(count, "Mempool saved"),
                Err(e) => warn!(error = %e, "Failed to save mempool"),
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

async fn next_solution(workers: &mut Option<WorkerPool>) -> Option<FoundSolution> {
    match workers {
        Some(pool) => pool.recv_solution().await,
        None => std::future::pending().await,
    }
}

/// Whether a rejection stays valid until the tip moves.
fn should_cache_reject(err: &MempoolError) -> bool {
    !matches!(
        err,
        MempoolError::MissingInputs(_)
            | MempoolError::AlreadyExists(_)
            | MempoolError::RecentlyRejected(_)
            | MempoolError::Full
            | MempoolError::Io(_)
            | MempoolError::Persistence(_)
    )
}
