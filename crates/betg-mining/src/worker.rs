//! Mining worker threads.
//!
//! Each `MiningWorker` runs on its own OS thread and searches a slice of
//! the nonce space for the current task. Tasks arrive over a `watch`
//! channel so that a new template replaces the old one immediately;
//! solutions go back over an `mpsc` channel.

use crate::solver::{seal, try_solve_batch};
use crate::MiningResult;
use betg_consensus::BlockHeader;
use betg_pow::{FullDataset, Hash256, Solution};
use rand::Rng;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Nonces tried before checking for new work.
const BATCH_SIZE: u64 = 256;

/// Nonce space partitions. Workers beyond this share a partition with a
/// different random offset.
const MAX_NONCE_PARTITIONS: u64 = 256;

/// Idle poll interval when there is no task.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Work handed to every worker.
#[derive(Clone)]
pub struct MiningTask {
    /// Template the header belongs to.
    pub template_id: u64,
    /// Header to seal; nonce and mix digest are ignored.
    pub header: BlockHeader,
    pub boundary: Hash256,
    /// Dataset for the header's epoch.
    pub dataset: Arc<FullDataset>,
}

impl fmt::Debug for MiningTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiningTask")
            .field("template_id", &self.template_id)
            .field("height", &self.header.height)
            .field("boundary", &self.boundary)
            .finish()
    }
}

/// A solution found by a worker.
#[derive(Debug, Clone)]
pub struct FoundSolution {
    pub template_id: u64,
    /// The task's header with the solution sealed in.
    pub header: BlockHeader,
    pub solution: Solution,
    pub worker_id: usize,
    /// Hashes spent on the batch that found it.
    pub hashes_computed: u64,
}

/// A mining worker running in its own thread.
pub struct MiningWorker {
    id: usize,
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    hash_count: Arc<AtomicU64>,
}

impl MiningWorker {
    /// Spawn a worker that follows `task_rx` and reports to `solution_tx`.
    pub fn spawn(
        id: usize,
        task_rx: watch::Receiver<Option<MiningTask>>,
        solution_tx: mpsc::Sender<FoundSolution>,
    ) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let hash_count = Arc::new(AtomicU64::new(0));

        let running_clone = Arc::clone(&running);
        let hash_count_clone = Arc::clone(&hash_count);

        let handle = thread::Builder::new()
            .name(format!("mining-worker-{}", id))
            .spawn(move || {
                Self::worker_loop(id, task_rx, solution_tx, running_clone, hash_count_clone);
            })?;

        info!(worker_id = id, "Mining worker spawned");

        Ok(Self {
            id,
            handle: Some(handle),
            running,
            hash_count,
        })
    }

    fn worker_loop(
        id: usize,
        mut task_rx: watch::Receiver<Option<MiningTask>>,
        solution_tx: mpsc::Sender<FoundSolution>,
        running: Arc<AtomicBool>,
        hash_count: Arc<AtomicU64>,
    ) {
        let partition = (id as u64) % MAX_NONCE_PARTITIONS;
        let partition_size = u64::MAX / MAX_NONCE_PARTITIONS;
        let random_offset: u64 = rand::thread_rng().gen::<u64>() % (partition_size / 2);
        let nonce_offset = (partition * partition_size).wrapping_add(random_offset);

        debug!(worker_id = id, partition, "Worker starting with nonce offset {:#x}", nonce_offset);

        while running.load(Ordering::Relaxed) {
            let task = task_rx.borrow_and_update().clone();
            let Some(task) = task else {
                // A closed channel means the pool is gone.
                if task_rx.has_changed().is_err() {
                    break;
                }
                trace!(worker_id = id, "No work available, waiting");
                thread::sleep(IDLE_WAIT);
                continue;
            };

            let header_hash = task.header.header_hash();
            let mut nonce = nonce_offset;
            loop {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                match task_rx.has_changed() {
                    Ok(false) => {}
                    Ok(true) => {
                        trace!(worker_id = id, "New work received, switching tasks");
                        break;
                    }
                    Err(_) => {
                        running.store(false, Ordering::Relaxed);
                        break;
                    }
                }

                let before = hash_count.load(Ordering::Relaxed);
                let found = try_solve_batch(
                    task.dataset.as_ref(),
                    task.header.height,
                    &header_hash,
                    &task.boundary,
                    nonce,
                    BATCH_SIZE,
                    &hash_count,
                );
                nonce = nonce.wrapping_add(BATCH_SIZE);

                if let Some(solution) = found {
                    let mut header = task.header.clone();
                    seal(&mut header, &solution);
                    info!(
                        worker_id = id,
                        height = header.height,
                        template_id = task.template_id,
                        hash = %solution.final_hash,
                        "Found block solution"
                    );
                    let found = FoundSolution {
                        template_id: task.template_id,
                        header,
                        solution,
                        worker_id: id,
                        hashes_computed: hash_count.load(Ordering::Relaxed) - before,
                    };
                    if solution_tx.blocking_send(found).is_err() {
                        warn!(worker_id = id, "Failed to send solution, channel closed");
                        return;
                    }
                    // Idle until the coordinator hands out new work.
                    while running.load(Ordering::Relaxed)
                        && matches!(task_rx.has_changed(), Ok(false))
                    {
                        thread::sleep(IDLE_WAIT);
                    }
                    break;
                }
            }
        }

        info!(
            worker_id = id,
            total_hashes = hash_count.load(Ordering::Relaxed),
            "Worker shutting down"
        );
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn hash_count(&self) -> u64 {
        self.hash_count.load(Ordering::Relaxed)
    }

    /// Reset the hash counter and return the previous value.
    pub fn reset_hash_count(&self) -> u64 {
        self.hash_count.swap(0, Ordering::Relaxed)
    }

    /// Stop the worker and wait for its thread.
    pub fn join(mut self) -> thread::Result<()> {
        self.stop();
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

impl Drop for MiningWorker {
    fn drop(&mut self) {
        // Not joined here; dropping must not block.
        self.stop();
    }
}

/// A pool of mining workers sharing one task channel.
pub struct WorkerPool {
    workers: Vec<MiningWorker>,
    task_tx: watch::Sender<Option<MiningTask>>,
    solution_rx: mpsc::Receiver<FoundSolution>,
    running: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Start `num_workers` workers, at least one.
    pub fn new(num_workers: usize) -> MiningResult<Self> {
        let num_workers = num_workers.max(1);
        let (task_tx, task_rx) = watch::channel(None);
        let (solution_tx, solution_rx) = mpsc::channel(num_workers * 2);

        let mut workers = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            workers.push(MiningWorker::spawn(id, task_rx.clone(), solution_tx.clone())?);
        }

        info!(num_workers, "Worker pool created");

        Ok(Self {
            workers,
            task_tx,
            solution_rx,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Replace the current task on every worker.
    pub fn broadcast_task(&self, task: MiningTask) {
        debug!(
            template_id = task.template_id,
            height = task.header.height,
            "Broadcasting mining task"
        );
        if self.task_tx.send(Some(task)).is_err() {
            warn!("Failed to broadcast task, no workers subscribed");
        }
    }

    /// Make every worker idle.
    pub fn clear_task(&self) {
        self.task_tx.send_replace(None);
    }

    pub fn try_recv_solution(&mut self) -> Option<FoundSolution> {
        self.solution_rx.try_recv().ok()
    }

    pub async fn recv_solution(&mut self) -> Option<FoundSolution> {
        self.solution_rx.recv().await
    }

    pub fn total_hash_count(&self) -> u64 {
        self.workers.iter().map(MiningWorker::hash_count).sum()
    }

    pub fn reset_hash_counts(&self) -> u64 {
        self.workers.iter().map(MiningWorker::reset_hash_count).sum()
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        for worker in &self.workers {
            worker.stop();
        }
    }

    /// Stop every worker and wait for their threads.
    pub fn shutdown(self) {
        self.stop();
        for worker in self.workers {
            if worker.join().is_err() {
                warn!("Mining worker panicked");
            }
        }
        info!("Worker pool shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::boundary_for_bits;
    use betg_consensus::ChainParams;
    use betg_pow::{verify, EpochContext};
    use once_cell::sync::Lazy;

    static DATASET: Lazy<Arc<FullDataset>> = Lazy::new(|| {
        Arc::new(FullDataset::new(Arc::new(EpochContext::build(0).unwrap())))
    });

    fn task(template_id: u64, bits: u32) -> MiningTask {
        let params = ChainParams::regtest();
        let header = BlockHeader {
            version: 4,
            prev_hash: params.genesis_hash,
            merkle_root: Hash256::new([template_id as u8; 32]),
            time: params.genesis.header.time + 60,
            bits,
            nonce: 0,
            height: 1,
            mix_hash: Hash256::ZERO,
        };
        MiningTask {
            template_id,
            header,
            boundary: boundary_for_bits(bits).unwrap_or(Hash256::ZERO),
            dataset: Arc::clone(&DATASET),
        }
    }

    // ============ Worker Pool Tests ============

    #[tokio::test]
    async fn test_worker_pool_creation() {
        let pool = WorkerPool::new(2).unwrap();
        assert_eq!(pool.num_workers(), 2);
        assert!(pool.is_running());
        pool.shutdown();

        let pool = WorkerPool::new(0).unwrap();
        assert_eq!(pool.num_workers(), 1);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_worker_finds_solution() {
        let mut pool = WorkerPool::new(2).unwrap();
        pool.broadcast_task(task(7, 0x207fffff));

        let found = tokio::time::timeout(Duration::from_secs(120), pool.recv_solution())
            .await
            .expect("solution within timeout")
            .expect("channel open");
        pool.stop();

        assert_eq!(found.template_id, 7);
        assert_eq!(found.header.nonce, found.solution.nonce);
        assert!(found.hashes_computed >= 1);
        assert!(verify(
            DATASET.context_arc(),
            found.header.height,
            &found.header.header_hash(),
            &found.header.mix_hash,
            found.header.nonce,
            &boundary_for_bits(found.header.bits).unwrap()
        ));
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_hash_counting_and_switching() {
        let mut pool = WorkerPool::new(1).unwrap();
        // A zero boundary never seals.
        let mut hard = task(1, 0x207fffff);
        hard.boundary = Hash256::ZERO;
        pool.broadcast_task(hard);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(pool.total_hash_count() > 0);
        assert!(pool.try_recv_solution().is_none());

        pool.broadcast_task(task(2, 0x207fffff));
        let found = tokio::time::timeout(Duration::from_secs(120), pool.recv_solution())
            .await
            .expect("solution within timeout")
            .expect("channel open");
        assert_eq!(found.template_id, 2);

        pool.clear_task();
        let before = pool.reset_hash_counts();
        assert!(before > 0);
        pool.shutdown();
    }

    #[test]
    fn test_worker_stop() {
        let (task_tx, task_rx) = watch::channel(None);
        let (solution_tx, _solution_rx) = mpsc::channel(10);

        let worker = MiningWorker::spawn(0, task_rx, solution_tx).unwrap();
        assert!(worker.is_running());
        assert_eq!(worker.id(), 0);

        worker.stop();
        assert!(!worker.is_running());
        drop(task_tx);
        assert!(worker.join().is_ok());
    }
}
