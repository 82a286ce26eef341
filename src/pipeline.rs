//! Wires the producer, worker pool, persister and checkpoint flusher together.
//!
//! Shutdown order on cancellation: the producer stops feeding the queue,
//! workers finish their in-flight key and exit, the persister drains and
//! flushes its partial batch, and a final checkpoint is written.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checkpoint::CheckpointManager;
use crate::config::HarvestConfig;
use crate::enumerator::KeySpace;
use crate::model::Counters;
use crate::persister::BatchPersister;
use crate::progress::ProgressReporter;
use crate::resolver::Resolver;
use crate::storage::Storage;
use crate::worker::{run_pool, WorkerContext};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub checkpoint_interval: Duration,
    pub progress_target: Option<u64>,
}

impl From<&HarvestConfig> for PipelineOptions {
    fn from(cfg: &HarvestConfig) -> Self {
        Self {
            workers: cfg.workers,
            queue_capacity: cfg.queue_capacity,
            batch_size: cfg.batch_size,
            batch_timeout: cfg.batch_timeout,
            checkpoint_interval: cfg.checkpoint_interval,
            progress_target: cfg.progress_target,
        }
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from(&HarvestConfig::default())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub total_keys: usize,
    pub skipped: u64,
    pub enqueued: u64,
    /// Keys resolved by workers during this run.
    pub resolved: u64,
    pub counters: Counters,
    pub processed_keys: usize,
    pub remaining_keys: usize,
    pub batches: u64,
    pub failed_batches: u64,
    pub elapsed_secs: f64,
    pub cancelled: bool,
    /// Whether the final checkpoint write succeeded.
    pub checkpoint_saved: bool,
}

pub struct Pipeline {
    space: Arc<KeySpace>,
    resolver: Arc<Resolver>,
    storage: Arc<dyn Storage>,
    checkpoint: Arc<CheckpointManager>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        space: KeySpace,
        resolver: Arc<Resolver>,
        storage: Arc<dyn Storage>,
        checkpoint: Arc<CheckpointManager>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            space: Arc::new(space),
            resolver,
            storage,
            checkpoint,
            options,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<RunSummary> {
        let started = Instant::now();
        let workers = self.options.workers.max(1);
        let processed = self.checkpoint.processed_keys();
        let reporter = ProgressReporter::new(
            self.checkpoint.counters(),
            processed.len() as u64,
            self.space.len() as u64,
            self.options.progress_target,
        );
        info!(
            keys = self.space.len(),
            locations = self.space.locations().len(),
            categories = self.space.categories().len(),
            already_processed = processed.len(),
            workers,
            strategies = ?self.resolver.strategy_names(),
            "collection starting"
        );

        let (work_tx, work_rx) = mpsc::channel(self.options.queue_capacity.max(1));
        let (result_tx, result_rx) = mpsc::channel(self.options.batch_size.max(1) * 2);
        let queue = Arc::new(Mutex::new(work_rx));

        let producer = {
            let space = self.space.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { space.produce(&processed, &work_tx, workers, &cancel).await })
        };

        let pool = tokio::spawn(run_pool(
            workers,
            queue.clone(),
            WorkerContext {
                resolver: self.resolver.clone(),
                checkpoint: self.checkpoint.clone(),
                results: result_tx,
                cancel: cancel.clone(),
            },
        ));

        let persister = tokio::spawn(
            BatchPersister::new(
                self.storage.clone(),
                self.checkpoint.clone(),
                self.options.batch_size,
                self.options.batch_timeout,
            )
            .run(result_rx),
        );

        let flush_stop = CancellationToken::new();
        let flusher = {
            let checkpoint = self.checkpoint.clone();
            let reporter = reporter.clone();
            let stop = flush_stop.clone();
            let interval = self.options.checkpoint_interval;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                        _ = checkpoint.wait_due() => {}
                    }
                    if let Err(err) = checkpoint.save().await {
                        warn!(error = %err, "checkpoint save failed; continuing in memory");
                    }
                    reporter.report(checkpoint.counters(), checkpoint.processed_count() as u64);
                }
            })
        };

        let pool_res = pool.await;
        // Unblocks a producer still waiting on a full queue.
        drop(queue);
        let producer_res = producer.await;
        let persister_res = persister.await;
        flush_stop.cancel();
        let _ = flusher.await;

        let checkpoint_saved = match self.checkpoint.save().await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "final checkpoint save failed");
                false
            }
        };
        let snap = self.checkpoint.snapshot();
        reporter.report(snap.counters, snap.processed_keys.len() as u64);

        let (pool_stats, produce_stats, persist_stats) = match (pool_res, producer_res, persister_res) {
            (Ok(p), Ok(e), Ok(s)) => (p, e, s),
            (p, e, s) => {
                let failed: Vec<&str> = [
                    ("workers", p.is_err()),
                    ("producer", e.is_err()),
                    ("persister", s.is_err()),
                ]
                .into_iter()
                .filter_map(|(name, bad)| bad.then_some(name))
                .collect();
                bail!("pipeline task(s) failed: {}", failed.join(", "));
            }
        };
        if pool_stats.crashed > 0 {
            bail!("{} worker(s) crashed", pool_stats.crashed);
        }

        let summary = RunSummary {
            total_keys: self.space.len(),
            skipped: produce_stats.skipped,
            enqueued: produce_stats.enqueued,
            resolved: pool_stats.processed,
            counters: snap.counters,
            processed_keys: snap.processed_keys.len(),
            remaining_keys: self.space.remaining(&snap.processed_keys),
            batches: persist_stats.batches,
            failed_batches: persist_stats.failed_batches,
            elapsed_secs: started.elapsed().as_secs_f64(),
            cancelled: cancel.is_cancelled(),
            checkpoint_saved,
        };
        info!(
            resolved = summary.resolved,
            saved = summary.counters.saved,
            not_found = summary.counters.not_found,
            errors = summary.counters.errors,
            remaining = summary.remaining_keys,
            cancelled = summary.cancelled,
            "collection finished"
        );
        Ok(summary)
    }
}
