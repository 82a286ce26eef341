use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::enumerator::WorkItem;
use crate::model::ResolvedRecord;
use crate::resolver::{Resolution, Resolver};

/// Shared end of the work queue.
pub type WorkQueue = Arc<Mutex<mpsc::Receiver<WorkItem>>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub found: u64,
    /// Workers that ended with a panic.
    pub crashed: usize,
}

#[derive(Clone)]
pub struct WorkerContext {
    pub resolver: Arc<Resolver>,
    pub checkpoint: Arc<CheckpointManager>,
    pub results: mpsc::Sender<ResolvedRecord>,
    pub cancel: CancellationToken,
}

async fn next_item(queue: &WorkQueue, cancel: &CancellationToken) -> Option<WorkItem> {
    let mut rx = queue.lock().await;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        item = rx.recv() => item,
    }
}

/// Dequeue, resolve, forward. Keys without a record are marked processed
/// here; found keys are marked by the persister after their batch lands.
async fn run_worker(id: usize, queue: WorkQueue, ctx: WorkerContext) -> WorkerStats {
    let mut stats = WorkerStats::default();
    while let Some(WorkItem::Unit(unit)) = next_item(&queue, &ctx.cancel).await {
        ctx.checkpoint.record_attempt();
        stats.processed += 1;
        match ctx.resolver.resolve_detailed(&unit).await {
            Resolution::Found { record, strategy } => {
                ctx.checkpoint.record_found();
                stats.found += 1;
                debug!(worker = id, key = %unit.key, strategy, "forwarding record");
                let resolved = ResolvedRecord {
                    key: unit.key,
                    record,
                };
                if ctx.results.send(resolved).await.is_err() {
                    warn!(worker = id, "result queue closed; worker exiting");
                    break;
                }
            }
            Resolution::NotFound => ctx.checkpoint.record_not_found(unit.key),
            Resolution::Failed { errors } => {
                let summary: Vec<String> = errors
                    .iter()
                    .map(|(source, err)| format!("{source}: {err}"))
                    .collect();
                warn!(worker = id, key = %unit.key, errors = ?summary, "resolution failed");
                ctx.checkpoint.record_error(unit.key);
            }
        }
    }
    debug!(worker = id, processed = stats.processed, "worker done");
    stats
}

/// Runs `workers` concurrent workers until each sees a stop item, the queue
/// closes, or the token is cancelled.
pub async fn run_pool(workers: usize, queue: WorkQueue, ctx: WorkerContext) -> WorkerStats {
    let mut tasks = Vec::with_capacity(workers);
    for id in 0..workers {
        let queue = queue.clone();
        let ctx = ctx.clone();
        tasks.push(tokio::spawn(run_worker(id, queue, ctx)));
    }
    // Only the workers hold result senders from here on.
    drop(ctx);

    let mut total = WorkerStats::default();
    for res in join_all(tasks).await {
        match res {
            Ok(s) => {
                total.processed += s.processed;
                total.found += s.found;
            }
            Err(join_err) => {
                error!(error = %join_err, "worker task failed");
                total.crashed += 1;
            }
        }
    }
    info!(workers, processed = total.processed, found = total.found, "worker pool finished");
    total
}
