//! Batches resolved records into storage and marks their keys processed.
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info};

use crate::checkpoint::CheckpointManager;
use crate::identifier::CandidateIdentifier;
use crate::model::{CanonicalRecord, Key, ResolvedRecord};
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistStats {
    pub batches: u64,
    pub records: u64,
    pub persons: u64,
    pub failed_batches: u64,
}

/// Pending records deduplicated by identifier; every contributing key is kept.
#[derive(Debug, Default)]
struct Batch {
    records: IndexMap<CandidateIdentifier, CanonicalRecord>,
    keys: Vec<Key>,
}

impl Batch {
    fn push(&mut self, item: ResolvedRecord) {
        self.records.insert(item.record.identifier, item.record);
        self.keys.push(item.key);
    }

    fn len(&self) -> usize {
        self.keys.len()
    }

    fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

pub struct BatchPersister {
    storage: Arc<dyn Storage>,
    checkpoint: Arc<CheckpointManager>,
    batch_size: usize,
    batch_timeout: Duration,
}

impl BatchPersister {
    pub fn new(
        storage: Arc<dyn Storage>,
        checkpoint: Arc<CheckpointManager>,
        batch_size: usize,
        batch_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            checkpoint,
            batch_size: batch_size.max(1),
            batch_timeout,
        }
    }

    /// Consumes the result queue until every sender is gone, flushing on size
    /// or when the oldest pending record has waited `batch_timeout`.
    pub async fn run(self, mut rx: mpsc::Receiver<ResolvedRecord>) -> PersistStats {
        let mut stats = PersistStats::default();
        let mut batch = Batch::default();
        let mut deadline = Instant::now();
        loop {
            let next = if batch.is_empty() {
                rx.recv().await
            } else {
                match timeout_at(deadline, rx.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        debug!(pending = batch.len(), "batch timeout");
                        self.flush(std::mem::take(&mut batch), &mut stats).await;
                        continue;
                    }
                }
            };
            let Some(item) = next else { break };
            if batch.is_empty() {
                deadline = Instant::now() + self.batch_timeout;
            }
            batch.push(item);
            if batch.len() >= self.batch_size {
                self.flush(std::mem::take(&mut batch), &mut stats).await;
            }
        }
        if !batch.is_empty() {
            self.flush(batch, &mut stats).await;
        }
        info!(
            batches = stats.batches,
            records = stats.records,
            failed_batches = stats.failed_batches,
            "persister drained"
        );
        stats
    }

    async fn flush(&self, batch: Batch, stats: &mut PersistStats) {
        let records: Vec<CanonicalRecord> = batch.records.into_values().collect();
        match self.storage.persist_batch(&records).await {
            Ok(report) => {
                stats.batches += 1;
                stats.records += report.entities as u64;
                stats.persons += report.persons as u64;
                debug!(
                    keys = batch.keys.len(),
                    entities = report.entities,
                    persons = report.persons,
                    "batch persisted"
                );
                self.checkpoint.mark_saved(batch.keys);
            }
            Err(err) => {
                stats.failed_batches += 1;
                let sample: Vec<String> = batch.keys.iter().take(5).map(|k| k.to_string()).collect();
                error!(
                    error = %err,
                    keys = batch.keys.len(),
                    sample = ?sample,
                    "batch dropped; its keys will be retried next run"
                );
                self.checkpoint.record_batch_failure();
            }
        }
    }
}
