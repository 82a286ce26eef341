//! Deterministic walk of the (location × category) key space.
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::model::{Category, Key, Location, WorkUnit};

/// Item on the work queue.
#[derive(Debug, Clone)]
pub enum WorkItem {
    Unit(WorkUnit),
    /// One per worker once the space is exhausted.
    Stop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProduceStats {
    pub enqueued: u64,
    pub skipped: u64,
    pub cancelled: bool,
}

/// Locations ordered by descending weight (ties by code), categories in
/// catalog order. The order only depends on the reference data.
#[derive(Debug, Clone)]
pub struct KeySpace {
    locations: Vec<Arc<Location>>,
    categories: Vec<Arc<Category>>,
}

impl KeySpace {
    pub fn new(mut locations: Vec<Location>, categories: Vec<Category>) -> Self {
        locations.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.code.cmp(&b.code))
        });
        Self {
            locations: locations.into_iter().map(Arc::new).collect(),
            categories: categories.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.locations.len() * self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn locations(&self) -> &[Arc<Location>] {
        &self.locations
    }

    pub fn categories(&self) -> &[Arc<Category>] {
        &self.categories
    }

    pub fn iter(&self) -> impl Iterator<Item = WorkUnit> + '_ {
        self.locations.iter().flat_map(move |loc| {
            self.categories
                .iter()
                .map(move |cat| WorkUnit::new(loc.clone(), cat.clone()))
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.iter().map(|u| u.key)
    }

    /// Keys in the space that are not yet processed.
    pub fn remaining(&self, processed: &BTreeSet<Key>) -> usize {
        self.keys().filter(|k| !processed.contains(k)).count()
    }

    /// Feeds every unprocessed key into `tx`, then one [`WorkItem::Stop`] per worker.
    ///
    /// Sending suspends while the queue is full. On cancellation production
    /// stops and no stop items are sent; workers watch the token themselves.
    pub async fn produce(
        &self,
        processed: &BTreeSet<Key>,
        tx: &mpsc::Sender<WorkItem>,
        workers: usize,
        cancel: &CancellationToken,
    ) -> ProduceStats {
        let mut stats = ProduceStats::default();
        for unit in self.iter() {
            if processed.contains(&unit.key) {
                stats.skipped += 1;
                continue;
            }
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                res = tx.send(WorkItem::Unit(unit)) => Some(res.is_ok()),
            };
            match sent {
                Some(true) => stats.enqueued += 1,
                Some(false) => {
                    debug!("work queue closed; producer exiting");
                    return stats;
                }
                None => {
                    stats.cancelled = true;
                    info!(enqueued = stats.enqueued, "producer cancelled");
                    return stats;
                }
            }
        }
        for _ in 0..workers {
            if tx.send(WorkItem::Stop).await.is_err() {
                break;
            }
        }
        info!(enqueued = stats.enqueued, skipped = stats.skipped, "key space exhausted");
        stats
    }
}
