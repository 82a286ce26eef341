//! Durable record of processed keys and run counters.
//!
//! The blob is a versioned JSON snapshot. Writes go to a temporary file that
//! is renamed over the previous snapshot, so a crash mid-write leaves the last
//! good checkpoint in place.
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::CheckpointError;
use crate::model::{Counters, Key};

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub version: u32,
    pub processed_keys: BTreeSet<Key>,
    pub counters: Counters,
    #[serde(default)]
    pub last_key: Option<Key>,
    pub updated_at: DateTime<Utc>,
}

impl Default for CheckpointState {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            processed_keys: BTreeSet::new(),
            counters: Counters::default(),
            last_key: None,
            updated_at: Utc::now(),
        }
    }
}

impl CheckpointState {
    pub fn decode(bytes: &[u8]) -> Result<Self, CheckpointError> {
        let state: Self = serde_json::from_slice(bytes)?;
        if state.version > CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: state.version,
                supported: CHECKPOINT_VERSION,
            });
        }
        Ok(state)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CheckpointError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A flat durable blob.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// `None` when nothing has been written yet.
    async fn read(&self) -> Result<Option<Vec<u8>>, CheckpointError>;
    async fn write(&self, bytes: &[u8]) -> Result<(), CheckpointError>;
}

#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn read(&self) -> Result<Option<Vec<u8>>, CheckpointError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), CheckpointError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Keeps the blob in memory; backs dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    blob: Mutex<Option<Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: &CheckpointState) -> Result<Self, CheckpointError> {
        let store = Self::new();
        *store.lock() = Some(state.encode()?);
        Ok(store)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn state(&self) -> Option<CheckpointState> {
        self.lock().as_deref().and_then(|b| CheckpointState::decode(b).ok())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        self.blob.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn read(&self) -> Result<Option<Vec<u8>>, CheckpointError> {
        Ok(self.lock().clone())
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), CheckpointError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("checkpoint store rejected write").into());
        }
        *self.lock() = Some(bytes.to_vec());
        Ok(())
    }
}

/// Owns the in-memory checkpoint state and decides when it is written out.
///
/// Other components read snapshots; mutations happen through the `record_*`
/// and `mark_*` methods. Every newly processed key counts towards the save
/// threshold, and [`CheckpointManager::wait_due`] wakes once it is reached.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    state: Mutex<CheckpointState>,
    save_every: usize,
    dirty: AtomicUsize,
    due: Notify,
    write_lock: tokio::sync::Mutex<()>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, state: CheckpointState, save_every: usize) -> Self {
        Self {
            store,
            state: Mutex::new(state),
            save_every: save_every.max(1),
            dirty: AtomicUsize::new(0),
            due: Notify::new(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Resumes from the stored blob, or starts fresh when there is none.
    pub async fn load(store: Arc<dyn CheckpointStore>, save_every: usize) -> Result<Self, CheckpointError> {
        let state = Self::read_state(store.as_ref()).await?;
        Ok(Self::new(store, state, save_every))
    }

    /// Opens the checkpoint file at `path`.
    ///
    /// `fresh` ignores whatever is stored there. With `dry_run` the stored
    /// state is still read, but every later save stays in memory and the file
    /// is never written.
    pub async fn open(
        path: impl Into<PathBuf>,
        save_every: usize,
        fresh: bool,
        dry_run: bool,
    ) -> Result<Self, CheckpointError> {
        let file = Arc::new(FileCheckpointStore::new(path));
        let state = if fresh {
            warn!(path = %file.path.display(), "ignoring existing checkpoint");
            CheckpointState::default()
        } else {
            Self::read_state(file.as_ref()).await?
        };
        let store: Arc<dyn CheckpointStore> = if dry_run {
            Arc::new(MemoryCheckpointStore::with_state(&state)?)
        } else {
            file
        };
        Ok(Self::new(store, state, save_every))
    }

    async fn read_state(store: &dyn CheckpointStore) -> Result<CheckpointState, CheckpointError> {
        let state = match store.read().await? {
            Some(bytes) => {
                let state = CheckpointState::decode(&bytes)?;
                info!(
                    processed = state.processed_keys.len(),
                    attempted = state.counters.attempted,
                    saved = state.counters.saved,
                    updated_at = %state.updated_at,
                    "resuming from checkpoint"
                );
                state
            }
            None => {
                info!("no checkpoint found; starting fresh");
                CheckpointState::default()
            }
        };
        Ok(state)
    }

    fn lock(&self) -> MutexGuard<'_, CheckpointState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn snapshot(&self) -> CheckpointState {
        self.lock().clone()
    }

    pub fn processed_keys(&self) -> BTreeSet<Key> {
        self.lock().processed_keys.clone()
    }

    pub fn processed_count(&self) -> usize {
        self.lock().processed_keys.len()
    }

    pub fn counters(&self) -> Counters {
        self.lock().counters
    }

    pub fn record_attempt(&self) {
        self.lock().counters.attempted += 1;
    }

    pub fn record_found(&self) {
        self.lock().counters.found += 1;
    }

    /// Terminal not-found for a key; nothing will ever be persisted for it.
    pub fn record_not_found(&self, key: Key) {
        let fresh = {
            let mut state = self.lock();
            state.counters.not_found += 1;
            Self::insert(&mut state, key)
        };
        self.bump(fresh);
    }

    /// Terminal resolution failure for a key.
    pub fn record_error(&self, key: Key) {
        let fresh = {
            let mut state = self.lock();
            state.counters.errors += 1;
            Self::insert(&mut state, key)
        };
        self.bump(fresh);
    }

    /// Keys whose records were part of a successful flush.
    pub fn mark_saved(&self, keys: impl IntoIterator<Item = Key>) {
        let fresh = {
            let mut state = self.lock();
            let mut fresh = 0;
            for key in keys {
                state.counters.saved += 1;
                fresh += Self::insert(&mut state, key);
            }
            fresh
        };
        self.bump(fresh);
    }

    /// A dropped batch. Its keys stay unprocessed so the next run retries them.
    pub fn record_batch_failure(&self) {
        let mut state = self.lock();
        state.counters.errors += 1;
        state.counters.failed_batches += 1;
    }

    fn insert(state: &mut CheckpointState, key: Key) -> usize {
        if state.processed_keys.insert(key.clone()) {
            state.last_key = Some(key);
            1
        } else {
            0
        }
    }

    fn bump(&self, fresh: usize) {
        if fresh == 0 {
            return;
        }
        // Fires on every multiple of `save_every`; `dirty` keeps growing
        // across failed writes.
        let before = self.dirty.fetch_add(fresh, Ordering::SeqCst);
        if before / self.save_every != (before + fresh) / self.save_every {
            self.due.notify_one();
        }
    }

    /// Completes once `save_every` keys have been processed since the last save.
    pub async fn wait_due(&self) {
        self.due.notified().await;
    }

    pub async fn save(&self) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().await;
        let (bytes, pending, processed) = {
            let mut state = self.lock();
            state.updated_at = Utc::now();
            let pending = self.dirty.swap(0, Ordering::SeqCst);
            (state.encode()?, pending, state.processed_keys.len())
        };
        if let Err(err) = self.store.write(&bytes).await {
            self.dirty.fetch_add(pending, Ordering::SeqCst);
            return Err(err);
        }
        debug!(processed, bytes = bytes.len(), "checkpoint saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(i: usize) -> Key {
        Key::new(format!("{i:07}"), "4711-3/02")
    }

    #[tokio::test]
    async fn file_round_trip_resumes_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cp.json");
        let store = Arc::new(FileCheckpointStore::new(&path));

        let cp = CheckpointManager::load(store.clone(), 10).await.unwrap();
        assert_eq!(cp.processed_count(), 0);
        cp.record_attempt();
        cp.record_attempt();
        cp.record_found();
        cp.mark_saved([key(1)]);
        cp.record_not_found(key(2));
        cp.save().await.unwrap();
        assert!(!dir.path().join("nested").join("cp.json.tmp").exists());

        let resumed = CheckpointManager::load(store, 10).await.unwrap();
        let snap = resumed.snapshot();
        assert_eq!(snap.processed_keys.len(), 2);
        assert_eq!(snap.last_key, Some(key(2)));
        assert_eq!(snap.counters.attempted, 2);
        assert_eq!(snap.counters.saved, 1);
        assert_eq!(snap.counters.not_found, 1);
    }

    #[tokio::test]
    async fn dry_run_never_writes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        let seeded = CheckpointState {
            processed_keys: [key(1)].into_iter().collect(),
            ..CheckpointState::default()
        };
        std::fs::write(&path, seeded.encode().unwrap()).unwrap();
        let before = std::fs::read(&path).unwrap();

        let dry = CheckpointManager::open(&path, 1, false, true).await.unwrap();
        assert_eq!(dry.processed_count(), 1);
        dry.mark_saved([key(2), key(3)]);
        dry.save().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);

        let fresh_dry = CheckpointManager::open(&path, 1, true, true).await.unwrap();
        assert_eq!(fresh_dry.processed_count(), 0);
        fresh_dry.save().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);

        let real = CheckpointManager::open(&path, 1, false, false).await.unwrap();
        assert_eq!(real.processed_count(), 1);
        real.mark_saved([key(2)]);
        real.save().await.unwrap();
        let resumed = CheckpointManager::open(&path, 1, false, false).await.unwrap();
        assert_eq!(resumed.processed_count(), 2);
    }

    #[tokio::test]
    async fn unreadable_or_newer_checkpoints_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = Arc::new(FileCheckpointStore::new(&path));
        assert!(matches!(
            CheckpointManager::load(store.clone(), 1).await,
            Err(CheckpointError::Format(_))
        ));

        let future = CheckpointState {
            version: CHECKPOINT_VERSION + 1,
            ..CheckpointState::default()
        };
        std::fs::write(&path, future.encode().unwrap()).unwrap();
        assert!(matches!(
            CheckpointManager::load(store, 1).await,
            Err(CheckpointError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn processed_keys_have_set_semantics() {
        let cp = CheckpointManager::new(Arc::new(MemoryCheckpointStore::new()), CheckpointState::default(), 100);
        cp.record_error(key(1));
        cp.mark_saved([key(1), key(2)]);
        cp.record_batch_failure();
        let snap = cp.snapshot();
        assert_eq!(snap.processed_keys.len(), 2);
        assert_eq!(snap.counters.errors, 2);
        assert_eq!(snap.counters.failed_batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wakes_when_threshold_reached() {
        let cp = Arc::new(CheckpointManager::new(
            Arc::new(MemoryCheckpointStore::new()),
            CheckpointState::default(),
            3,
        ));
        let waiter = {
            let cp = cp.clone();
            tokio::spawn(async move { cp.wait_due().await })
        };
        tokio::task::yield_now().await;
        cp.record_not_found(key(1));
        cp.record_not_found(key(1));
        cp.mark_saved([key(2)]);
        assert!(!waiter.is_finished());
        cp.record_error(key(3));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("threshold notification")
            .unwrap();
    }

    #[tokio::test]
    async fn failed_write_is_reported_and_retried() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let cp = CheckpointManager::new(store.clone(), CheckpointState::default(), 100);
        cp.record_not_found(key(1));
        store.fail_writes(true);
        assert!(cp.save().await.is_err());
        assert!(store.state().is_none());
        store.fail_writes(false);
        cp.save().await.unwrap();
        assert_eq!(store.state().unwrap().processed_keys.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_after_failed_write_trigger_another_save() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let cp = Arc::new(CheckpointManager::new(store.clone(), CheckpointState::default(), 2));
        store.fail_writes(true);
        cp.record_not_found(key(1));
        cp.record_not_found(key(2));
        tokio::time::timeout(Duration::from_secs(1), cp.wait_due())
            .await
            .expect("first threshold");
        assert!(cp.save().await.is_err());

        let waiter = {
            let cp = cp.clone();
            tokio::spawn(async move { cp.wait_due().await })
        };
        tokio::task::yield_now().await;
        cp.record_not_found(key(3));
        assert!(!waiter.is_finished());
        cp.record_not_found(key(4));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("second threshold")
            .unwrap();

        store.fail_writes(false);
        cp.save().await.unwrap();
        assert_eq!(store.state().unwrap().processed_keys.len(), 4);
    }
}
