//! Debounced snapshot writes.
//!
//! State changes mark the store dirty; the first mark after a flush
//! schedules a write `flush_delay_ms` later and further marks coalesce into
//! that same deadline. Callers poll with [`Persistence::flush_if_due`] at
//! natural checkpoints and force a write with [`Persistence::flush`] before
//! shutdown or before reading the file back.

use std::sync::Arc;
use tokio::sync::Mutex;

use super::quota::{StorageManager, StorageQuota};
use super::snapshot::PersistentStore;
use super::types::StoreError;
use crate::clock::Clock;
use crate::state::SyncState;

/// Dirty flag plus the deadline of the scheduled flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushState {
    due_at: Option<i64>,
}

impl FlushState {
    /// Record a change at `now_ms`. Returns true if this scheduled a new flush.
    pub fn mark_dirty(&mut self, now_ms: i64, delay_ms: i64) -> bool {
        if self.due_at.is_some() {
            return false;
        }
        self.due_at = Some(now_ms.saturating_add(delay_ms));
        true
    }

    pub fn is_dirty(&self) -> bool {
        self.due_at.is_some()
    }

    pub fn is_due(&self, now_ms: i64) -> bool {
        self.due_at.is_some_and(|due| now_ms >= due)
    }

    pub fn due_at(&self) -> Option<i64> {
        self.due_at
    }

    fn clear(&mut self) {
        self.due_at = None;
    }
}

pub struct Persistence {
    state: Arc<SyncState>,
    store: PersistentStore,
    storage: StorageManager,
    clock: Arc<dyn Clock>,
    flush: Mutex<FlushState>,
    delay_ms: i64,
}

impl Persistence {
    pub fn new(
        state: Arc<SyncState>,
        store: PersistentStore,
        storage: StorageManager,
        clock: Arc<dyn Clock>,
        delay_ms: u64,
    ) -> Self {
        Self {
            state,
            store,
            storage,
            clock,
            flush: Mutex::new(FlushState::default()),
            delay_ms: i64::try_from(delay_ms).unwrap_or(i64::MAX),
        }
    }

    pub fn store(&self) -> &PersistentStore {
        &self.store
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub async fn flush_state(&self) -> FlushState {
        *self.flush.lock().await
    }

    pub async fn mark_dirty(&self) {
        let now = self.clock.now_ms();
        if self.flush.lock().await.mark_dirty(now, self.delay_ms) {
            tracing::trace!(due_in_ms = self.delay_ms, "Scheduled state flush");
        }
    }

    /// Write if a scheduled flush has come due. Returns whether a write happened.
    pub async fn flush_if_due(&self) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        if !self.flush.lock().await.is_due(now) {
            return Ok(false);
        }
        self.flush().await
    }

    /// Write now if anything changed since the last flush.
    ///
    /// The flush lock is released before writing so state owners can keep
    /// marking changes while the snapshot is taken; a failed write
    /// re-schedules itself.
    pub async fn flush(&self) -> Result<bool, StoreError> {
        let was_dirty = {
            let mut flush = self.flush.lock().await;
            let dirty = flush.is_dirty();
            flush.clear();
            dirty
        };
        if !was_dirty {
            return Ok(false);
        }
        if let Err(e) = self.save_now().await {
            self.flush
                .lock()
                .await
                .mark_dirty(self.clock.now_ms(), self.delay_ms);
            return Err(e);
        }
        Ok(true)
    }

    /// Serialized size of the current state.
    pub async fn occupied_bytes(&self) -> Result<u64, StoreError> {
        Ok(self.state.snapshot().await.encode()?.len() as u64)
    }

    pub async fn quota(&self) -> Result<StorageQuota, StoreError> {
        Ok(self.storage.quota(self.occupied_bytes().await?))
    }

    /// Threshold eviction against the current occupancy; marks dirty if
    /// anything was removed.
    pub async fn enforce_quota(&self) -> Result<Vec<String>, StoreError> {
        let quota = self.quota().await?;
        let removed = self
            .storage
            .evict_if_over_threshold(&self.state, quota)
            .await;
        if !removed.is_empty() {
            self.mark_dirty().await;
        }
        Ok(removed)
    }

    /// Write the snapshot unconditionally.
    ///
    /// When the write does not fit, one eviction pass runs and the write is
    /// retried once; a second failure is returned to the caller.
    pub async fn save_now(&self) -> Result<u64, StoreError> {
        match self.try_save().await {
            Err(e) if e.is_storage_full() => {
                tracing::warn!(error = %e, "Storage full, evicting and retrying save");
                let quota = self.quota().await?;
                // Past the quota means past any threshold, so this always evicts.
                let evicted = self
                    .storage
                    .evict_if_over_threshold(&self.state, StorageQuota {
                        occupied_bytes: quota.occupied_bytes.max(quota.quota_bytes),
                        ..quota
                    })
                    .await;
                tracing::debug!(evicted = evicted.len(), "Evicted before retrying save");
                self.try_save().await.inspect_err(|e| {
                    tracing::error!(error = %e, "Save failed after eviction");
                })
            }
            other => other,
        }
    }

    async fn try_save(&self) -> Result<u64, StoreError> {
        let bytes = self.state.snapshot().await.encode()?;
        let quota = self.storage.quota(bytes.len() as u64);
        if !quota.fits() {
            return Err(StoreError::StorageFull {
                needed: quota.occupied_bytes,
                quota: quota.quota_bytes,
            });
        }
        self.store.write(&bytes)?;
        tracing::debug!(path = %self.store.path().display(), bytes = bytes.len(), "Saved state");
        Ok(bytes.len() as u64)
    }
}
