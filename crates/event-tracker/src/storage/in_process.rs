//! An in-memory [`StorageAdapter`], suitable for a single process.
//!
//! The record map itself is guarded by one short-lived synchronous lock per
//! operation (never held across an `.await`); per-identity ordering on top
//! of that is provided by [`KeyLockTable`], a self-cleaning table of
//! per-key locks grounded on `rostra-util-dedup-chan`'s `Arc<Mutex<_>>`
//! map-with-refcounted-cleanup technique — reclaiming an idle key's lock
//! the moment its last holder drops it, rather than letting the table grow
//! without bound.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use event_tracker_core::{Decision, EventRecord, NewEvent, Strategy, Timestamp, TrackerConfig};
use itertools::Itertools as _;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::StorageResult;
use crate::storage::{StorageAdapter, TrackOutcome, UpdateFn};

struct KeyLockEntry {
    mutex: Arc<AsyncMutex<()>>,
    refcount: AtomicUsize,
}

#[derive(Default)]
struct KeyLockTable {
    locks: StdMutex<HashMap<String, Arc<KeyLockEntry>>>,
}

impl KeyLockTable {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    async fn lock(self: &Arc<Self>, key: &str) -> KeyLockGuard {
        let entry = {
            let mut locks = self.locks.lock().expect("key lock table poisoned");
            let entry = locks
                .entry(key.to_owned())
                .or_insert_with(|| {
                    Arc::new(KeyLockEntry {
                        mutex: Arc::new(AsyncMutex::new(())),
                        refcount: AtomicUsize::new(0),
                    })
                })
                .clone();
            entry.refcount.fetch_add(1, Ordering::SeqCst);
            entry
        };
        let permit = entry.mutex.clone().lock_owned().await;
        KeyLockGuard {
            table: self.clone(),
            key: key.to_owned(),
            _permit: permit,
        }
    }

    fn release(&self, key: &str) {
        let mut locks = self.locks.lock().expect("key lock table poisoned");
        let Some(entry) = locks.get(key) else {
            return;
        };
        if entry.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
            locks.remove(key);
        }
    }
}

struct KeyLockGuard {
    table: Arc<KeyLockTable>,
    key: String,
    _permit: OwnedMutexGuard<()>,
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        self.table.release(&self.key);
    }
}

#[derive(Default)]
struct SharedState {
    records: HashMap<String, EventRecord>,
    /// `scheduled_send_at` (ms) the key is currently indexed under, kept in
    /// sync with `deferred_index` so a record's due time can be removed in
    /// O(log n) when it changes or clears.
    deferred_due: HashMap<String, u64>,
    deferred_index: BTreeMap<u64, Vec<String>>,
}

impl SharedState {
    fn unindex_deferred(&mut self, key: &str) {
        let Some(ms) = self.deferred_due.remove(key) else {
            return;
        };
        if let Some(keys) = self.deferred_index.get_mut(&ms) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                self.deferred_index.remove(&ms);
            }
        }
    }

    fn reindex(&mut self, key: &str, record: &EventRecord) {
        self.unindex_deferred(key);
        if record.deferred {
            if let Some(due) = record.scheduled_send_at {
                let ms = due.as_millis();
                self.deferred_due.insert(key.to_owned(), ms);
                self.deferred_index.entry(ms).or_default().push(key.to_owned());
            }
        }
    }
}

/// In-memory storage backed by a single process's heap.
pub struct InProcessAdapter {
    state: StdMutex<SharedState>,
    key_locks: Arc<KeyLockTable>,
}

impl InProcessAdapter {
    pub fn new() -> Self {
        InProcessAdapter {
            state: StdMutex::new(SharedState::default()),
            key_locks: KeyLockTable::new(),
        }
    }
}

impl Default for InProcessAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageAdapter for InProcessAdapter {
    async fn get(&self, key: &str) -> StorageResult<Option<EventRecord>> {
        let state = self.state.lock().expect("in-process store poisoned");
        Ok(state.records.get(key).cloned())
    }

    async fn set(&self, key: &str, record: EventRecord) -> StorageResult<()> {
        let mut state = self.state.lock().expect("in-process store poisoned");
        state.reindex(key, &record);
        state.records.insert(key.to_owned(), record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let mut state = self.state.lock().expect("in-process store poisoned");
        state.unindex_deferred(key);
        Ok(state.records.remove(key).is_some())
    }

    async fn size(&self) -> StorageResult<u64> {
        let state = self.state.lock().expect("in-process store poisoned");
        Ok(state.records.len() as u64)
    }

    async fn track(
        &self,
        key: &str,
        event: &NewEvent<'_>,
        now: Timestamp,
        tracker_config: &TrackerConfig,
        strategy: &dyn Strategy,
    ) -> StorageResult<TrackOutcome> {
        // One lock acquisition covers the max_keys check and the write: a
        // second concurrent `track` for a different brand-new key can't
        // slip between the check and the insert the way it could when
        // those were two separate calls.
        let _guard = self.key_locks.lock(key).await;
        let mut state = self.state.lock().expect("in-process store poisoned");

        let prior = state.records.get(key).cloned();
        let max_keys = tracker_config.max_keys;
        if prior.is_none() && max_keys > 0 && (state.records.len() as u64) >= max_keys {
            return Ok(TrackOutcome::KeyLimitReached);
        }

        let fresh_prior = prior.filter(|record| {
            !record.is_expired(now) && !record.details_changed(event.details_hash)
        });
        let decision @ Decision { ref record, .. } =
            strategy.decide(fresh_prior.as_ref(), event, now, tracker_config);
        state.reindex(key, record);
        state.records.insert(key.to_owned(), record.clone());
        Ok(TrackOutcome::Decided(decision))
    }

    async fn update(&self, key: &str, update: &UpdateFn<'_>) -> StorageResult<Option<EventRecord>> {
        let _guard = self.key_locks.lock(key).await;
        let mut state = self.state.lock().expect("in-process store poisoned");
        let prior = state.records.get(key).cloned();
        let next = update(prior);
        match next.clone() {
            Some(record) => {
                state.reindex(key, &record);
                state.records.insert(key.to_owned(), record);
            }
            None => {
                state.unindex_deferred(key);
                state.records.remove(key);
            }
        }
        Ok(next)
    }

    async fn find_all_deferred(&self) -> StorageResult<Vec<EventRecord>> {
        let state = self.state.lock().expect("in-process store poisoned");
        Ok(state
            .records
            .values()
            .filter(|r| r.deferred)
            .cloned()
            .sorted_by_key(|r| r.key.clone())
            .collect())
    }

    async fn find_due_deferred(&self, now: Timestamp) -> StorageResult<Vec<EventRecord>> {
        let state = self.state.lock().expect("in-process store poisoned");
        let now_ms = now.as_millis();
        let mut out = Vec::new();
        for keys in state.deferred_index.range(..=now_ms).map(|(_, keys)| keys) {
            for key in keys {
                if let Some(record) = state.records.get(key) {
                    out.push(record.clone());
                }
            }
        }
        Ok(out)
    }

    async fn pop_due_deferred(&self, now: Timestamp, limit: usize) -> StorageResult<Vec<EventRecord>> {
        let mut state = self.state.lock().expect("in-process store poisoned");
        let now_ms = now.as_millis();
        let due_keys: Vec<String> = state
            .deferred_index
            .range(..=now_ms)
            .flat_map(|(_, keys)| keys.clone())
            .take(limit)
            .collect();

        let mut out = Vec::with_capacity(due_keys.len());
        for key in due_keys {
            state.unindex_deferred(&key);
            if let Some(record) = state.records.remove(&key) {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn purge_expired(&self, now: Timestamp) -> StorageResult<u64> {
        let mut state = self.state.lock().expect("in-process store poisoned");
        let expired: Vec<String> = state
            .records
            .iter()
            .filter(|(_, record)| record.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.unindex_deferred(key);
            state.records.remove(key);
        }
        Ok(expired.len() as u64)
    }

    async fn destroy(&self) -> StorageResult<()> {
        let mut state = self.state.lock().expect("in-process store poisoned");
        state.records.clear();
        state.deferred_due.clear();
        state.deferred_index.clear();
        Ok(())
    }
}
