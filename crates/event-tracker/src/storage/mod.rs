//! The storage seam: everything the [`crate::tracker::Tracker`] needs from
//! a backing store, without caring whether that store lives in this
//! process or behind a network round trip.
//!
//! Grounded on `Database`'s public surface in `rostra-client-db/src/lib.rs`
//! (`read_with`/`write_with` closure-passing methods over a single backing
//! store) but made an explicit `#[async_trait]` trait, since this workspace
//! has two real implementations rather than the teacher's one.

pub mod distributed;
pub mod in_process;

use async_trait::async_trait;
use event_tracker_core::{Decision, EventRecord, NewEvent, Strategy, Timestamp, TrackerConfig};

use crate::error::StorageResult;

/// A closure applied to the current record (if any) at a key, producing the
/// record that should replace it (or `None` to delete it). Adapters that
/// cannot update in place without a round trip (the distributed adapter)
/// may invoke this more than once around a retried optimistic write; it
/// must therefore be a plain `Fn`, not `FnOnce`.
pub type UpdateFn<'a> = dyn Fn(Option<EventRecord>) -> Option<EventRecord> + Send + Sync + 'a;

/// What [`StorageAdapter::track`] settled on.
#[derive(Clone, Debug, PartialEq)]
pub enum TrackOutcome {
    /// The strategy ran (against a fresh prior record, or none) and
    /// produced this decision, already durably written.
    Decided(Decision),
    /// `max_keys` was already reached and `key` names a brand-new identity;
    /// the strategy never ran, and nothing was written.
    KeyLimitReached,
}

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<EventRecord>>;

    async fn set(&self, key: &str, record: EventRecord) -> StorageResult<()>;

    async fn delete(&self, key: &str) -> StorageResult<bool>;

    async fn size(&self) -> StorageResult<u64>;

    /// Track one event for `key` as a single atomic compound operation: load
    /// the prior record (if any and still fresh), gate it against
    /// `tracker_config.max_keys` when `key` is brand-new, run `strategy` to
    /// decide the outcome, and durably write the result — all without
    /// another `track` call for the same key observing an intermediate
    /// state. This is the one operation every caller should use to apply an
    /// event; `get`/`set`/`update` exist for inspection and maintenance, not
    /// for composing a read-modify-write by hand.
    async fn track(
        &self,
        key: &str,
        event: &NewEvent<'_>,
        now: Timestamp,
        tracker_config: &TrackerConfig,
        strategy: &dyn Strategy,
    ) -> StorageResult<TrackOutcome>;

    /// Atomically read-modify-write the record at `key`, returning the
    /// value `update` settled on (or `None` if it deleted the record).
    async fn update(&self, key: &str, update: &UpdateFn<'_>) -> StorageResult<Option<EventRecord>>;

    /// All currently-deferred records, for inspection (`Tracker::deferred_events`).
    async fn find_all_deferred(&self) -> StorageResult<Vec<EventRecord>>;

    /// Deferred records whose `scheduled_send_at` is at or before `now`,
    /// without removing them — used by callers that only want to peek.
    async fn find_due_deferred(&self, now: Timestamp) -> StorageResult<Vec<EventRecord>>;

    /// Atomically claim and remove up to `limit` deferred records due at or
    /// before `now`. Once popped, a record is gone from the store entirely
    /// — whether the caller's processor goes on to deliver it or not — so
    /// a concurrent processor run can't double-claim it, and a batch that
    /// exhausts its retries doesn't linger.
    async fn pop_due_deferred(&self, now: Timestamp, limit: usize) -> StorageResult<Vec<EventRecord>>;

    /// Remove records whose `expires_at` is at or before `now`. Returns how
    /// many were removed. The in-process adapter actively scans for these;
    /// the distributed adapter relies on a Redis key TTL instead, so it
    /// always returns `0` here — expiry already happened server-side.
    async fn purge_expired(&self, now: Timestamp) -> StorageResult<u64>;

    /// Release any background resources (timers, connections). Idempotent.
    async fn destroy(&self) -> StorageResult<()>;
}
