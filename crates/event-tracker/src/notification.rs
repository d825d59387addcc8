//! Lifecycle notifications emitted by the [`crate::tracker::Tracker`].
//!
//! Delivered over a `tokio::sync::broadcast::Sender`, grounded on
//! `rostra-client-db::Database`'s `new_content_subscribe`/
//! `self_head_subscribe` family of `broadcast`-channel accessors: any
//! number of subscribers can listen without the tracker needing to know
//! who, or how many, are out there. A send with no subscribers is not an
//! error — it is simply dropped, the same as the teacher's own channels.

use event_tracker_core::{EventRecord, IgnoredReason, Outcome};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    /// An event was admitted immediately.
    Immediate { record: EventRecord },
    /// An event was deferred for later batch processing.
    Deferred { record: EventRecord },
    /// An event was dropped without changing the record (already
    /// deferred, or the identity's key-limit was reached).
    Ignored {
        category: String,
        id: String,
        reason: IgnoredReason,
        details: Value,
    },
    /// A batch's processor call failed and is about to be retried, after
    /// the given delay.
    Retry {
        attempt: u32,
        max_retries: u32,
        delay_ms: u64,
        events: Vec<EventRecord>,
    },
    /// One record out of a successfully delivered batch was removed.
    Processed { record: EventRecord },
    /// A batch exhausted its retries. The events remain removed from
    /// storage — surfacing the loss is the application's job, not ours.
    ProcessFailed {
        error: String,
        events: Vec<EventRecord>,
        attempts: u32,
    },
    /// `Tracker::update_config` merged a patch into one identity's record.
    ConfigUpdated { record: EventRecord },
    /// A background operation (a processing or purge cycle) failed outright.
    Error { message: String },
}

impl Notification {
    /// `record` is only consulted for [`Outcome::Immediate`]/[`Outcome::Deferred`]
    /// — both of those outcomes always carry one, since they only ever come
    /// back from a [`crate::storage::StorageAdapter::track`] call that wrote
    /// a record. An [`Outcome::Ignored`] never does (the key-limit case
    /// never got as far as creating one), so it carries `details` instead.
    pub fn from_outcome(category: &str, id: &str, details: &Value, outcome: Outcome, record: Option<EventRecord>) -> Self {
        match outcome {
            Outcome::Immediate => Notification::Immediate {
                record: record.expect("an immediate outcome always carries its record"),
            },
            Outcome::Deferred => Notification::Deferred {
                record: record.expect("a deferred outcome always carries its record"),
            },
            Outcome::Ignored(reason) => Notification::Ignored {
                category: category.to_owned(),
                id: id.to_owned(),
                reason,
                details: details.clone(),
            },
        }
    }
}
