//! The `Strategy` trait and the shared decision vocabulary ([`Outcome`],
//! [`Decision`]); concrete strategies live in the sibling `strategy/`
//! modules.

pub mod simple;
pub mod sliding_window;
pub mod token_bucket;

use serde_json::Value;

use crate::config::TrackerConfig;
use crate::record::EventRecord;
use crate::timestamp::Timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Simple,
    TokenBucket,
    SlidingWindow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoredReason {
    AlreadyDeferred,
    KeyLimitReached,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Immediate,
    Deferred,
    Ignored(IgnoredReason),
}

/// The result of applying a [`Strategy`] to one event: what happened, and
/// the record as it should be persisted afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub outcome: Outcome,
    pub record: EventRecord,
}

/// The inputs needed to create a fresh [`EventRecord`] when no prior record
/// exists (or the prior one was stale and is being reinitialized).
pub struct NewEvent<'a> {
    pub key: &'a str,
    pub category: &'a str,
    pub id: &'a str,
    pub details: &'a Value,
    pub details_hash: &'a str,
}

/// A pluggable rate-limiting policy.
///
/// Implementations are pure: given the prior record (if any, and guaranteed
/// fresh — same `details_hash`, not expired), the incoming event, the
/// current time, and the tracker's current defaults, produce the next
/// record and the outcome for this event. Callers are responsible for the
/// freshness check and for the key-limit gate that can turn any outcome
/// into [`IgnoredReason::KeyLimitReached`] before a record is even created.
pub trait Strategy: std::fmt::Debug + Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn decide(
        &self,
        prior: Option<&EventRecord>,
        event: &NewEvent<'_>,
        now: Timestamp,
        tracker_config: &TrackerConfig,
    ) -> Decision;
}

pub fn for_kind(kind: StrategyKind) -> Box<dyn Strategy> {
    match kind {
        StrategyKind::Simple => Box::new(simple::SimpleCounterStrategy),
        StrategyKind::TokenBucket => Box::new(token_bucket::TokenBucketStrategy),
        StrategyKind::SlidingWindow => Box::new(sliding_window::SlidingWindowStrategy),
    }
}
