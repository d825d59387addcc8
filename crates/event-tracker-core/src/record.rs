//! The per-identity record: what a storage adapter persists and what a
//! [`crate::Strategy`] reads and rewrites on every event.

use serde_json::Value;

use crate::config::RecordConfig;
use crate::timestamp::Timestamp;

/// Opaque, strategy-owned state carried alongside the common record fields.
///
/// Tagged so it round-trips through storage without the adapter needing to
/// know which strategy produced it; a strategy only ever reads the variant
/// matching its own [`crate::StrategyKind`].
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StrategyData {
    Simple,
    TokenBucket { tokens: f64, last_refill: Timestamp },
    SlidingWindow {
        current_count: u64,
        previous_count: u64,
        window_start: Timestamp,
    },
}

impl StrategyData {
    pub fn kind(&self) -> crate::StrategyKind {
        match self {
            StrategyData::Simple => crate::StrategyKind::Simple,
            StrategyData::TokenBucket { .. } => crate::StrategyKind::TokenBucket,
            StrategyData::SlidingWindow { .. } => crate::StrategyKind::SlidingWindow,
        }
    }
}

/// The persisted state for one `(category, id)` identity.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EventRecord {
    pub key: String,
    pub category: String,
    pub id: String,
    pub details: Value,
    pub details_hash: String,
    pub count: u64,
    pub last_event_time: Timestamp,
    pub expires_at: Timestamp,
    pub deferred: bool,
    pub scheduled_send_at: Option<Timestamp>,
    pub config: RecordConfig,
    pub strategy_data: StrategyData,
}

impl EventRecord {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_before(now)
    }

    /// Whether `details_hash` differs from the one this record was created
    /// with, i.e. whether a `track` call should treat this record as stale
    /// and reinitialize rather than accumulate onto it.
    pub fn details_changed(&self, incoming_hash: &str) -> bool {
        self.details_hash != incoming_hash
    }
}
