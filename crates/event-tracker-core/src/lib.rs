//! Pure types and algorithms for the event tracker: identity hashing, the
//! record value type, tracker configuration, and the pluggable throttling
//! strategies.
//!
//! This crate has no I/O: everything here is synchronous and side-effect
//! free, so it can be exercised directly by the storage adapters in
//! `event-tracker` (in-process) and replayed, arm-by-arm, inside a
//! server-side script against a shared store (distributed).

mod config;
mod identity;
mod record;
mod strategy;
mod timestamp;

pub use config::{ConfigError, ConfigResult, RecordConfig, TrackerConfig};
pub use identity::{
    composite_key, details_hash, validate_identity, IdentityError, IdentityResult,
};
pub use record::{EventRecord, StrategyData};
pub use strategy::simple::SimpleCounterStrategy;
pub use strategy::sliding_window::SlidingWindowStrategy;
pub use strategy::token_bucket::TokenBucketStrategy;
pub use strategy::{for_kind, Decision, IgnoredReason, NewEvent, Outcome, Strategy, StrategyKind};
pub use timestamp::Timestamp;
