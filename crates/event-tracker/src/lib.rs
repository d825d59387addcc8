//! The event aggregation and throttling engine: binds the pure types in
//! `event-tracker-core` to a pluggable storage backend and runs the
//! background processing and purge loops.

mod error;
mod notification;
pub mod storage;
mod tracker;

pub use error::{StorageError, StorageResult, TrackError, TrackResult};
pub use notification::Notification;
pub use storage::distributed::DistributedAdapter;
pub use storage::in_process::InProcessAdapter;
pub use storage::StorageAdapter;
pub use tracker::{Processor, ProcessorFuture, Tracker};

pub use event_tracker_core::{
    composite_key, details_hash, ConfigError, ConfigResult, EventRecord, IgnoredReason, Outcome,
    RecordConfig, StrategyKind, TrackerConfig,
};
