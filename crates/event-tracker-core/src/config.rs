//! Tracker-wide configuration: the recognized options and their defaults,
//! plus the per-identity snapshot ([`RecordConfig`]) captured onto each
//! record at creation time.
//!
//! Grounded on `rostra-core/src/event.rs`'s `#[bon::bon] impl Event { fn new
//! (...) }` builder, which validates its inputs inside the constructor and
//! returns a `Result` rather than panicking.

use bon::bon;
use snafu::{Location, Snafu};

use crate::StrategyKind;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("{field} must be finite, got {value}"))]
    NotFinite {
        field: &'static str,
        value: f64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{field} must be >= {min}, got {value}"))]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Tracker-wide defaults, recognized and validated at construction and
/// frozen for the tracker's lifetime thereafter. Per-identity overlays go
/// through [`RecordConfig`] instead.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TrackerConfig {
    pub strategy: StrategyKind,
    pub limit: u64,
    pub defer_interval_ms: u64,
    pub expire_time_ms: u64,
    pub max_keys: u64,
    pub processing_interval_ms: u64,
    pub purge_interval_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub bucket_size: f64,
    pub refill_rate: f64,
    pub window_size_ms: u64,
}

impl TrackerConfig {
    pub const DEFAULT_LIMIT: u64 = 5;
    pub const DEFAULT_DEFER_INTERVAL_MS: u64 = 3_600_000;
    pub const DEFAULT_EXPIRE_TIME_MS: u64 = 86_400_000;
    pub const DEFAULT_MAX_KEYS: u64 = 0;
    pub const DEFAULT_PROCESSING_INTERVAL_MS: u64 = 10_000;
    pub const MIN_PROCESSING_INTERVAL_MS: u64 = 10;
    pub const DEFAULT_PURGE_INTERVAL_MS: u64 = 60_000;
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;
    pub const DEFAULT_REFILL_RATE: f64 = 1.0;
    pub const DEFAULT_WINDOW_SIZE_MS: u64 = 60_000;
}

#[bon]
impl TrackerConfig {
    #[builder(finish_fn(name = "build"))]
    fn new(
        strategy: Option<StrategyKind>,
        limit: Option<u64>,
        defer_interval_ms: Option<u64>,
        expire_time_ms: Option<u64>,
        max_keys: Option<u64>,
        processing_interval_ms: Option<u64>,
        purge_interval_ms: Option<u64>,
        max_retries: Option<u32>,
        retry_delay_ms: Option<u64>,
        bucket_size: Option<f64>,
        refill_rate: Option<f64>,
        window_size_ms: Option<u64>,
    ) -> ConfigResult<Self> {
        let strategy = strategy.unwrap_or(StrategyKind::Simple);
        let limit = limit.unwrap_or(Self::DEFAULT_LIMIT);
        let defer_interval_ms = defer_interval_ms.unwrap_or(Self::DEFAULT_DEFER_INTERVAL_MS);
        let expire_time_ms = expire_time_ms.unwrap_or(Self::DEFAULT_EXPIRE_TIME_MS);
        let max_keys = max_keys.unwrap_or(Self::DEFAULT_MAX_KEYS);
        let processing_interval_ms = processing_interval_ms
            .unwrap_or(Self::DEFAULT_PROCESSING_INTERVAL_MS)
            .max(Self::MIN_PROCESSING_INTERVAL_MS);
        let purge_interval_ms = purge_interval_ms.unwrap_or(Self::DEFAULT_PURGE_INTERVAL_MS);
        let max_retries = max_retries.unwrap_or(Self::DEFAULT_MAX_RETRIES);
        let retry_delay_ms = retry_delay_ms.unwrap_or(Self::DEFAULT_RETRY_DELAY_MS);
        let bucket_size = bucket_size.unwrap_or(limit as f64);
        let refill_rate = refill_rate.unwrap_or(Self::DEFAULT_REFILL_RATE);
        let window_size_ms = window_size_ms.unwrap_or(Self::DEFAULT_WINDOW_SIZE_MS);

        let config = TrackerConfig {
            strategy,
            limit,
            defer_interval_ms,
            expire_time_ms,
            max_keys,
            processing_interval_ms,
            purge_interval_ms,
            max_retries,
            retry_delay_ms,
            bucket_size,
            refill_rate,
            window_size_ms,
        };
        config.validate()?;
        Ok(config)
    }
}

impl TrackerConfig {
    /// The invariants the constructor enforces, split out so `new` reads as
    /// build-then-check rather than one long function.
    fn validate(&self) -> ConfigResult<()> {
        if self.expire_time_ms == 0 {
            return OutOfRangeSnafu {
                field: "expire_time_ms",
                value: self.expire_time_ms,
                min: 1u64,
            }
            .fail();
        }
        if !self.bucket_size.is_finite() || self.bucket_size <= 0.0 {
            return NotFiniteSnafu {
                field: "bucket_size",
                value: self.bucket_size,
            }
            .fail();
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return NotFiniteSnafu {
                field: "refill_rate",
                value: self.refill_rate,
            }
            .fail();
        }
        if self.window_size_ms == 0 {
            return OutOfRangeSnafu {
                field: "window_size_ms",
                value: self.window_size_ms,
                min: 1u64,
            }
            .fail();
        }
        Ok(())
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig::builder()
            .build()
            .expect("defaults are always valid")
    }
}

/// Per-identity snapshot of the tuning parameters in effect when the record
/// was created (or last targeted by `updateConfig`).
///
/// Fields are `Option` so that a partial `updateConfig` call can overlay
/// just the fields it names onto an existing snapshot, leaving the rest
/// untouched; [`RecordConfig::resolve`] fills any remaining gaps from the
/// tracker-wide defaults at decision time.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RecordConfig {
    pub limit: Option<u64>,
    pub defer_interval_ms: Option<u64>,
    pub expire_time_ms: Option<u64>,
    pub bucket_size: Option<f64>,
    pub refill_rate: Option<f64>,
    pub window_size_ms: Option<u64>,
}

impl RecordConfig {
    /// Capture a full snapshot from the tracker's current defaults.
    pub fn snapshot(tracker: &TrackerConfig) -> Self {
        RecordConfig {
            limit: Some(tracker.limit),
            defer_interval_ms: Some(tracker.defer_interval_ms),
            expire_time_ms: Some(tracker.expire_time_ms),
            bucket_size: Some(tracker.bucket_size),
            refill_rate: Some(tracker.refill_rate),
            window_size_ms: Some(tracker.window_size_ms),
        }
    }

    /// Overlay `patch`'s explicitly-set fields onto `self`, in place.
    pub fn merge(&mut self, patch: &RecordConfig) {
        if let Some(v) = patch.limit {
            self.limit = Some(v);
        }
        if let Some(v) = patch.defer_interval_ms {
            self.defer_interval_ms = Some(v);
        }
        if let Some(v) = patch.expire_time_ms {
            self.expire_time_ms = Some(v);
        }
        if let Some(v) = patch.bucket_size {
            self.bucket_size = Some(v);
        }
        if let Some(v) = patch.refill_rate {
            self.refill_rate = Some(v);
        }
        if let Some(v) = patch.window_size_ms {
            self.window_size_ms = Some(v);
        }
    }

    pub fn limit(&self, tracker: &TrackerConfig) -> u64 {
        self.limit.unwrap_or(tracker.limit)
    }

    pub fn defer_interval_ms(&self, tracker: &TrackerConfig) -> u64 {
        self.defer_interval_ms.unwrap_or(tracker.defer_interval_ms)
    }

    pub fn expire_time_ms(&self, tracker: &TrackerConfig) -> u64 {
        self.expire_time_ms.unwrap_or(tracker.expire_time_ms)
    }

    pub fn bucket_size(&self, tracker: &TrackerConfig) -> f64 {
        self.bucket_size.unwrap_or(tracker.bucket_size)
    }

    pub fn refill_rate(&self, tracker: &TrackerConfig) -> f64 {
        self.refill_rate.unwrap_or(tracker.refill_rate)
    }

    pub fn window_size_ms(&self, tracker: &TrackerConfig) -> u64 {
        self.window_size_ms.unwrap_or(tracker.window_size_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = TrackerConfig::default();
        assert_eq!(cfg.limit, 5);
        assert_eq!(cfg.defer_interval_ms, 3_600_000);
        assert_eq!(cfg.expire_time_ms, 86_400_000);
        assert_eq!(cfg.max_keys, 0);
        assert_eq!(cfg.processing_interval_ms, 10_000);
        assert_eq!(cfg.purge_interval_ms, 60_000);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_delay_ms, 1_000);
    }

    #[test]
    fn processing_interval_is_clamped() {
        let cfg = TrackerConfig::builder()
            .processing_interval_ms(1)
            .build()
            .unwrap();
        assert_eq!(cfg.processing_interval_ms, TrackerConfig::MIN_PROCESSING_INTERVAL_MS);
    }

    #[test]
    fn zero_expire_time_is_rejected() {
        let err = TrackerConfig::builder()
            .expire_time_ms(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
    }

    #[test]
    fn record_config_merge_overlays_only_named_fields() {
        let tracker = TrackerConfig::default();
        let mut snap = RecordConfig::snapshot(&tracker);
        snap.merge(&RecordConfig {
            limit: Some(42),
            ..Default::default()
        });
        assert_eq!(snap.limit(&tracker), 42);
        assert_eq!(snap.expire_time_ms(&tracker), tracker.expire_time_ms);
    }
}
