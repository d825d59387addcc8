//! The tracker engine: binds a [`StorageAdapter`] to a
//! [`event_tracker_core::Strategy`] and drives `track`, deferred-event
//! processing, and configuration updates.
//!
//! Grounded on `rostra-client::Client`'s `#[bon::bon] impl Client {
//! #[builder(finish_fn(name = "build"))] async fn new(...) }` construction
//! pattern, its `tokio::spawn(Task::new(self).run())` background-task
//! convention (here: a processing loop and a purge loop, each a
//! single-shot recursive timer rather than a fixed `tokio::time::interval`,
//! so a slow cycle can't overlap itself), and its `backon::Retryable`-based
//! retry call for exponential backoff around a fallible operation.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use bon::bon;
use event_tracker_core::{
    composite_key, details_hash, validate_identity, Decision, EventRecord, IgnoredReason, NewEvent,
    Outcome, RecordConfig, Strategy, Timestamp, TrackerConfig,
};
use event_tracker_util_error::{BoxedError, FmtCompact};
use event_tracker_util_fmt::{format_duration_relative_ms, AsFmtOption};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::error::{TrackError, TrackResult};
use crate::notification::Notification;
use crate::storage::{StorageAdapter, TrackOutcome};

pub const LOG_TARGET: &str = "event_tracker::tracker";

const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;

pub type ProcessorFuture = Pin<Box<dyn Future<Output = Result<(), BoxedError>> + Send>>;
/// Invoked once per due batch, never once per record; a batch either
/// succeeds or fails (and is retried) as a whole.
pub type Processor = Arc<dyn Fn(Vec<EventRecord>) -> ProcessorFuture + Send + Sync>;

struct Inner {
    storage: Arc<dyn StorageAdapter>,
    // Frozen at construction time; `Tracker` has no operation that mutates
    // the tracker-wide defaults afterwards, only per-identity overlays.
    config: TrackerConfig,
    strategy: Box<dyn Strategy>,
    processor: RwLock<Option<Processor>>,
    notifier: broadcast::Sender<Notification>,
    destroyed: AtomicBool,
}

/// The event aggregation and throttling engine.
///
/// Cloning a `Tracker` is cheap and shares the same background loops and
/// storage; `Tracker` is the handle applications keep.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Inner>,
    processing_loop: Arc<JoinHandle<()>>,
    purge_loop: Arc<JoinHandle<()>>,
}

#[bon]
impl Tracker {
    #[builder(finish_fn(name = "build"))]
    pub async fn new(storage: Arc<dyn StorageAdapter>, #[builder(default)] config: TrackerConfig) -> Self {
        let strategy = event_tracker_core::for_kind(config.strategy);
        let (notifier, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);

        let inner = Arc::new(Inner {
            storage,
            config,
            strategy,
            processor: RwLock::new(None),
            notifier,
            destroyed: AtomicBool::new(false),
        });

        let processing_loop = tokio::spawn(run_processing_loop(inner.clone()));
        let purge_loop = tokio::spawn(run_purge_loop(inner.clone()));

        Tracker {
            inner,
            processing_loop: Arc::new(processing_loop),
            purge_loop: Arc::new(purge_loop),
        }
    }
}

impl Tracker {
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifier.subscribe()
    }

    pub fn set_processor(&self, processor: Processor) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            *inner.processor.write().await = Some(processor);
        });
    }

    #[instrument(target = LOG_TARGET, skip(self, details), fields(category, id))]
    pub async fn track_event(
        &self,
        category: &str,
        id: &str,
        details: Option<Value>,
    ) -> TrackResult<Outcome> {
        validate_identity(category, id)?;
        let key = composite_key(category, id);
        let details = details.unwrap_or(Value::Null);
        let event_details_hash = details_hash(Some(&details));

        let tracker_config = &self.inner.config;
        let now = Timestamp::now();
        let new_event = NewEvent {
            key: &key,
            category,
            id,
            details: &details,
            details_hash: &event_details_hash,
        };

        let track_outcome = self
            .inner
            .storage
            .track(&key, &new_event, now, tracker_config, self.inner.strategy.as_ref())
            .await
            .map_err(TrackError::from)?;

        let (outcome, notification) = match track_outcome {
            TrackOutcome::Decided(Decision { outcome, record }) => {
                (outcome, Notification::from_outcome(category, id, &details, outcome, Some(record)))
            }
            TrackOutcome::KeyLimitReached => {
                let outcome = Outcome::Ignored(IgnoredReason::KeyLimitReached);
                (outcome, Notification::from_outcome(category, id, &details, outcome, None))
            }
        };

        self.notify(notification);
        Ok(outcome)
    }

    /// Remove a single identity's record, as if it had never tracked an
    /// event.
    pub async fn reset_event(&self, category: &str, id: &str) -> TrackResult<bool> {
        validate_identity(category, id)?;
        let key = composite_key(category, id);
        Ok(self.inner.storage.delete(&key).await.map_err(TrackError::from)?)
    }

    pub async fn deferred_events(&self) -> TrackResult<Vec<EventRecord>> {
        Ok(self
            .inner
            .storage
            .find_all_deferred()
            .await
            .map_err(TrackError::from)?)
    }

    /// Overlay `patch`'s explicitly-set fields onto the config snapshot
    /// carried by one identity's record. The tracker-wide defaults
    /// themselves are frozen after construction; this only ever touches the
    /// named identity. Returns `false` if the identity has no record.
    pub async fn update_config(&self, category: &str, id: &str, patch: &RecordConfig) -> TrackResult<bool> {
        validate_identity(category, id)?;
        let key = composite_key(category, id);
        let patch = patch.clone();
        let updated = self
            .inner
            .storage
            .update(
                &key,
                &move |prior| {
                    prior.map(|mut record| {
                        record.config.merge(&patch);
                        record
                    })
                },
            )
            .await
            .map_err(TrackError::from)?;

        match updated {
            Some(record) => {
                self.notify(Notification::ConfigUpdated { record });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run one processing cycle immediately rather than waiting for the
    /// background loop's next tick.
    ///
    /// With no processor configured, this is a non-destructive peek: it
    /// returns the currently-due records without removing them. Once a
    /// processor is set, it claims the due batch, hands it to the processor
    /// exactly once (retrying the whole batch on failure), and returns the
    /// batch it attempted.
    pub async fn process_deferred_events(&self) -> TrackResult<Vec<EventRecord>> {
        if self.inner.processor.read().await.is_none() {
            return Ok(self
                .inner
                .storage
                .find_due_deferred(Timestamp::now())
                .await
                .map_err(TrackError::from)?);
        }
        Ok(run_processing_cycle(&self.inner).await)
    }

    /// Stop the background loops and release the storage adapter's own
    /// resources. Idempotent; a `Tracker` can still serve `get`-shaped
    /// reads from a caller's own handle on the storage adapter afterwards,
    /// but must not be tracked through again.
    pub async fn shutdown(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.processing_loop.abort();
        self.purge_loop.abort();
        if let Err(err) = self.inner.storage.destroy().await {
            error!(target: LOG_TARGET, err = %err, "error tearing down storage adapter");
        }
    }

    fn notify(&self, notification: Notification) {
        // No receivers is the common case (nobody subscribed) and not an error.
        let _ = self.inner.notifier.send(notification);
    }
}

async fn run_processing_loop(inner: Arc<Inner>) {
    loop {
        let interval_ms = inner.config.processing_interval_ms;
        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        if inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        run_processing_cycle(&inner).await;
    }
}

async fn run_purge_loop(inner: Arc<Inner>) {
    loop {
        let interval_ms = inner.config.purge_interval_ms;
        if interval_ms == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        if inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        match inner.storage.purge_expired(Timestamp::now()).await {
            Ok(removed) if removed > 0 => {
                debug!(target: LOG_TARGET, removed, "purged expired records");
            }
            Ok(_) => {}
            Err(err) => {
                error!(target: LOG_TARGET, err = %err.fmt_compact(), "purge cycle failed");
                let _ = inner.notifier.send(Notification::Error {
                    message: err.to_string(),
                });
            }
        }
    }
}

/// Claims the due batch and, if a processor is configured, delivers it.
/// Returns the batch that was claimed (empty if nothing was due or no
/// processor is set), whether delivery ultimately succeeded or not — the
/// batch is removed from storage the moment [`StorageAdapter::pop_due_deferred`]
/// returns it, regardless of what the processor does with it afterwards.
#[instrument(target = LOG_TARGET, skip(inner))]
async fn run_processing_cycle(inner: &Arc<Inner>) -> Vec<EventRecord> {
    let Some(processor) = inner.processor.read().await.clone() else {
        return Vec::new();
    };

    let now = Timestamp::now();
    let due = match inner.storage.pop_due_deferred(now, usize::MAX).await {
        Ok(due) => due,
        Err(err) => {
            error!(target: LOG_TARGET, err = %err.fmt_compact(), "failed to claim due deferred records");
            let _ = inner.notifier.send(Notification::Error {
                message: err.to_string(),
            });
            return Vec::new();
        }
    };

    if due.is_empty() {
        return due;
    }

    if let Some(oldest_due) = due.iter().filter_map(|r| r.scheduled_send_at).min() {
        let age_ms = now.since(oldest_due);
        let age = format_duration_relative_ms(age_ms);
        debug!(target: LOG_TARGET, count = due.len(), age = %(&age).fmt_option(), "claimed deferred batch");
    }

    let (max_retries, retry_delay_ms) = (inner.config.max_retries, inner.config.retry_delay_ms);
    deliver_batch(inner, &processor, due, max_retries, retry_delay_ms).await
}

/// Hands `batch` to the processor exactly once per attempt; on failure the
/// whole batch is retried together, never split apart.
async fn deliver_batch(
    inner: &Arc<Inner>,
    processor: &Processor,
    batch: Vec<EventRecord>,
    max_retries: u32,
    retry_delay_ms: u64,
) -> Vec<EventRecord> {
    let attempt_counter = std::sync::atomic::AtomicU32::new(0);

    let result = (|| {
        let processor = processor.clone();
        let batch = batch.clone();
        let attempt = attempt_counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            let first_due = batch.first().and_then(|r| r.scheduled_send_at);
            debug!(
                target: LOG_TARGET,
                count = batch.len(),
                attempt,
                first_due = %(&first_due).fmt_option(),
                "delivering deferred batch"
            );
            processor(batch).await
        }
    })
    .retry(
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(retry_delay_ms.max(1)))
            .with_max_times(max_retries as usize),
    )
    .notify(|err: &BoxedError, delay| {
        let attempt = attempt_counter.load(Ordering::SeqCst);
        warn!(target: LOG_TARGET, attempt, err = %err, delay = ?delay, "retrying deferred batch delivery");
        let _ = inner.notifier.send(Notification::Retry {
            attempt,
            max_retries,
            delay_ms: delay.as_millis() as u64,
            events: batch.clone(),
        });
    })
    .await;

    match result {
        Ok(()) => {
            for record in &batch {
                let _ = inner.notifier.send(Notification::Processed {
                    record: record.clone(),
                });
            }
        }
        Err(err) => {
            let attempts = attempt_counter.load(Ordering::SeqCst);
            error!(
                target: LOG_TARGET,
                count = batch.len(),
                attempts,
                err = %err.fmt_compact(),
                "deferred batch exhausted retries"
            );
            let _ = inner.notifier.send(Notification::ProcessFailed {
                error: err.to_string(),
                events: batch.clone(),
                attempts,
            });
            let _ = inner.notifier.send(Notification::Error {
                message: err.to_string(),
            });
        }
    }

    batch
}
