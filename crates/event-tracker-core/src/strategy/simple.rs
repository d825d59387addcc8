//! The simple counter strategy: a fixed-size allowance per identity before
//! every further event is deferred. See the module-level docs on
//! [`crate::Strategy`] for the shared freshness/key-limit contract.

use crate::config::{RecordConfig, TrackerConfig};
use crate::record::{EventRecord, StrategyData};
use crate::strategy::{Decision, IgnoredReason, NewEvent, Outcome, Strategy, StrategyKind};
use crate::timestamp::Timestamp;

#[derive(Debug, Default)]
pub struct SimpleCounterStrategy;

impl Strategy for SimpleCounterStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Simple
    }

    fn decide(
        &self,
        prior: Option<&EventRecord>,
        event: &NewEvent<'_>,
        now: Timestamp,
        tracker_config: &TrackerConfig,
    ) -> Decision {
        let Some(prior) = prior else {
            let config = RecordConfig::snapshot(tracker_config);
            let expire_time_ms = config.expire_time_ms(tracker_config);
            let limit = config.limit(tracker_config);
            let defer_interval_ms = config.defer_interval_ms(tracker_config);

            let deferred = 1 > limit;
            let (outcome, scheduled_send_at) = if deferred {
                (Outcome::Deferred, Some(now.plus_ms(defer_interval_ms)))
            } else {
                (Outcome::Immediate, None)
            };

            return Decision {
                outcome,
                record: EventRecord {
                    key: event.key.to_owned(),
                    category: event.category.to_owned(),
                    id: event.id.to_owned(),
                    details: event.details.clone(),
                    details_hash: event.details_hash.to_owned(),
                    count: 1,
                    last_event_time: now,
                    expires_at: now.plus_ms(expire_time_ms),
                    deferred,
                    scheduled_send_at,
                    config,
                    strategy_data: StrategyData::Simple,
                },
            };
        };

        let expire_time_ms = prior.config.expire_time_ms(tracker_config);

        if prior.deferred {
            let mut record = prior.clone();
            record.expires_at = now.plus_ms(expire_time_ms);
            return Decision {
                outcome: Outcome::Ignored(IgnoredReason::AlreadyDeferred),
                record,
            };
        }

        let limit = prior.config.limit(tracker_config);
        let defer_interval_ms = prior.config.defer_interval_ms(tracker_config);

        let mut record = prior.clone();
        record.count += 1;
        record.last_event_time = now;
        record.expires_at = now.plus_ms(expire_time_ms);

        let outcome = if record.count > limit {
            record.deferred = true;
            record.scheduled_send_at = Some(now.plus_ms(defer_interval_ms));
            Outcome::Deferred
        } else {
            Outcome::Immediate
        };

        Decision { outcome, record }
    }
}
