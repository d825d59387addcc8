//! The token bucket strategy: a continuously refilling allowance. Unlike
//! [`crate::strategy::simple::SimpleCounterStrategy`] and
//! [`crate::strategy::sliding_window::SlidingWindowStrategy`], this strategy
//! re-evaluates on every event even if the record is already deferred — a
//! bucket can refill enough between two deferred events to admit the second
//! one immediately, so the generic "already deferred -> ignored" shortcut
//! does not apply here.

use crate::config::{RecordConfig, TrackerConfig};
use crate::record::{EventRecord, StrategyData};
use crate::strategy::{Decision, NewEvent, Outcome, Strategy, StrategyKind};
use crate::timestamp::Timestamp;

#[derive(Debug, Default)]
pub struct TokenBucketStrategy;

impl Strategy for TokenBucketStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::TokenBucket
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
            let bucket_size = config.bucket_size(tracker_config);
            let expire_time_ms = config.expire_time_ms(tracker_config);
            return Decision {
                outcome: Outcome::Immediate,
                record: EventRecord {
                    key: event.key.to_owned(),
                    category: event.category.to_owned(),
                    id: event.id.to_owned(),
                    details: event.details.clone(),
                    details_hash: event.details_hash.to_owned(),
                    count: 1,
                    last_event_time: now,
                    expires_at: now.plus_ms(expire_time_ms),
                    deferred: false,
                    scheduled_send_at: None,
                    config,
                    strategy_data: StrategyData::TokenBucket {
                        tokens: bucket_size - 1.0,
                        last_refill: now,
                    },
                },
            };
        };

        let bucket_size = prior.config.bucket_size(tracker_config);
        let refill_rate = prior.config.refill_rate(tracker_config);
        let expire_time_ms = prior.config.expire_time_ms(tracker_config);

        let StrategyData::TokenBucket { tokens, last_refill } = prior.strategy_data else {
            unreachable!("record bound to TokenBucketStrategy must carry TokenBucket data");
        };

        let elapsed_ms = now.since(last_refill);
        let refilled = tokens + (elapsed_ms as f64 / 1000.0) * refill_rate;
        let tokens = refilled.min(bucket_size);

        let mut record = prior.clone();
        record.last_event_time = now;
        record.expires_at = now.plus_ms(expire_time_ms);

        let outcome = if tokens >= 1.0 {
            record.count += 1;
            record.deferred = false;
            record.scheduled_send_at = None;
            record.strategy_data = StrategyData::TokenBucket {
                tokens: tokens - 1.0,
                last_refill: now,
            };
            Outcome::Immediate
        } else {
            let ms_per_token = 1000.0 / refill_rate;
            let wait_ms = ((1.0 - tokens) * ms_per_token).ceil().max(1.0) as u64;
            record.deferred = true;
            record.scheduled_send_at = Some(now.plus_ms(wait_ms));
            record.strategy_data = StrategyData::TokenBucket { tokens, last_refill: now };
            Outcome::Deferred
        };

        Decision { outcome, record }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn event<'a>(null: &'a Value) -> NewEvent<'a> {
        NewEvent {
            key: "k",
            category: "login",
            id: "u1",
            details: null,
            details_hash: "",
        }
    }

    #[test]
    fn bucket_of_five_admits_five_then_defers_sixth() {
        let strategy = TokenBucketStrategy;
        let mut tracker = TrackerConfig::default();
        tracker.bucket_size = 5.0;
        tracker.refill_rate = 10.0;
        let null = Value::Null;
        let now = Timestamp::from_millis(0);

        let mut decision = strategy.decide(None, &event(&null), now, &tracker);
        assert_eq!(decision.outcome, Outcome::Immediate);
        for _ in 0..4 {
            decision = strategy.decide(Some(&decision.record), &event(&null), now, &tracker);
            assert_eq!(decision.outcome, Outcome::Immediate);
        }
        assert_eq!(decision.record.count, 5);

        let sixth = strategy.decide(Some(&decision.record), &event(&null), now, &tracker);
        assert_eq!(sixth.outcome, Outcome::Deferred);
        let scheduled = sixth.record.scheduled_send_at.expect("deferred event must schedule");
        assert_eq!(scheduled.since(now), 100);
    }

    #[test]
    fn refill_over_time_admits_a_deferred_identity() {
        let strategy = TokenBucketStrategy;
        let mut tracker = TrackerConfig::default();
        tracker.bucket_size = 1.0;
        tracker.refill_rate = 1.0;
        let null = Value::Null;

        let created = strategy.decide(None, &event(&null), Timestamp::from_millis(0), &tracker);
        let soon = strategy.decide(
            Some(&created.record),
            &event(&null),
            Timestamp::from_millis(10),
            &tracker,
        );
        assert_eq!(soon.outcome, Outcome::Deferred);

        let later = strategy.decide(
            Some(&soon.record),
            &event(&null),
            Timestamp::from_millis(2_000),
            &tracker,
        );
        assert_eq!(later.outcome, Outcome::Immediate);
    }
}
