//! The sliding weighted window strategy: a fixed-size window estimated as a
//! weighted blend of the current and previous window's counts, smoothing
//! out the boundary artifacts of a plain fixed window.

use crate::config::{RecordConfig, TrackerConfig};
use crate::record::{EventRecord, StrategyData};
use crate::strategy::{Decision, IgnoredReason, NewEvent, Outcome, Strategy, StrategyKind};
use crate::timestamp::Timestamp;

#[derive(Debug, Default)]
pub struct SlidingWindowStrategy;

impl Strategy for SlidingWindowStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SlidingWindow
    }

    fn decide(
        &self,
        prior: Option<&EventRecord>,
        event: &NewEvent<'_>,
        now: Timestamp,
        tracker_config: &TrackerConfig,
    ) -> Decision {
        let (limit, window_size_ms, defer_interval_ms, expire_time_ms, was_deferred, mut record, mut current_count, mut previous_count, mut window_start);

        match prior {
            None => {
                let config = RecordConfig::snapshot(tracker_config);
                limit = config.limit(tracker_config);
                window_size_ms = config.window_size_ms(tracker_config);
                defer_interval_ms = config.defer_interval_ms(tracker_config);
                expire_time_ms = config.expire_time_ms(tracker_config);
                was_deferred = false;
                current_count = 0;
                previous_count = 0;
                window_start = now;
                record = EventRecord {
                    key: event.key.to_owned(),
                    category: event.category.to_owned(),
                    id: event.id.to_owned(),
                    details: event.details.clone(),
                    details_hash: event.details_hash.to_owned(),
                    count: 0,
                    last_event_time: now,
                    expires_at: now,
                    deferred: false,
                    scheduled_send_at: None,
                    config,
                    strategy_data: StrategyData::SlidingWindow {
                        current_count: 0,
                        previous_count: 0,
                        window_start: now,
                    },
                };
            }
            Some(prior) => {
                limit = prior.config.limit(tracker_config);
                window_size_ms = prior.config.window_size_ms(tracker_config);
                defer_interval_ms = prior.config.defer_interval_ms(tracker_config);
                expire_time_ms = prior.config.expire_time_ms(tracker_config);
                was_deferred = prior.deferred;
                let StrategyData::SlidingWindow {
                    current_count: cc,
                    previous_count: pc,
                    window_start: ws,
                } = prior.strategy_data
                else {
                    unreachable!("record bound to SlidingWindowStrategy must carry SlidingWindow data");
                };
                current_count = cc;
                previous_count = pc;
                window_start = ws;
                record = prior.clone();
            }
        }

        // Unlike the simple counter and token bucket's "already deferred"
        // shortcuts, a sliding window keeps recomputing its estimate on
        // every event even once deferred: the window itself keeps moving,
        // so a later event in the same deferred streak can find the
        // weighted estimate has since dropped back under the limit.
        let elapsed_ms = now.since(window_start);
        if elapsed_ms >= window_size_ms {
            previous_count = if elapsed_ms >= 2 * window_size_ms {
                0
            } else {
                current_count
            };
            current_count = 0;
            window_start = now.minus_ms(elapsed_ms % window_size_ms);
        }

        let elapsed_in_window_ms = now.since(window_start);
        let weight = (window_size_ms - elapsed_in_window_ms) as f64 / window_size_ms as f64;
        let estimated = current_count as f64 + previous_count as f64 * weight;

        record.last_event_time = now;
        record.expires_at = now.plus_ms(expire_time_ms);
        record.count = (estimated + 1.0).floor() as u64;

        let outcome = if estimated < limit as f64 {
            current_count += 1;
            record.deferred = false;
            record.scheduled_send_at = None;
            Outcome::Immediate
        } else if was_deferred {
            record.deferred = true;
            Outcome::Ignored(IgnoredReason::AlreadyDeferred)
        } else {
            record.deferred = true;
            record.scheduled_send_at = Some(now.plus_ms(defer_interval_ms));
            Outcome::Deferred
        };

        record.strategy_data = StrategyData::SlidingWindow {
            current_count,
            previous_count,
            window_start,
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
    fn ten_immediate_then_eleventh_at_half_window_deferred() {
        let strategy = SlidingWindowStrategy;
        let mut tracker = TrackerConfig::default();
        tracker.limit = 10;
        tracker.window_size_ms = 1_000;
        let null = Value::Null;
        let t0 = Timestamp::from_millis(0);

        let mut decision = strategy.decide(None, &event(&null), t0, &tracker);
        for _ in 0..9 {
            decision = strategy.decide(Some(&decision.record), &event(&null), t0, &tracker);
            assert_eq!(decision.outcome, Outcome::Immediate);
        }
        assert_eq!(decision.record.count, 10);

        let eleventh = strategy.decide(
            Some(&decision.record),
            &event(&null),
            Timestamp::from_millis(500),
            &tracker,
        );
        assert_eq!(eleventh.outcome, Outcome::Deferred);

        let twelfth = strategy.decide(
            Some(&eleventh.record),
            &event(&null),
            Timestamp::from_millis(1_001),
            &tracker,
        );
        assert_eq!(
            twelfth.outcome,
            Outcome::Immediate,
            "the window has moved on: estimated = 0 + 10*0.999 = 9.99 < 10"
        );
        assert_eq!(twelfth.record.count, 10);
        assert!(!twelfth.record.deferred, "recovering clears the deferred flag");
    }

    #[test]
    fn limit_zero_defers_the_first_event() {
        let strategy = SlidingWindowStrategy;
        let mut tracker = TrackerConfig::default();
        tracker.limit = 0;
        tracker.window_size_ms = 1_000;
        let null = Value::Null;
        let now = Timestamp::from_millis(0);

        let d1 = strategy.decide(None, &event(&null), now, &tracker);
        assert_eq!(d1.outcome, Outcome::Deferred);
        assert_eq!(d1.record.count, 1);
        assert!(d1.record.deferred);
        assert!(d1.record.scheduled_send_at.is_some());
    }

    #[test]
    fn window_slide_resets_previous_count_after_two_full_windows() {
        let strategy = SlidingWindowStrategy;
        let mut tracker = TrackerConfig::default();
        tracker.limit = 100;
        tracker.window_size_ms = 1_000;
        let null = Value::Null;

        let created = strategy.decide(None, &event(&null), Timestamp::from_millis(0), &tracker);
        let slid = strategy.decide(
            Some(&created.record),
            &event(&null),
            Timestamp::from_millis(5_000),
            &tracker,
        );
        let StrategyData::SlidingWindow { previous_count, .. } = slid.record.strategy_data else {
            unreachable!();
        };
        assert_eq!(previous_count, 0, "a gap of >= 2 windows drops the previous bucket");
    }
}
