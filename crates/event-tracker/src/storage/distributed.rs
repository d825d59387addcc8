//! A Redis-backed [`StorageAdapter`] for deployments that share tracker
//! state across processes.
//!
//! `redis` + `deadpool-redis` are grounded on `aptos-api-gateway/Cargo.toml`
//! — the only crate anywhere in the retrieval pack that talks to Redis —
//! paired with the same `aio`/`tokio-comp`/`connection-manager` and
//! `rt_tokio_1` feature flags used there. No example in the pack embeds a
//! Lua script, so the scripts below follow the `redis` crate's own
//! documented `Script::new(..).key(..).arg(..)` idiom rather than imitating
//! a corpus example.
//!
//! Each identity's record is stored as a Redis hash (`HSET`/`HGETALL`)
//! rather than a single encoded blob, so a record can be inspected or
//! patched field-by-field from outside this crate (`redis-cli HGETALL`,
//! an ops dashboard) without deserializing the whole thing — see
//! `record_to_fields`/`decode_hash` for the field names. The live key count
//! is tracked in a dedicated `<prefix>:size` counter rather than derived
//! from `SCARD` of a key-name set, so `size()` is an `O(1)` `GET` instead of
//! a set cardinality scan.
//!
//! `track`'s `max_keys` gate and the decision it protects cannot both be
//! pushed into one Lua script, since the decision is an opaque call through
//! the `Strategy` trait object, not data the script can see. Instead a
//! brand-new key first reserves its slot against `max_keys` atomically
//! (`RESERVE_SLOT_SCRIPT`, closing the race two concurrent `track` calls for
//! two different new keys used to have when admission and the write were
//! separate round trips), then the record itself is written through the
//! same `WATCH`/`MULTI`/`EXEC` optimistic transaction `update` already uses
//! — per-key write races were never the bug here, only cross-key admission
//! was. If the transaction never lands (retries exhausted), the reservation
//! for that key is released so the counter does not leak.
//!
//! Arbitrary read-modify-write (`update`) still cannot be pushed into a
//! script at all, since the modification itself is an opaque Rust closure,
//! so it goes through the same `WATCH`/`MULTI`/`EXEC` transaction, retried
//! with `backon::ConstantBuilder` on lost-update.

use std::collections::HashMap;

use backon::{ConstantBuilder, Retryable};
use deadpool_redis::{Config, Pool, Runtime};
use event_tracker_core::{EventRecord, NewEvent, RecordConfig, Strategy, StrategyData, Timestamp, TrackerConfig};
use redis::AsyncCommands;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::error::{CorruptSnafu, LostUpdateSnafu, StorageError, StorageResult, UnavailableSnafu};
use crate::storage::{StorageAdapter, TrackOutcome, UpdateFn};
use async_trait::async_trait;

const LOG_TARGET: &str = "event_tracker::storage::distributed";

/// Atomically reserves a brand-new key's slot against `max_keys`. Returns
/// `1` if `key` already exists (no reservation needed) or a slot was free
/// and has now been claimed by incrementing the size counter; `0` if
/// `max_keys` was already reached.
const RESERVE_SLOT_SCRIPT: &str = r#"
local record_key = KEYS[1]
local size_counter = KEYS[2]
local max_keys = tonumber(ARGV[1])
if redis.call('EXISTS', record_key) == 1 then
  return 1
end
if max_keys > 0 then
  local current = tonumber(redis.call('GET', size_counter) or '0')
  if current >= max_keys then
    return 0
  end
end
redis.call('INCR', size_counter)
return 1
"#;

const POP_DUE_DEFERRED_SCRIPT: &str = r#"
local zset = KEYS[1]
local size_counter = KEYS[2]
local prefix = ARGV[1]
local now = ARGV[2]
local limit = tonumber(ARGV[3])
local due = redis.call('ZRANGEBYSCORE', zset, '-inf', now, 'LIMIT', 0, limit)
local out = {}
for _, key in ipairs(due) do
  local record_key = prefix .. ':record:' .. key
  local fields = redis.call('HGETALL', record_key)
  if #fields > 0 then
    redis.call('DEL', record_key)
    redis.call('DECR', size_counter)
    table.insert(out, key)
    table.insert(out, fields)
  end
end
if #due > 0 then
  redis.call('ZREM', zset, unpack(due))
end
return out
"#;

/// Deletes a record and its deferred-index entry, decrementing the size
/// counter only if the record actually existed.
const DELETE_RECORD_SCRIPT: &str = r#"
local record_key = KEYS[1]
local deferred_zset = KEYS[2]
local size_counter = KEYS[3]
local member = ARGV[1]
local existed = redis.call('DEL', record_key)
if existed == 1 then
  redis.call('DECR', size_counter)
end
redis.call('ZREM', deferred_zset, member)
return existed
"#;

fn redis_err(err: redis::RedisError) -> StorageError {
    UnavailableSnafu { message: err.to_string() }.build()
}

/// The hash field names a record is stored under. Shared between encode and
/// decode so a renamed field only needs changing in one place.
fn record_to_fields(record: &EventRecord) -> StorageResult<Vec<(&'static str, String)>> {
    let details = serde_json::to_string(&record.details).map_err(|err| {
        CorruptSnafu {
            key: record.key.clone(),
            message: err.to_string(),
        }
        .build()
    })?;
    let strategy_data = serde_json::to_string(&record.strategy_data).map_err(|err| {
        CorruptSnafu {
            key: record.key.clone(),
            message: err.to_string(),
        }
        .build()
    })?;
    let config = serde_json::to_string(&record.config).map_err(|err| {
        CorruptSnafu {
            key: record.key.clone(),
            message: err.to_string(),
        }
        .build()
    })?;

    let mut fields = vec![
        ("key", record.key.clone()),
        ("category", record.category.clone()),
        ("id", record.id.clone()),
        ("details", details),
        ("detailsHash", record.details_hash.clone()),
        ("count", record.count.to_string()),
        ("lastEventTime", record.last_event_time.as_millis().to_string()),
        ("expiresAt", record.expires_at.as_millis().to_string()),
        ("deferred", record.deferred.to_string()),
        ("strategyData", strategy_data),
        ("config", config),
    ];
    if let Some(due) = record.scheduled_send_at {
        fields.push(("scheduledSendAt", due.as_millis().to_string()));
    }
    Ok(fields)
}

fn decode_hash(key: &str, fields: HashMap<String, String>) -> StorageResult<Option<EventRecord>> {
    if fields.is_empty() {
        return Ok(None);
    }

    let corrupt = |message: String| -> StorageError {
        CorruptSnafu {
            key: key.to_owned(),
            message,
        }
        .build()
    };
    let field = |name: &str| -> StorageResult<String> {
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| corrupt(format!("missing field `{name}`")))
    };
    let parse_u64 = |name: &str| -> StorageResult<u64> {
        field(name)?
            .parse()
            .map_err(|_| corrupt(format!("`{name}` was not a valid integer")))
    };

    let details: Value = serde_json::from_str(&field("details")?).map_err(|err| corrupt(err.to_string()))?;
    let strategy_data: StrategyData =
        serde_json::from_str(&field("strategyData")?).map_err(|err| corrupt(err.to_string()))?;
    let config: RecordConfig = serde_json::from_str(&field("config")?).map_err(|err| corrupt(err.to_string()))?;
    let deferred = field("deferred")? == "true";
    let scheduled_send_at = fields
        .get("scheduledSendAt")
        .map(|raw| raw.parse::<u64>().map_err(|_| corrupt("`scheduledSendAt` was not a valid integer".into())))
        .transpose()?
        .map(Timestamp::from_millis);

    Ok(Some(EventRecord {
        key: field("key")?,
        category: field("category")?,
        id: field("id")?,
        details,
        details_hash: field("detailsHash")?,
        count: parse_u64("count")?,
        last_event_time: Timestamp::from_millis(parse_u64("lastEventTime")?),
        expires_at: Timestamp::from_millis(parse_u64("expiresAt")?),
        deferred,
        scheduled_send_at,
        config,
        strategy_data,
    }))
}

/// Turns a flat `[field, value, field, value, ...]` Redis reply into a map.
fn flat_bulk_to_map(values: &[redis::Value]) -> HashMap<String, String> {
    values
        .chunks_exact(2)
        .filter_map(|pair| match (&pair[0], &pair[1]) {
            (redis::Value::BulkString(k), redis::Value::BulkString(v)) => {
                Some((String::from_utf8_lossy(k).into_owned(), String::from_utf8_lossy(v).into_owned()))
            }
            _ => None,
        })
        .collect()
}

fn queue_write(pipe: &mut redis::Pipeline, adapter: &DistributedAdapter, key: &str, record: &EventRecord) -> StorageResult<()> {
    let record_key = adapter.record_key(key);
    let fields = record_to_fields(record)?;
    let ttl_ms = record.expires_at.since(Timestamp::now()).max(1);

    // Cleared and rewritten whole, so a field dropped since the last write
    // (a cleared `scheduledSendAt`, say) doesn't linger as a stale value.
    pipe.cmd("DEL").arg(&record_key).ignore();
    pipe.cmd("HSET").arg(&record_key).arg(fields).ignore();
    pipe.cmd("PEXPIRE").arg(&record_key).arg(ttl_ms).ignore();
    if record.deferred {
        if let Some(due) = record.scheduled_send_at {
            pipe.cmd("ZADD").arg(adapter.deferred_zset_key()).arg(due.as_millis()).arg(key).ignore();
        }
    } else {
        pipe.cmd("ZREM").arg(adapter.deferred_zset_key()).arg(key).ignore();
    }
    Ok(())
}

/// Redis-backed storage, scoped under a `key_prefix` so multiple trackers
/// can share one Redis instance without colliding.
pub struct DistributedAdapter {
    pool: Pool,
    key_prefix: String,
    reserve_slot_script: redis::Script,
    pop_due_deferred_script: redis::Script,
    delete_record_script: redis::Script,
}

impl DistributedAdapter {
    pub fn new(redis_url: &str, key_prefix: impl Into<String>) -> StorageResult<Self> {
        let config = Config::from_url(redis_url);
        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| UnavailableSnafu { message: err.to_string() }.build())?;
        Ok(DistributedAdapter {
            pool,
            key_prefix: key_prefix.into(),
            reserve_slot_script: redis::Script::new(RESERVE_SLOT_SCRIPT),
            pop_due_deferred_script: redis::Script::new(POP_DUE_DEFERRED_SCRIPT),
            delete_record_script: redis::Script::new(DELETE_RECORD_SCRIPT),
        })
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}:record:{key}", self.key_prefix)
    }

    fn deferred_zset_key(&self) -> String {
        format!("{}:deferred", self.key_prefix)
    }

    fn size_counter_key(&self) -> String {
        format!("{}:size", self.key_prefix)
    }

    async fn connection(&self) -> StorageResult<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|err| UnavailableSnafu { message: err.to_string() }.build())
    }

    async fn fetch_many(&self, keys: &[String]) -> StorageResult<Vec<EventRecord>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection().await?;
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("HGETALL").arg(self.record_key(key));
        }
        let replies: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await.map_err(redis_err)?;
        let mut out = Vec::with_capacity(keys.len());
        for (key, fields) in keys.iter().zip(replies) {
            if let Some(record) = decode_hash(key, fields)? {
                out.push(record);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl StorageAdapter for DistributedAdapter {
    #[instrument(target = LOG_TARGET, skip(self))]
    async fn get(&self, key: &str) -> StorageResult<Option<EventRecord>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.record_key(key)).await.map_err(redis_err)?;
        decode_hash(key, fields)
    }

    async fn set(&self, key: &str, record: EventRecord) -> StorageResult<()> {
        let mut conn = self.connection().await?;
        let existed: bool = conn.exists(self.record_key(key)).await.map_err(redis_err)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        queue_write(&mut pipe, self, key, &record)?;
        if !existed {
            pipe.cmd("INCR").arg(self.size_counter_key()).ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(redis_err)
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let mut conn = self.connection().await?;
        let existed: i64 = self
            .delete_record_script
            .key(self.record_key(key))
            .key(self.deferred_zset_key())
            .key(self.size_counter_key())
            .arg(key)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;
        Ok(existed == 1)
    }

    async fn size(&self) -> StorageResult<u64> {
        let mut conn = self.connection().await?;
        let size: Option<u64> = conn.get(self.size_counter_key()).await.map_err(redis_err)?;
        Ok(size.unwrap_or(0))
    }

    #[instrument(target = LOG_TARGET, skip(self, event, strategy))]
    async fn track(
        &self,
        key: &str,
        event: &NewEvent<'_>,
        now: Timestamp,
        tracker_config: &TrackerConfig,
        strategy: &dyn Strategy,
    ) -> StorageResult<TrackOutcome> {
        let record_key = self.record_key(key);

        let mut conn = self.connection().await?;
        let existed_before: bool = conn.exists(&record_key).await.map_err(redis_err)?;
        if !existed_before {
            let reserved: i64 = self
                .reserve_slot_script
                .key(&record_key)
                .key(self.size_counter_key())
                .arg(tracker_config.max_keys)
                .invoke_async(&mut conn)
                .await
                .map_err(redis_err)?;
            if reserved == 0 {
                return Ok(TrackOutcome::KeyLimitReached);
            }
        }

        let attempt = || async {
            let mut conn = self.connection().await?;

            redis::cmd("WATCH")
                .arg(&record_key)
                .query_async::<()>(&mut conn)
                .await
                .map_err(redis_err)?;

            let fields: HashMap<String, String> = conn.hgetall(&record_key).await.map_err(redis_err)?;
            let prior = decode_hash(key, fields)?;
            let fresh_prior = prior.filter(|record| !record.is_expired(now) && !record.details_changed(event.details_hash));
            let decision = strategy.decide(fresh_prior.as_ref(), event, now, tracker_config);

            let mut pipe = redis::pipe();
            pipe.atomic();
            queue_write(&mut pipe, self, key, &decision.record)?;

            let committed: Option<Vec<redis::Value>> = pipe.query_async(&mut conn).await.map_err(redis_err)?;
            if committed.is_none() {
                warn!(target: LOG_TARGET, %key, "lost update during track, another writer changed this key concurrently");
                return Err(LostUpdateSnafu { key, attempts: 1u32 }.build());
            }
            Ok(decision)
        };

        let result = attempt
            .retry(ConstantBuilder::default().with_max_times(3))
            .when(|err: &StorageError| matches!(err, StorageError::LostUpdate { .. }))
            .await;

        match result {
            Ok(decision) => Ok(TrackOutcome::Decided(decision)),
            Err(err) => {
                if !existed_before {
                    // The slot was reserved above but never got a record
                    // written; release it so the counter does not leak.
                    let mut conn = self.connection().await?;
                    let _: Result<i64, _> = conn.decr(self.size_counter_key(), 1).await;
                }
                Err(err)
            }
        }
    }

    #[instrument(target = LOG_TARGET, skip(self, update))]
    async fn update(&self, key: &str, update: &UpdateFn<'_>) -> StorageResult<Option<EventRecord>> {
        let attempt = || async {
            let mut conn = self.connection().await?;
            let record_key = self.record_key(key);

            redis::cmd("WATCH")
                .arg(&record_key)
                .query_async::<()>(&mut conn)
                .await
                .map_err(redis_err)?;

            let fields: HashMap<String, String> = conn.hgetall(&record_key).await.map_err(redis_err)?;
            let prior = decode_hash(key, fields)?;
            let was_new = prior.is_none();
            let next = update(prior);

            let mut pipe = redis::pipe();
            pipe.atomic();
            match &next {
                Some(record) => {
                    queue_write(&mut pipe, self, key, record)?;
                    if was_new {
                        pipe.cmd("INCR").arg(self.size_counter_key()).ignore();
                    }
                }
                None => {
                    pipe.cmd("DEL").arg(&record_key).ignore();
                    pipe.cmd("ZREM").arg(self.deferred_zset_key()).arg(key).ignore();
                    if !was_new {
                        pipe.cmd("DECR").arg(self.size_counter_key()).ignore();
                    }
                }
            }

            let committed: Option<Vec<redis::Value>> = pipe.query_async(&mut conn).await.map_err(redis_err)?;

            if committed.is_none() {
                warn!(target: LOG_TARGET, %key, "lost update, another writer changed this key concurrently");
                return Err(LostUpdateSnafu { key, attempts: 1u32 }.build());
            }
            Ok(next)
        };

        attempt
            .retry(ConstantBuilder::default().with_max_times(3))
            .when(|err: &StorageError| matches!(err, StorageError::LostUpdate { .. }))
            .await
    }

    async fn find_all_deferred(&self) -> StorageResult<Vec<EventRecord>> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = conn.zrange(self.deferred_zset_key(), 0, -1).await.map_err(redis_err)?;
        self.fetch_many(&keys).await
    }

    async fn find_due_deferred(&self, now: Timestamp) -> StorageResult<Vec<EventRecord>> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = conn
            .zrangebyscore(self.deferred_zset_key(), "-inf", now.as_millis())
            .await
            .map_err(redis_err)?;
        self.fetch_many(&keys).await
    }

    async fn pop_due_deferred(&self, now: Timestamp, limit: usize) -> StorageResult<Vec<EventRecord>> {
        let mut conn = self.connection().await?;
        let raw: redis::Value = self
            .pop_due_deferred_script
            .key(self.deferred_zset_key())
            .key(self.size_counter_key())
            .arg(&self.key_prefix)
            .arg(now.as_millis())
            .arg(limit as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_err)?;

        let redis::Value::Array(items) = raw else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(items.len() / 2);
        for pair in items.chunks_exact(2) {
            let redis::Value::BulkString(key_bytes) = &pair[0] else {
                continue;
            };
            let key = String::from_utf8_lossy(key_bytes).into_owned();
            let redis::Value::Array(field_values) = &pair[1] else {
                continue;
            };
            let fields = flat_bulk_to_map(field_values);
            if let Some(record) = decode_hash(&key, fields)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn purge_expired(&self, _now: Timestamp) -> StorageResult<u64> {
        // Records carry a `PEXPIRE` matching `expires_at`; Redis reclaims
        // them on its own, so there is nothing to scan for here. The size
        // counter is not decremented when that happens — the same
        // limitation the old `SCARD`-based count had, since neither is
        // wired to Redis keyspace notifications.
        Ok(0)
    }

    async fn destroy(&self) -> StorageResult<()> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}:*", self.key_prefix);
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(redis_err)?;
            if !batch.is_empty() {
                let _: () = conn.del(batch).await.map_err(redis_err)?;
            }
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        Ok(())
    }
}
