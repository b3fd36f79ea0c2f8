use crate::{DeadLetter, FailedEntry, RecordOutcome, RetryConfig, RetryQueue, RetryQueueError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::{AsyncCommands, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;

/// Increments the attempt counter and writes the retry entry (or promotes to
/// dead-letter) atomically, so a concurrent `due()` scan never sees a torn
/// update. `KEYS` are the entry blob, the scalar attempt counter, the scalar
/// next-retry timestamp, the due-set, the dead-letter blob, and the dead-letter
/// set, in that order — matching the key names enumerated in this system's Redis
/// key contract.
const RECORD_SCRIPT: &str = r#"
local existing = redis.call("GET", KEYS[1])
local first_failed_at
local attempt
if existing then
    local decoded = cjson.decode(existing)
    first_failed_at = decoded.first_failed_at
    attempt = decoded.attempt_count + 1
else
    first_failed_at = tonumber(ARGV[4])
    attempt = 1
end

if attempt > tonumber(ARGV[8]) then
    local dead = cjson.encode({
        order_id = ARGV[1],
        original_message = cjson.decode(ARGV[2]),
        last_error = ARGV[3],
        attempt_count = attempt,
        first_failed_at = first_failed_at,
    })
    redis.call("SET", KEYS[5], dead)
    redis.call("SADD", KEYS[6], ARGV[1])
    redis.call("DEL", KEYS[1])
    redis.call("DEL", KEYS[2])
    redis.call("DEL", KEYS[3])
    redis.call("ZREM", KEYS[4], ARGV[1])
    return cjson.encode({outcome = "dead_lettered", attempt_count = attempt})
end

local delay = tonumber(ARGV[5]) * (tonumber(ARGV[6]) ^ (attempt - 1))
if delay > tonumber(ARGV[7]) then
    delay = tonumber(ARGV[7])
end
local next_retry_at = tonumber(ARGV[4]) + delay

local entry = cjson.encode({
    order_id = ARGV[1],
    original_message = cjson.decode(ARGV[2]),
    last_error = ARGV[3],
    attempt_count = attempt,
    first_failed_at = first_failed_at,
    next_retry_at = next_retry_at,
})

redis.call("SET", KEYS[1], entry)
redis.call("SET", KEYS[2], attempt)
redis.call("SET", KEYS[3], next_retry_at)
redis.call("ZADD", KEYS[4], next_retry_at, ARGV[1])

return cjson.encode({outcome = "retried", attempt_count = attempt, next_retry_at = next_retry_at})
"#;

#[derive(serde::Deserialize)]
struct RecordScriptResult {
    outcome: String,
    attempt_count: u32,
    #[serde(default)]
    next_retry_at: Option<f64>,
}

pub struct RedisRetryQueue<M> {
    client: Client,
    config: RetryConfig,
    _marker: PhantomData<M>,
}

impl<M> RedisRetryQueue<M> {
    pub fn new(client: Client, config: RetryConfig) -> Self {
        Self {
            client,
            config,
            _marker: PhantomData,
        }
    }

    fn entry_key(order_id: &str) -> String {
        format!("failed_messages:{order_id}")
    }
    fn attempts_key(order_id: &str) -> String {
        format!("failed_attempts:{order_id}")
    }
    fn next_retry_key(order_id: &str) -> String {
        format!("failed_next_retry:{order_id}")
    }
    fn dead_letter_key(order_id: &str) -> String {
        format!("dead_letter:{order_id}")
    }
    const SET_KEY: &'static str = "failed_messages_set";
    const DEAD_LETTER_SET_KEY: &'static str = "dead_letter_queue";
}

fn millis_to_datetime(millis: f64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl<M> RetryQueue<M> for RedisRetryQueue<M>
where
    M: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn record(
        &self,
        order_id: &str,
        message: &M,
        error: &str,
    ) -> Result<RecordOutcome, RetryQueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RetryQueueError::Backend(e.to_string()))?;

        let message_json =
            serde_json::to_string(message).map_err(|e| RetryQueueError::Backend(e.to_string()))?;
        let now_ms = Utc::now().timestamp_millis();

        let raw: String = redis::Script::new(RECORD_SCRIPT)
            .key(Self::entry_key(order_id))
            .key(Self::attempts_key(order_id))
            .key(Self::next_retry_key(order_id))
            .key(Self::SET_KEY)
            .key(Self::dead_letter_key(order_id))
            .key(Self::DEAD_LETTER_SET_KEY)
            .arg(order_id)
            .arg(message_json)
            .arg(error)
            .arg(now_ms)
            .arg(self.config.initial_delay.as_millis() as i64)
            .arg(self.config.multiplier)
            .arg(self.config.max_delay.as_millis() as i64)
            .arg(self.config.max_attempts)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| RetryQueueError::Backend(e.to_string()))?;

        let result: RecordScriptResult = serde_json::from_str(&raw)
            .map_err(|e| RetryQueueError::Corrupt(order_id.to_string(), e.to_string()))?;

        match result.outcome.as_str() {
            "dead_lettered" => {
                tracing::warn!(order_id, attempt = result.attempt_count, "message dead-lettered");
                Ok(RecordOutcome::DeadLettered {
                    attempt_count: result.attempt_count,
                })
            }
            _ => {
                let next_retry_at = millis_to_datetime(result.next_retry_at.unwrap_or_default());
                tracing::info!(
                    order_id,
                    attempt = result.attempt_count,
                    ?next_retry_at,
                    "message recorded for retry"
                );
                Ok(RecordOutcome::Retried {
                    attempt_count: result.attempt_count,
                    next_retry_at,
                })
            }
        }
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<FailedEntry<M>>, RetryQueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RetryQueueError::Backend(e.to_string()))?;

        let order_ids: Vec<String> = conn
            .zrangebyscore(Self::SET_KEY, "-inf", now.timestamp_millis())
            .await
            .map_err(|e| RetryQueueError::Backend(e.to_string()))?;

        let mut entries = Vec::with_capacity(order_ids.len());
        for order_id in order_ids {
            let raw: Option<String> = conn
                .get(Self::entry_key(&order_id))
                .await
                .map_err(|e| RetryQueueError::Backend(e.to_string()))?;
            let Some(raw) = raw else { continue };
            let entry: FailedEntry<M> = serde_json::from_str(&raw)
                .map_err(|e| RetryQueueError::Corrupt(order_id.clone(), e.to_string()))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn clear(&self, order_id: &str) -> Result<(), RetryQueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RetryQueueError::Backend(e.to_string()))?;

        let _: () = conn
            .del(Self::entry_key(order_id))
            .await
            .map_err(|e| RetryQueueError::Backend(e.to_string()))?;
        let _: () = conn
            .del(Self::attempts_key(order_id))
            .await
            .map_err(|e| RetryQueueError::Backend(e.to_string()))?;
        let _: () = conn
            .del(Self::next_retry_key(order_id))
            .await
            .map_err(|e| RetryQueueError::Backend(e.to_string()))?;
        let _: () = conn
            .zrem(Self::SET_KEY, order_id)
            .await
            .map_err(|e| RetryQueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn attempt_count(&self, order_id: &str) -> Result<u32, RetryQueueError> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RetryQueueError::Backend(e.to_string()))?;
        let count: Option<u32> = conn
            .get(Self::attempts_key(order_id))
            .await
            .map_err(|e| RetryQueueError::Backend(e.to_string()))?;
        Ok(count.unwrap_or(0))
    }
}

/// Read a dead-lettered entry directly; used by operator tooling and tests, not
/// by the consumer/scheduler hot path.
pub async fn read_dead_letter<M: DeserializeOwned>(
    client: &Client,
    order_id: &str,
) -> Result<Option<DeadLetter<M>>, RetryQueueError> {
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| RetryQueueError::Backend(e.to_string()))?;
    let raw: Option<String> = conn
        .get(format!("dead_letter:{order_id}"))
        .await
        .map_err(|e| RetryQueueError::Backend(e.to_string()))?;
    raw.map(|raw| {
        serde_json::from_str(&raw).map_err(|e| RetryQueueError::Corrupt(order_id.to_string(), e.to_string()))
    })
    .transpose()
}
