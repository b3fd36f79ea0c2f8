//! # Retry Queue
//!
//! Durable failed-message store with a per-`order_id` attempt counter, computed
//! `next_retry_at`, and promotion to a dead-letter sink once `max_attempts` is
//! exceeded. The counter increment and the entry write happen together inside a
//! single Redis Lua script ([`RECORD_SCRIPT`]) so [`RetryQueue::due`] never
//! observes a torn update — the same server-side-script approach `lock-service`
//! uses for its compare-and-delete release.

pub mod fake;
pub mod redis_backend;

pub use redis_backend::RedisRetryQueue;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5 * 60),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedEntry<M> {
    pub order_id: String,
    pub original_message: M,
    pub last_error: String,
    pub attempt_count: u32,
    pub first_failed_at: DateTime<Utc>,
    pub next_retry_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter<M> {
    pub order_id: String,
    pub original_message: M,
    pub last_error: String,
    pub attempt_count: u32,
    pub first_failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Retried { attempt_count: u32, next_retry_at: DateTime<Utc> },
    DeadLettered { attempt_count: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum RetryQueueError {
    #[error("retry store error: {0}")]
    Backend(String),
    #[error("corrupt retry entry for order {0}: {1}")]
    Corrupt(String, String),
}

#[async_trait]
pub trait RetryQueue<M>: Send + Sync
where
    M: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn record(
        &self,
        order_id: &str,
        message: &M,
        error: &str,
    ) -> Result<RecordOutcome, RetryQueueError>;

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<FailedEntry<M>>, RetryQueueError>;

    /// Delete both the entry and the set membership. Idempotent.
    async fn clear(&self, order_id: &str) -> Result<(), RetryQueueError>;

    async fn attempt_count(&self, order_id: &str) -> Result<u32, RetryQueueError>;
}
