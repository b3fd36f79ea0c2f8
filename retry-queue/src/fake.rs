//! In-memory [`RetryQueue`] for unit tests.

use crate::{DeadLetter, FailedEntry, RecordOutcome, RetryConfig, RetryQueue, RetryQueueError};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct State<M> {
    entries: HashMap<String, FailedEntry<M>>,
    dead_letters: HashMap<String, DeadLetter<M>>,
}

pub struct InMemoryRetryQueue<M> {
    config: RetryConfig,
    state: Mutex<State<M>>,
}

impl<M> InMemoryRetryQueue<M> {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                entries: HashMap::new(),
                dead_letters: HashMap::new(),
            }),
        }
    }

    pub fn dead_letters(&self) -> Vec<String> {
        let state = self.state.lock().expect("in-memory retry queue poisoned");
        state.dead_letters.keys().cloned().collect()
    }
}

#[async_trait]
impl<M> RetryQueue<M> for InMemoryRetryQueue<M>
where
    M: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn record(
        &self,
        order_id: &str,
        message: &M,
        error: &str,
    ) -> Result<RecordOutcome, RetryQueueError> {
        let mut state = self.state.lock().expect("in-memory retry queue poisoned");
        let now = Utc::now();

        let (first_failed_at, attempt) = match state.entries.get(order_id) {
            Some(existing) => (existing.first_failed_at, existing.attempt_count + 1),
            None => (now, 1),
        };

        if attempt > self.config.max_attempts {
            state.entries.remove(order_id);
            state.dead_letters.insert(
                order_id.to_string(),
                DeadLetter {
                    order_id: order_id.to_string(),
                    original_message: message.clone(),
                    last_error: error.to_string(),
                    attempt_count: attempt,
                    first_failed_at,
                },
            );
            return Ok(RecordOutcome::DeadLettered {
                attempt_count: attempt,
            });
        }

        let delay_ms =
            (self.config.initial_delay.as_millis() as f64) * self.config.multiplier.powi(attempt as i32 - 1);
        let delay_ms = delay_ms.min(self.config.max_delay.as_millis() as f64);
        let next_retry_at = now + ChronoDuration::milliseconds(delay_ms as i64);

        state.entries.insert(
            order_id.to_string(),
            FailedEntry {
                order_id: order_id.to_string(),
                original_message: message.clone(),
                last_error: error.to_string(),
                attempt_count: attempt,
                first_failed_at,
                next_retry_at,
            },
        );

        Ok(RecordOutcome::Retried {
            attempt_count: attempt,
            next_retry_at,
        })
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<FailedEntry<M>>, RetryQueueError> {
        let state = self.state.lock().expect("in-memory retry queue poisoned");
        Ok(state
            .entries
            .values()
            .filter(|e| e.next_retry_at <= now)
            .cloned()
            .collect())
    }

    async fn clear(&self, order_id: &str) -> Result<(), RetryQueueError> {
        let mut state = self.state.lock().expect("in-memory retry queue poisoned");
        state.entries.remove(order_id);
        Ok(())
    }

    async fn attempt_count(&self, order_id: &str) -> Result<u32, RetryQueueError> {
        let state = self.state.lock().expect("in-memory retry queue poisoned");
        Ok(state.entries.get(order_id).map(|e| e.attempt_count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn attempt_count_increments_on_each_record() {
        let queue: InMemoryRetryQueue<String> = InMemoryRetryQueue::new(config());
        queue.record("order-1", &"payload".to_string(), "boom").await.unwrap();
        queue.record("order-1", &"payload".to_string(), "boom again").await.unwrap();
        assert_eq!(queue.attempt_count("order-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn backoff_delay_follows_multiplier_up_to_cap() {
        let queue: InMemoryRetryQueue<String> = InMemoryRetryQueue::new(config());
        let before = Utc::now();
        let outcome = queue.record("order-1", &"payload".to_string(), "boom").await.unwrap();
        match outcome {
            RecordOutcome::Retried { attempt_count, next_retry_at } => {
                assert_eq!(attempt_count, 1);
                let delay = next_retry_at - before;
                assert!(delay >= ChronoDuration::milliseconds(90));
                assert!(delay <= ChronoDuration::milliseconds(200));
            }
            other => panic!("expected Retried, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exceeding_max_attempts_dead_letters() {
        let queue: InMemoryRetryQueue<String> = InMemoryRetryQueue::new(config());
        for _ in 0..3 {
            queue.record("order-1", &"payload".to_string(), "boom").await.unwrap();
        }
        let outcome = queue.record("order-1", &"payload".to_string(), "boom").await.unwrap();
        assert_eq!(outcome, RecordOutcome::DeadLettered { attempt_count: 4 });
        assert_eq!(queue.dead_letters(), vec!["order-1".to_string()]);
        assert_eq!(queue.attempt_count("order-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn due_returns_only_entries_past_their_retry_time() {
        let queue: InMemoryRetryQueue<String> = InMemoryRetryQueue::new(config());
        queue.record("order-1", &"payload".to_string(), "boom").await.unwrap();

        let immediately = queue.due(Utc::now()).await.unwrap();
        assert!(immediately.is_empty());

        let later = queue.due(Utc::now() + ChronoDuration::seconds(5)).await.unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].order_id, "order-1");
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let queue: InMemoryRetryQueue<String> = InMemoryRetryQueue::new(config());
        queue.record("order-1", &"payload".to_string(), "boom").await.unwrap();
        queue.clear("order-1").await.unwrap();
        queue.clear("order-1").await.unwrap();
        assert_eq!(queue.attempt_count("order-1").await.unwrap(), 0);
    }
}
