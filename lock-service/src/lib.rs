//! # Lock Service
//!
//! Per-order mutual exclusion across workers, built on the `SET key token NX EX
//! seconds` primitive and release-by-compare-and-delete established by the
//! cache-stampede lock in this codebase's Redis examples, generalized from a
//! cache-repopulation lock into a general-purpose named lock with a caller-supplied
//! body.

pub mod fake;
pub mod redis_backend;

use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use redis_backend::RedisLockBackend;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock unavailable for order {0}")]
    Unavailable(String),
    #[error("lock backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// Maximum time to wait for acquisition before failing.
    pub wait_time: Duration,
    /// Lock auto-release after this duration if the holder disappears.
    pub lease_time: Duration,
    /// Delay between acquisition attempts while waiting.
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_time: Duration::from_secs(10),
            lease_time: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// The minimal primitive a lock store must provide: an atomic conditional set
/// with expiry, a compare-and-delete release, and an advisory existence check.
#[async_trait]
pub trait LockBackend: Send + Sync {
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool, LockError>;
    async fn release(&self, key: &str, token: &str) -> Result<(), LockError>;
    async fn exists(&self, key: &str) -> Result<bool, LockError>;
}

pub struct LockService {
    backend: Arc<dyn LockBackend>,
    config: LockConfig,
}

impl LockService {
    pub fn new(backend: Arc<dyn LockBackend>, config: LockConfig) -> Self {
        Self { backend, config }
    }

    fn lock_key(order_id: &str) -> String {
        format!("order-lock:{order_id}")
    }

    /// Acquire the lock for `order_id`, run `body`, and release the lock
    /// unconditionally on every exit path (the `LockGuard` releases on `Drop`, so
    /// a panic inside `body` still releases it).
    ///
    /// Fails with [`LockError::Unavailable`] without invoking `body` if
    /// acquisition does not complete within `wait_time`.
    pub async fn with_lock<F, Fut, T>(&self, order_id: &str, body: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let key = Self::lock_key(order_id);
        let token: String = {
            let mut rng = rand::thread_rng();
            (0..16).map(|_| format!("{:x}", rng.gen::<u8>())).collect()
        };

        let deadline = tokio::time::Instant::now() + self.config.wait_time;
        loop {
            if self
                .backend
                .try_acquire(&key, &token, self.config.lease_time)
                .await?
            {
                tracing::debug!(order_id, "lock acquired");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LockError::Unavailable(order_id.to_string()));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        let _guard = LockGuard {
            backend: self.backend.clone(),
            key: key.clone(),
            token: token.clone(),
        };

        Ok(body().await)
    }

    pub async fn is_locked(&self, order_id: &str) -> Result<bool, LockError> {
        self.backend.exists(&Self::lock_key(order_id)).await
    }
}

/// Releases the lock on drop. Spawns the async release as a detached task since
/// `Drop` cannot be async; this mirrors the "release is resilient to the lock
/// having already expired" requirement — a release racing an expiry is a no-op
/// either way.
struct LockGuard {
    backend: Arc<dyn LockBackend>,
    key: String,
    token: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let backend = self.backend.clone();
        let key = self.key.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.release(&key, &token).await {
                tracing::warn!(key, error = %e, "failed to release lock; it will lease-expire");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::InMemoryLockBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service(config: LockConfig) -> LockService {
        LockService::new(Arc::new(InMemoryLockBackend::new()), config)
    }

    #[tokio::test]
    async fn runs_body_once_under_lock() {
        let svc = service(LockConfig::default());
        let result = svc.with_lock("order-1", || async { 42 }).await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn second_concurrent_caller_times_out() {
        let svc = Arc::new(service(LockConfig {
            wait_time: Duration::from_millis(100),
            lease_time: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        }));

        let svc2 = svc.clone();
        let holder = tokio::spawn(async move {
            svc2.with_lock("order-1", || async {
                tokio::time::sleep(Duration::from_millis(300)).await;
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let blocked = svc.with_lock("order-1", || async {}).await;
        assert!(matches!(blocked, Err(LockError::Unavailable(_))));

        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn lock_released_after_body_completes_allows_next_caller() {
        let svc = service(LockConfig::default());
        svc.with_lock("order-1", || async {}).await.unwrap();
        // Give the detached release task a chance to run.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = svc.with_lock("order-1", || async { 1 }).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn distinct_order_ids_do_not_contend() {
        let svc = Arc::new(service(LockConfig {
            wait_time: Duration::from_millis(200),
            lease_time: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        }));
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for i in 0..5 {
            let svc = svc.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                svc.with_lock(&format!("order-{i}"), || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
