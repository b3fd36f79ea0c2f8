//! Per-endpoint circuit breaker with a rolling failure-rate window.
//!
//! Modeled as an explicit state machine (closed / open / half-open) rather than a
//! framework annotation, so the catalog client can wrap each HTTP call the same way
//! regardless of which endpoint (customer, product) it is protecting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of most-recent call outcomes the failure rate is computed over.
    pub window_size: usize,
    /// Minimum number of outcomes collected before the failure rate is
    /// evaluated at all, so a couple of early failures can't open the breaker
    /// before the window has enough samples to mean anything.
    pub min_samples: usize,
    /// Failure rate (0.0..=1.0) above which the breaker opens.
    pub failure_rate_threshold: f64,
    /// How long the breaker stays open before admitting a half-open probe.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            min_samples: 5,
            failure_rate_threshold: 0.5,
            cooldown: Duration::from_secs(10),
        }
    }
}

struct Window {
    outcomes: VecDeque<bool>,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn record(&mut self, success: bool) {
        if self.outcomes.len() == self.capacity {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }

    fn clear(&mut self) {
        self.outcomes.clear();
    }
}

/// Rolling-window circuit breaker for a single catalog endpoint.
pub struct CircuitBreaker {
    state: AtomicU8,
    opened_at_millis: AtomicU64,
    window: Mutex<Window>,
    config: CircuitBreakerConfig,
    start: Instant,
}

/// Returned when the breaker refuses a call without attempting it.
#[derive(Debug, thiserror::Error)]
#[error("circuit breaker open")]
pub struct BreakerOpen;

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            opened_at_millis: AtomicU64::new(0),
            window: Mutex::new(Window::new(config.window_size)),
            config,
            start: Instant::now(),
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Call this before attempting the protected operation. Returns an error
    /// if the breaker is open and the cooldown has not elapsed.
    fn admit(&self) -> Result<(), BreakerOpen> {
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened_at = self.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.now_millis().saturating_sub(opened_at);
                    if elapsed < self.config.cooldown.as_millis() as u64 {
                        return Err(BreakerOpen);
                    }
                    match self.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            tracing::info!("circuit breaker transitioning to half-open");
                            return Ok(());
                        }
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    // Another probe is already in flight; treat this caller as
                    // open until the probe resolves.
                    return Err(BreakerOpen);
                }
                _ => return Ok(()),
            }
        }
    }

    fn on_success(&self) {
        let mut window = self.window.lock().expect("circuit breaker window poisoned");
        window.record(true);
        if self.state.load(Ordering::Acquire) == STATE_HALF_OPEN {
            tracing::info!("circuit breaker closing after successful probe");
            window.clear();
            self.state.store(STATE_CLOSED, Ordering::Release);
        }
    }

    fn on_failure(&self) {
        let mut window = self.window.lock().expect("circuit breaker window poisoned");
        if self.state.load(Ordering::Acquire) == STATE_HALF_OPEN {
            tracing::warn!("circuit breaker re-opening after failed probe");
            self.open();
            return;
        }
        window.record(false);
        if window.outcomes.len() >= self.config.min_samples
            && window.failure_rate() > self.config.failure_rate_threshold
        {
            drop(window);
            tracing::warn!(
                threshold = self.config.failure_rate_threshold,
                "circuit breaker opening: failure rate exceeded"
            );
            self.open();
        }
    }

    fn open(&self) {
        self.opened_at_millis
            .store(self.now_millis(), Ordering::Release);
        self.state.store(STATE_OPEN, Ordering::Release);
        self.window.lock().expect("circuit breaker window poisoned").clear();
    }

    /// Run `op` if the breaker admits the call, recording the outcome.
    pub async fn call<T, E, Fut, Op>(&self, op: Op) -> Result<T, CircuitCallError<E>>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        self.admit().map_err(|_| CircuitCallError::Open)?;
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(CircuitCallError::Inner(e))
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitCallError<E> {
    #[error("circuit breaker open")]
    Open,
    #[error(transparent)]
    Inner(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(window: usize, threshold: f64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            window_size: window,
            min_samples: 5,
            failure_rate_threshold: threshold,
            cooldown: Duration::from_millis(50),
        })
    }

    #[tokio::test]
    async fn stays_closed_below_threshold() {
        let cb = breaker(10, 0.5);
        for _ in 0..4 {
            let _ = cb.call(|| async { Err::<(), _>("boom") }).await;
        }
        for _ in 0..6 {
            let _ = cb.call(|| async { Ok::<_, &str>(()) }).await;
        }
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_above_threshold_and_rejects_without_calling() {
        let cb = breaker(10, 0.5);
        for _ in 0..6 {
            let _ = cb.call(|| async { Err::<(), _>("boom") }).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let mut called = false;
        let result = cb
            .call(|| {
                called = true;
                async { Ok::<_, &str>(()) }
            })
            .await;
        assert!(matches!(result, Err(CircuitCallError::Open)));
        assert!(!called, "breaker must short-circuit without invoking the operation");
    }

    #[tokio::test]
    async fn half_opens_after_cooldown_and_closes_on_success() {
        let cb = breaker(10, 0.5);
        for _ in 0..6 {
            let _ = cb.call(|| async { Err::<(), _>("boom") }).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let result = cb.call(|| async { Ok::<_, &str>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let cb = breaker(10, 0.5);
        for _ in 0..6 {
            let _ = cb.call(|| async { Err::<(), _>("boom") }).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let result = cb.call(|| async { Err::<(), _>("still broken") }).await;
        assert!(matches!(result, Err(CircuitCallError::Inner(_))));
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
