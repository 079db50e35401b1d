//! Per-destination-domain circuit breakers.
//!
//! State lives behind a mutex taken only around transitions; the hot
//! path is one lock acquisition per call. Snapshots expose state and
//! counters for inspection and tests.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::FutureExt;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
    pub half_open_max_calls: u32,
    pub execution_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(5 * 60),
            half_open_max_calls: 2,
            execution_timeout: Duration::from_secs(2 * 60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Copy, Debug)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failures: u32,
    pub successes: u32,
    pub last_transition: Instant,
}

#[derive(Error, Debug)]
pub enum CircuitError {
    #[error("circuit breaker is open")]
    Open,
    #[error("execution timed out")]
    Timeout,
    #[error(transparent)]
    Inner(#[from] anyhow::Error),
}

struct Inner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    half_open_calls: u32,
    opened_at: Instant,
    last_transition: Instant,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                half_open_calls: 0,
                opened_at: Instant::now(),
                last_transition: Instant::now(),
            }),
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        BreakerSnapshot {
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            last_transition: inner.last_transition,
        }
    }

    /// Runs `fut` under the breaker. Open circuits reject immediately;
    /// half-open circuits admit at most `half_open_max_calls`
    /// concurrently. Panics inside `fut` count as failures. Errors for
    /// which `is_failure` returns false pass through without touching
    /// the counters.
    pub async fn execute<F, T>(
        &self,
        fut: F,
        is_failure: impl Fn(&anyhow::Error) -> bool,
    ) -> Result<T, CircuitError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        let admitted_half_open = self.try_acquire()?;

        let outcome = tokio::time::timeout(
            self.config.execution_timeout,
            AssertUnwindSafe(fut).catch_unwind(),
        )
        .await;

        let result = match outcome {
            Err(_elapsed) => {
                self.on_failure(admitted_half_open);
                Err(CircuitError::Timeout)
            }
            Ok(Err(panic)) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic in breaker task".to_string());
                self.on_failure(admitted_half_open);
                Err(CircuitError::Inner(anyhow::anyhow!("panic: {}", msg)))
            }
            Ok(Ok(Ok(value))) => {
                self.on_success(admitted_half_open);
                Ok(value)
            }
            Ok(Ok(Err(err))) => {
                if is_failure(&err) {
                    self.on_failure(admitted_half_open);
                } else {
                    self.release(admitted_half_open);
                }
                Err(CircuitError::Inner(err))
            }
        };
        result
    }

    /// Admission check; returns whether the call occupies a half-open
    /// slot. Performs the open → half-open transition lazily.
    fn try_acquire(&self) -> Result<bool, CircuitError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                if inner.opened_at.elapsed() >= self.config.open_timeout {
                    transition(&mut inner, BreakerState::HalfOpen);
                    inner.half_open_calls = 1;
                    Ok(true)
                } else {
                    Err(CircuitError::Open)
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_calls >= self.config.half_open_max_calls {
                    Err(CircuitError::Open)
                } else {
                    inner.half_open_calls += 1;
                    Ok(true)
                }
            }
        }
    }

    fn on_success(&self, half_open_slot: bool) {
        let mut inner = self.inner.lock().unwrap();
        if half_open_slot {
            inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
        }
        match inner.state {
            BreakerState::Closed => {
                inner.failures = 0;
            }
            BreakerState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    transition(&mut inner, BreakerState::Closed);
                }
            }
            BreakerState::Open => {}
        }
    }

    fn on_failure(&self, half_open_slot: bool) {
        let mut inner = self.inner.lock().unwrap();
        if half_open_slot {
            inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
        }
        match inner.state {
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    transition(&mut inner, BreakerState::Open);
                    inner.opened_at = Instant::now();
                }
            }
            BreakerState::HalfOpen => {
                transition(&mut inner, BreakerState::Open);
                inner.opened_at = Instant::now();
            }
            BreakerState::Open => {}
        }
    }

    fn release(&self, half_open_slot: bool) {
        if half_open_slot {
            let mut inner = self.inner.lock().unwrap();
            inner.half_open_calls = inner.half_open_calls.saturating_sub(1);
        }
    }
}

/// Entering a state resets the opposite counter.
fn transition(inner: &mut Inner, to: BreakerState) {
    inner.state = to;
    inner.last_transition = Instant::now();
    match to {
        BreakerState::Closed => {
            inner.failures = 0;
        }
        BreakerState::Open => {
            inner.successes = 0;
        }
        BreakerState::HalfOpen => {
            inner.successes = 0;
            inner.failures = 0;
            inner.half_open_calls = 0;
        }
    }
}

/// One breaker per destination domain.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, domain: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(domain.to_lowercase())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_millis(50),
            half_open_max_calls: 2,
            execution_timeout: Duration::from_secs(5),
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker
            .execute(async { Err::<(), _>(anyhow!("boom")) }, |_| true)
            .await;
    }

    async fn succeed(breaker: &CircuitBreaker) {
        breaker
            .execute(async { Ok::<_, anyhow::Error>(()) }, |_| true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.snapshot().state, BreakerState::Open);
        assert!(matches!(
            breaker
                .execute(async { Ok::<_, anyhow::Error>(()) }, |_| true)
                .await,
            Err(CircuitError::Open)
        ));
    }

    #[tokio::test]
    async fn success_in_closed_resets_failures() {
        let breaker = CircuitBreaker::new(fast_config());
        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await;
        assert_eq!(breaker.snapshot().failures, 0);
        assert_eq!(breaker.snapshot().state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_closes_after_successes() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        succeed(&breaker).await;
        assert_eq!(breaker.snapshot().state, BreakerState::HalfOpen);
        succeed(&breaker).await;
        assert_eq!(breaker.snapshot().state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        fail(&breaker).await;
        assert_eq!(breaker.snapshot().state, BreakerState::Open);
    }

    #[tokio::test]
    async fn half_open_concurrency_is_capped() {
        let breaker = Arc::new(CircuitBreaker::new(fast_config()));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        // two calls occupy the half-open slots and block on signals
        let (tx1, rx1) = tokio::sync::oneshot::channel::<()>();
        let (tx2, rx2) = tokio::sync::oneshot::channel::<()>();
        let b1 = breaker.clone();
        let h1 = tokio::spawn(async move {
            b1.execute(
                async {
                    let _ = rx1.await;
                    Ok::<_, anyhow::Error>(())
                },
                |_| true,
            )
            .await
        });
        let b2 = breaker.clone();
        let h2 = tokio::spawn(async move {
            b2.execute(
                async {
                    let _ = rx2.await;
                    Ok::<_, anyhow::Error>(())
                },
                |_| true,
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // the third concurrent call is rejected
        assert!(matches!(
            breaker
                .execute(async { Ok::<_, anyhow::Error>(()) }, |_| true)
                .await,
            Err(CircuitError::Open)
        ));

        tx1.send(()).unwrap();
        tx2.send(()).unwrap();
        h1.await.unwrap().unwrap();
        h2.await.unwrap().unwrap();
        assert_eq!(breaker.snapshot().state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn panics_count_as_failures() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            let result = breaker
                .execute(
                    async {
                        panic!("worker bug");
                        #[allow(unreachable_code)]
                        Ok::<_, anyhow::Error>(())
                    },
                    |_| true,
                )
                .await;
            assert!(matches!(result, Err(CircuitError::Inner(_))));
        }
        assert_eq!(breaker.snapshot().state, BreakerState::Open);
    }

    #[tokio::test]
    async fn excluded_errors_do_not_count() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..10 {
            let _ = breaker
                .execute(async { Err::<(), _>(anyhow!("not my fault")) }, |_| false)
                .await;
        }
        assert_eq!(breaker.snapshot().state, BreakerState::Closed);
    }
}
