//! Circuit breaker for the primary operator.
//!
//! Three states: `closed` passes requests and counts consecutive failures;
//! `open` fails fast until the reopen deadline; `half-open` lets trial
//! requests through and closes again after enough consecutive successes.
//! All transitions happen under one mutex so concurrent `allow` /
//! `mark_success` / `mark_failure` calls observe a consistent state.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Breaker tuning parameters.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker trips open.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the breaker closes.
    pub success_threshold: u32,
    /// How long the breaker stays open before allowing trials.
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_secs(5),
        }
    }
}

/// Returned by [`Breaker::allow`] while the breaker is open.
#[derive(Debug, thiserror::Error)]
#[error("circuit open")]
pub struct CircuitOpen;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    reopen_at: Option<Instant>,
}

/// Mutex-guarded three-state circuit breaker.
#[derive(Debug)]
pub struct Breaker {
    inner: Mutex<Inner>,
    config: BreakerConfig,
}

impl Breaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                reopen_at: None,
            }),
            config,
        }
    }

    /// Check whether a request may pass. While open, fails fast until the
    /// reopen deadline, then transitions to half-open and admits trials.
    pub async fn allow(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().await;

        if inner.state == BreakerState::Open {
            let due = inner
                .reopen_at
                .map(|at| Instant::now() >= at)
                .unwrap_or(true);
            if !due {
                return Err(CircuitOpen);
            }
            Self::transition(&mut inner, BreakerState::HalfOpen, &self.config);
        }

        Ok(())
    }

    /// Record a successful call. Closes the breaker from half-open once the
    /// success threshold is met; any success while closed resets counters.
    pub async fn mark_success(&self) {
        let mut inner = self.inner.lock().await;

        if inner.state == BreakerState::HalfOpen {
            inner.success_count += 1;
            if inner.success_count >= self.config.success_threshold {
                Self::transition(&mut inner, BreakerState::Closed, &self.config);
            }
            return;
        }

        Self::transition(&mut inner, BreakerState::Closed, &self.config);
    }

    /// Record a failed call. Trips the breaker open once the failure
    /// threshold is met; any failure while half-open reopens immediately.
    pub async fn mark_failure(&self) {
        let mut inner = self.inner.lock().await;

        inner.failure_count += 1;
        if inner.state == BreakerState::HalfOpen
            || inner.failure_count >= self.config.failure_threshold
        {
            Self::transition(&mut inner, BreakerState::Open, &self.config);
        }
    }

    /// Current state, for logging and tests.
    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    fn transition(inner: &mut Inner, state: BreakerState, config: &BreakerConfig) {
        inner.state = state;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.reopen_at = match state {
            BreakerState::Open => Some(Instant::now() + config.open_timeout),
            _ => None,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_breaker(open_timeout: Duration) -> Breaker {
        Breaker::new(BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout,
        })
    }

    #[tokio::test]
    async fn test_trips_open_after_failure_threshold() {
        let breaker = test_breaker(Duration::from_secs(5));

        breaker.mark_failure().await;
        breaker.mark_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
        assert!(breaker.allow().await.is_ok());

        breaker.mark_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Open);
        assert!(breaker.allow().await.is_err());
    }

    #[tokio::test]
    async fn test_success_in_closed_resets_failure_count() {
        let breaker = test_breaker(Duration::from_secs(5));

        breaker.mark_failure().await;
        breaker.mark_failure().await;
        breaker.mark_success().await;

        // The streak restarted, so two more failures do not trip it.
        breaker.mark_failure().await;
        breaker.mark_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_after_timeout_then_closes() {
        let breaker = test_breaker(Duration::from_millis(20));

        for _ in 0..3 {
            breaker.mark_failure().await;
        }
        assert!(breaker.allow().await.is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.allow().await.is_ok());
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);

        breaker.mark_success().await;
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);
        breaker.mark_success().await;
        assert_eq!(breaker.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_failure_in_half_open_reopens() {
        let breaker = test_breaker(Duration::from_millis(20));

        for _ in 0..3 {
            breaker.mark_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.allow().await.is_ok());

        breaker.mark_failure().await;
        assert_eq!(breaker.state().await, BreakerState::Open);
        assert!(breaker.allow().await.is_err());
    }
}
