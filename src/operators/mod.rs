//! Upstream SMS operators and the failover dispatcher.
//!
//! Two operators form a closed variant set: `operatorA` (primary) and
//! `operatorB` (fallback). The dispatcher tries the primary behind a
//! circuit breaker with bounded retries and per-attempt timeouts, then
//! falls back. The fallback runs the same retry policy but has no breaker;
//! if it also fails, the last error is surfaced to the caller, which marks
//! the delivery failed and refunds.

pub mod breaker;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::DispatcherConfig;
use crate::model::Sms;

pub use breaker::{Breaker, BreakerConfig, BreakerState, CircuitOpen};

/// Result type for operator operations.
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur while sending through an operator.
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("{operator} send failed: {message}")]
    Send { operator: String, message: String },

    #[error("{0} send timed out")]
    Timeout(String),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),
}

/// A single upstream SMS operator capability.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Operator name as recorded in delivery rows.
    fn name(&self) -> &str;

    /// Deliver the message to every recipient.
    async fn send(&self, sms: &Sms) -> Result<()>;
}

/// Primary operator.
pub struct PrimaryOperator;

#[async_trait]
impl Operator for PrimaryOperator {
    fn name(&self) -> &str {
        "operatorA"
    }

    async fn send(&self, sms: &Sms) -> Result<()> {
        for recipient in &sms.recipients {
            info!(
                customer_id = sms.customer_id,
                recipient = %recipient,
                operator = self.name(),
                "sms sent"
            );
        }
        Ok(())
    }
}

/// Fallback operator.
pub struct FallbackOperator;

#[async_trait]
impl Operator for FallbackOperator {
    fn name(&self) -> &str {
        "operatorB"
    }

    async fn send(&self, sms: &Sms) -> Result<()> {
        for recipient in &sms.recipients {
            info!(
                customer_id = sms.customer_id,
                recipient = %recipient,
                operator = self.name(),
                "sms sent"
            );
        }
        Ok(())
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Primary/fallback dispatcher with a breaker on the primary path.
pub struct Dispatcher {
    primary: Arc<dyn Operator>,
    fallback: Arc<dyn Operator>,
    breaker: Breaker,
    send_timeout: Duration,
    max_retries: u32,
    initial_backoff: Duration,
}

impl Dispatcher {
    pub fn new(
        primary: Arc<dyn Operator>,
        fallback: Arc<dyn Operator>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            breaker: Breaker::new(BreakerConfig {
                failure_threshold: config.failure_threshold,
                success_threshold: config.success_threshold,
                open_timeout: config.open_timeout(),
            }),
            send_timeout: config.send_timeout(),
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff(),
        }
    }

    /// Send through the primary, falling back on any primary-side failure
    /// (including a fast-fail from the open breaker). Returns the name of
    /// the operator that accepted the message.
    pub async fn send(&self, sms: &Sms) -> Result<String> {
        match self
            .try_operator(self.primary.as_ref(), Some(&self.breaker), sms)
            .await
        {
            Ok(provider) => return Ok(provider),
            Err(e) => {
                warn!(error = %e, "primary operator failed, falling back");
            }
        }

        self.try_operator(self.fallback.as_ref(), None, sms).await
    }

    /// Run the bounded retry loop against one operator. Each attempt gets
    /// its own hard timeout; the backoff doubles between attempts. Breaker
    /// bookkeeping only applies to the primary path.
    async fn try_operator(
        &self,
        operator: &dyn Operator,
        breaker: Option<&Breaker>,
        sms: &Sms,
    ) -> Result<String> {
        if let Some(breaker) = breaker {
            breaker.allow().await?;
        }

        let mut backoff = self.initial_backoff;
        let mut last_error = OperatorError::Send {
            operator: operator.name().to_string(),
            message: "failed without an explicit error".to_string(),
        };

        for attempt in 0..=self.max_retries {
            match tokio::time::timeout(self.send_timeout, operator.send(sms)).await {
                Ok(Ok(())) => {
                    if let Some(breaker) = breaker {
                        breaker.mark_success().await;
                    }
                    return Ok(operator.name().to_string());
                }
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = OperatorError::Timeout(operator.name().to_string()),
            }

            if let Some(breaker) = breaker {
                breaker.mark_failure().await;
            }

            if attempt == self.max_retries {
                break;
            }

            warn!(
                operator = operator.name(),
                attempt = attempt + 1,
                error = %last_error,
                delay = ?backoff,
                "operator send failed, retrying after backoff"
            );
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }

        Err(last_error)
    }

    /// Primary breaker state, for logging and tests.
    pub async fn breaker_state(&self) -> BreakerState {
        self.breaker.state().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Operator that fails the first `failures` calls, then succeeds.
    struct FlakyOperator {
        name: &'static str,
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyOperator {
        fn new(name: &'static str, failures: u32) -> Self {
            Self {
                name,
                failures,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Operator for FlakyOperator {
        fn name(&self) -> &str {
            self.name
        }

        async fn send(&self, _sms: &Sms) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(OperatorError::Send {
                    operator: self.name.to_string(),
                    message: "injected failure".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            send_timeout_ms: 200,
            max_retries: 2,
            initial_backoff_ms: 1,
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout_ms: 5_000,
        }
    }

    fn test_sms() -> Sms {
        Sms {
            customer_id: 1,
            recipients: vec!["+1".to_string()],
            sms_identifier: "sid".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_primary_success_first_attempt() {
        let primary = Arc::new(FlakyOperator::new("operatorA", 0));
        let fallback = Arc::new(FlakyOperator::new("operatorB", 0));
        let dispatcher = Dispatcher::new(primary.clone(), fallback.clone(), &fast_config());

        let provider = dispatcher.send(&test_sms()).await.expect("send");
        assert_eq!(provider, "operatorA");
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_primary_retries_then_succeeds() {
        let primary = Arc::new(FlakyOperator::new("operatorA", 2));
        let fallback = Arc::new(FlakyOperator::new("operatorB", 0));
        let dispatcher = Dispatcher::new(primary.clone(), fallback.clone(), &fast_config());

        let provider = dispatcher.send(&test_sms()).await.expect("send");
        assert_eq!(provider, "operatorA");
        assert_eq!(primary.calls(), 3);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_fallback_after_primary_exhausted() {
        let primary = Arc::new(FlakyOperator::new("operatorA", u32::MAX));
        let fallback = Arc::new(FlakyOperator::new("operatorB", 0));
        let dispatcher = Dispatcher::new(primary.clone(), fallback.clone(), &fast_config());

        let provider = dispatcher.send(&test_sms()).await.expect("send");
        assert_eq!(provider, "operatorB");
        // 1 + max_retries attempts against the primary.
        assert_eq!(primary.calls(), 3);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_skips_primary() {
        let primary = Arc::new(FlakyOperator::new("operatorA", u32::MAX));
        let fallback = Arc::new(FlakyOperator::new("operatorB", 0));
        let dispatcher = Dispatcher::new(primary.clone(), fallback.clone(), &fast_config());

        // Three failed attempts trip the breaker within one dispatch.
        let provider = dispatcher.send(&test_sms()).await.expect("send");
        assert_eq!(provider, "operatorB");
        assert_eq!(dispatcher.breaker_state().await, BreakerState::Open);
        let primary_calls = primary.calls();

        // The open breaker fast-fails the primary path; no new attempts.
        let provider = dispatcher.send(&test_sms()).await.expect("send");
        assert_eq!(provider, "operatorB");
        assert_eq!(primary.calls(), primary_calls);
        assert_eq!(fallback.calls(), 2);
    }

    #[tokio::test]
    async fn test_both_operators_fail_surfaces_last_error() {
        let primary = Arc::new(FlakyOperator::new("operatorA", u32::MAX));
        let fallback = Arc::new(FlakyOperator::new("operatorB", u32::MAX));
        let dispatcher = Dispatcher::new(primary, fallback.clone(), &fast_config());

        let err = dispatcher.send(&test_sms()).await.expect_err("should fail");
        assert!(matches!(err, OperatorError::Send { operator, .. } if operator == "operatorB"));
        assert_eq!(fallback.calls(), 3);
    }

    #[tokio::test]
    async fn test_breaker_recovers_after_open_timeout() {
        let config = DispatcherConfig {
            open_timeout_ms: 30,
            ..fast_config()
        };
        // Fails the first dispatch's three attempts, then recovers.
        let primary = Arc::new(FlakyOperator::new("operatorA", 3));
        let fallback = Arc::new(FlakyOperator::new("operatorB", 0));
        let dispatcher = Dispatcher::new(primary.clone(), fallback, &config);

        let provider = dispatcher.send(&test_sms()).await.expect("send");
        assert_eq!(provider, "operatorB");
        assert_eq!(dispatcher.breaker_state().await, BreakerState::Open);

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;

        // Half-open trial passes and the primary takes traffic again.
        let provider = dispatcher.send(&test_sms()).await.expect("send");
        assert_eq!(provider, "operatorA");
        assert_eq!(dispatcher.breaker_state().await, BreakerState::HalfOpen);

        let provider = dispatcher.send(&test_sms()).await.expect("send");
        assert_eq!(provider, "operatorA");
        assert_eq!(dispatcher.breaker_state().await, BreakerState::Closed);
    }
}
