//! Retry and wait policy around adapter calls.
//!
//! Back-off is exponential with jitter: `min(max_delay, base * 2^i)` scaled
//! by a random factor in `[1.0, 1.3]`. A call stops retrying when the
//! attempt count reaches `max_retries` or cumulative back-off exceeds the
//! retry budget. Rate-limit waits additionally respect a hard wall-clock
//! ceiling; unbounded waiting is forbidden.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::ResilienceConfig;
use crate::providers::{ErrorClass, ProviderError};

/// Tuned retry policy derived from [`ResilienceConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub wait_on_rate_limit: bool,
    /// Cumulative back-off budget per call.
    pub retry_budget: Duration,
    /// Hard ceiling on cumulative rate-limit waiting per call.
    pub max_wait_timeout: Duration,
}

impl From<&ResilienceConfig> for RetryPolicy {
    fn from(cfg: &ResilienceConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_secs_f64(cfg.base_delay_s.max(0.0)),
            max_delay: Duration::from_secs_f64(cfg.max_delay_s.max(0.0)),
            wait_on_rate_limit: cfg.wait_on_rate_limit,
            retry_budget: Duration::from_secs_f64(cfg.retry_budget_s.max(0.0)),
            max_wait_timeout: Duration::from_secs_f64(cfg.max_wait_timeout_s.max(0.0)),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay for the given completed-attempt count, before jitter.
    fn backoff_base(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt.min(30) as i32);
        Duration::from_secs_f64(exp.min(self.max_delay.as_secs_f64()))
    }

    /// Jittered back-off delay.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter = 1.0 + rand::thread_rng().gen_range(0.0..0.3);
        self.backoff_base(attempt).mul_f64(jitter)
    }
}

/// One retry decision, reported to the observer before sleeping.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// 1-based retry index.
    pub index: u32,
    pub delay: Duration,
    pub class: ErrorClass,
    pub error_kind: &'static str,
}

/// Why a retried operation ultimately failed.
#[derive(Debug)]
pub enum RetryError {
    /// The final provider error after retries were exhausted or the error
    /// was not retryable.
    Provider(ProviderError),
    /// Cumulative rate-limit waiting hit the wall-clock ceiling.
    WaitCeiling { waited: Duration },
}

/// Run `op` under the retry policy. `observe` fires once per retry decision
/// so the orchestrator can record `retry_attempt` events; the token cancels
/// any pending back-off sleep.
pub async fn run_with_retry<T, F, Fut, O>(
    policy: &RetryPolicy,
    mut op: F,
    mut observe: O,
    cancel: &CancelToken,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
    O: FnMut(&RetryAttempt),
{
    let mut retries: u32 = 0;
    let mut waited = Duration::ZERO;
    let mut rate_limit_waited = Duration::ZERO;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Provider(ProviderError::Cancelled));
        }

        let error = match op().await {
            Ok(value) => {
                if retries > 0 {
                    debug!(retries, "provider call succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        let class = error.class();
        match class {
            ErrorClass::Fatal | ErrorClass::Cancelled => {
                return Err(RetryError::Provider(error));
            }
            ErrorClass::RateLimited if !policy.wait_on_rate_limit => {
                return Err(RetryError::Provider(error));
            }
            ErrorClass::Retryable | ErrorClass::RateLimited => {
                if retries >= policy.max_retries {
                    warn!(
                        retries,
                        max_retries = policy.max_retries,
                        error = %error,
                        "retries exhausted"
                    );
                    return Err(RetryError::Provider(error));
                }

                let mut delay = policy.backoff(retries);
                if class == ErrorClass::RateLimited {
                    // Honour the provider's hint when it is longer than ours.
                    delay = delay.max(error.retry_after().unwrap_or(Duration::ZERO));
                    if rate_limit_waited + delay > policy.max_wait_timeout {
                        warn!(
                            waited_s = rate_limit_waited.as_secs_f64(),
                            ceiling_s = policy.max_wait_timeout.as_secs_f64(),
                            "rate-limit wait ceiling reached"
                        );
                        return Err(RetryError::WaitCeiling {
                            waited: rate_limit_waited,
                        });
                    }
                    rate_limit_waited += delay;
                }

                if waited + delay > policy.retry_budget {
                    warn!(
                        waited_s = waited.as_secs_f64(),
                        budget_s = policy.retry_budget.as_secs_f64(),
                        error = %error,
                        "retry budget exhausted"
                    );
                    return Err(RetryError::Provider(error));
                }
                waited += delay;
                retries += 1;

                let attempt = RetryAttempt {
                    index: retries,
                    delay,
                    class,
                    error_kind: error.kind_tag(),
                };
                warn!(
                    attempt = attempt.index,
                    delay_ms = delay.as_millis() as u64,
                    kind = attempt.error_kind,
                    error = %error,
                    "provider call failed, retrying"
                );
                observe(&attempt);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(RetryError::Provider(ProviderError::Cancelled));
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
