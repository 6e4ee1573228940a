//! Exponential backoff with jitter
//!
//! Two users: conflicting applies retried inside a pass
//! ([`retry_with_backoff`]), and the requeue delay of a failed pass
//! ([`backoff_delay`]).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff schedule
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts before giving up, 0 for unbounded
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for the un-jittered delay
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Short schedule bounded to `attempts` tries
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Self::default()
        }
    }

    /// Requeue schedule for failed passes: 5s doubling up to 5 minutes
    pub fn requeue() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

fn capped_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32) as i32;
    let secs = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    Duration::from_secs_f64(secs.min(config.max_delay.as_secs_f64()))
}

/// Delay before retry `attempt` (1-based), jittered to 0.5x..1.5x
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    capped_delay(config, attempt).mul_f64(factor)
}

/// Run `operation` until it succeeds, `should_retry` rejects its error or
/// the schedule runs out. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let e = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !should_retry(&e) {
            return Err(e);
        }
        if config.exhausted(attempt) {
            error!(operation = operation_name, attempt, error = %e, "giving up");
            return Err(e);
        }

        let delay = backoff_delay(config, attempt);
        warn!(
            operation = operation_name,
            attempt,
            error = %e,
            delay_ms = delay.as_millis() as u64,
            "retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
