//! Bounded retry with exponential backoff and jitter for adapter calls.
//!
//! Only transient [`ControlError`]s are retried; anything else returns on the
//! first attempt. Every attempt runs under its own timeout.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sonic_common::ControlError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Values below 1 count as 1.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Upper bound for a single attempt.
    pub attempt_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 250,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            attempt_timeout_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `operation` until it succeeds, fails permanently, or exhausts the
/// policy. Returns the final result together with the attempts spent.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> (Result<T, ControlError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControlError>>,
{
    let mut attempt = 0u32;
    let mut delay = Duration::from_millis(policy.initial_delay_ms);
    let timeout = Duration::from_millis(policy.attempt_timeout_ms);

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(timeout, operation()).await {
            Ok(r) => r,
            Err(_) => Err(ControlError::Timeout(policy.attempt_timeout_ms)),
        };

        let err = match result {
            Ok(v) => return (Ok(v), attempt),
            Err(e) => e,
        };

        if !err.is_transient() {
            debug!(operation = %operation_name, attempt, error = %err, "permanent failure, not retrying");
            return (Err(err), attempt);
        }
        if attempt >= policy.attempts() {
            warn!(operation = %operation_name, attempt, error = %err, "retries exhausted");
            return (Err(err), attempt);
        }

        // 0.5x to 1.5x of the nominal delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = jittered.as_millis() as u64,
            "operation failed, retrying"
        );
        tokio::time::sleep(jittered).await;

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * policy.backoff_multiplier)
                .min(Duration::from_millis(policy.max_delay_ms).as_secs_f64()),
        );
    }
}
