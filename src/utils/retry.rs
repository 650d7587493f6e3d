//! Bounded retry with exponential backoff and jitter.
//!
//! Every retry in the crate goes through [`retry_with_backoff`] so that
//! attempt counts, delays and logging are uniform: exchange calls via
//! `ResilientExchange`, store writes via `Store::write`.

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff with jitter.
///
/// Formula: min(max_delay, base * 2^attempt) +/- jitter_factor * delay
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff. Negative jitter is clamped to zero.
    pub fn new(base: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            max_delay,
            jitter_factor: jitter_factor.max(0.0),
            attempt: 0,
        }
    }

    /// Calculate the next delay and increment the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp_delay = self.base.saturating_mul(2u32.saturating_pow(self.attempt));
        let capped_delay = exp_delay.min(self.max_delay);

        let jitter_range = capped_delay.as_secs_f64() * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_secs = (capped_delay.as_secs_f64() + jitter).max(0.0);

        self.attempt = self.attempt.saturating_add(1);

        Duration::from_secs_f64(final_secs)
    }

    /// Current attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// How many times and how patiently to retry an operation.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one (>= 1)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter as a fraction of the delay (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Zero-delay policy, handy in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_factor: 0.0,
        }
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.base_delay, self.max_delay, self.jitter_factor)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget is spent. `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    operation: &str,
    is_retryable: C,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut backoff = policy.backoff();
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && is_retryable(&e) => {
                let delay = backoff.next_delay();
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
