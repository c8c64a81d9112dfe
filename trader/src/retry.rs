//! Bounded retry with linear backoff for transient decision-step failures.

use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

/// `max_retries` total attempts; after failed attempt `n < max_retries` sleep `base_delay * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Blocking sleep seam so tests can observe backoff without waiting.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Call `op` with attempt numbers `1..=max_retries` until it succeeds.
///
/// Intermediate failures are logged and swallowed; the final failure is returned
/// unchanged. A policy of zero retries still makes one attempt.
pub fn with_retry<T, S, F>(policy: &RetryPolicy, sleeper: &S, mut op: F) -> Result<T>
where
    S: Sleeper + ?Sized,
    F: FnMut(u32) -> Result<T>,
{
    let attempts = policy.max_retries.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    attempt,
                    max_retries = attempts,
                    delay_ms = delay.as_millis() as u64,
                    err = %format!("{err:#}"),
                    "attempt failed, retrying"
                );
                sleeper.sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
