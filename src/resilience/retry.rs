//! Backoff & Retry
//!
//! Generic retry wrapper with exponential backoff. The wait between attempts
//! is `min(initial_delay * multiplier^(attempt - 1), max_delay)`; whether a
//! failure is worth another attempt is decided by a caller-supplied predicate.
//!
//! Waiting goes through the [`Sleeper`] trait so the sequence of waits can be
//! observed in tests without real time passing.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::StepError;

/// What happens to a step once its retry attempts are used up.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ExhaustedAction {
    /// Abort the execution.
    Fail,
    /// Record the failure and move on to the next step.
    Continue,
}

/// Retry configuration attached to a step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1).
    pub max_attempts: u32,

    /// Wait before the second attempt, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound on any single wait, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor applied per attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Extra error kinds (see [`StepError::kind`]) treated as retryable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retryable_errors: Vec<String>,

    /// Required: there is no implicit "retry forever".
    pub on_exhausted: ExhaustedAction,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl RetryPolicy {
    /// Creates a policy with the default delays (1s initial, 30s cap, x2).
    pub fn new(max_attempts: u32, on_exhausted: ExhaustedAction) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            retryable_errors: Vec::new(),
            on_exhausted,
        }
    }

    /// Sets the initial and maximum wait.
    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay_ms = initial.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Adds an error kind to the retry allow-list.
    pub fn retry_on(mut self, kind: impl Into<String>) -> Self {
        self.retryable_errors.push(kind.into());
        self
    }

    /// Wait inserted after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Transient failures plus anything on the allow-list.
    pub fn is_retryable(&self, error: &StepError) -> bool {
        error.is_transient() || self.retryable_errors.iter().any(|kind| kind == error.kind())
    }
}

/// Suspends the current task between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Invokes `operation` up to `policy.max_attempts` times.
///
/// The operation receives the 1-based attempt number. Failures rejected by
/// `is_retryable` propagate immediately; once attempts are exhausted the last
/// error propagates. `on_retry` runs before every wait with the failed
/// attempt number, its error and the wait about to be taken.
pub async fn retry_with_backoff<T, E, F, Fut, P, C>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    is_retryable: P,
    mut on_retry: C,
    mut operation: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    C: FnMut(u32, &E, Duration),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !is_retryable(&e) {
                    warn!("Non-retryable error on attempt {}: {}", attempt, e);
                    return Err(e);
                }

                if attempt >= max_attempts {
                    warn!("Max retry attempts ({}) reached: {}", max_attempts, e);
                    return Err(e);
                }

                let delay = policy.delay_for_attempt(attempt);
                on_retry(attempt, &e, delay);
                info!(
                    "Attempt {}/{} failed: {}; retrying in {:?}",
                    attempt, max_attempts, e, delay
                );

                sleeper.sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
