//! Retry policy and backoff used by connection setup, command execution and
//! liveness probing.
//!
//! Backoff grows either Fibonacci-style (`next = current + previous`) or
//! exponentially, and every loop is bounded by `max_attempts`.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Errors that can be retried.
pub trait RetryableError {
    /// Whether this error is transient and worth another attempt.
    fn is_retryable(&self) -> bool;
}

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `delay(n + 1) = delay(n) + delay(n - 1)`, seeded with
    /// (`initial_delay` - 1s, `initial_delay`).
    Fibonacci,
    /// `delay(n) = initial_delay * 2^(n - 1)`, capped at `max_delay`.
    Exponential { max_delay: Duration },
}

/// Retry policy: attempt bound, backoff shape and optional jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts including the first try (minimum 1).
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    pub backoff: Backoff,
    /// Jitter factor (0.0-1.0) applied to each delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::connection()
    }
}

impl RetryPolicy {
    /// Policy for establishing a connection: 11 attempts, 3s, 5s, 8s, ...
    pub fn connection() -> Self {
        Self {
            max_attempts: 11,
            initial_delay: Duration::from_secs(3),
            backoff: Backoff::Fibonacci,
            jitter: 0.0,
        }
    }

    /// Policy for re-sending a command after its connection dropped.
    pub fn execution() -> Self {
        Self {
            max_attempts: 7,
            ..Self::connection()
        }
    }

    /// Policy for probing an expected disconnection.
    pub fn probe() -> Self {
        Self {
            max_attempts: 10,
            ..Self::connection()
        }
    }

    /// Fixed-interval polling policy.
    pub fn polling(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: interval,
            backoff: Backoff::Exponential {
                max_delay: interval,
            },
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = match self.backoff {
            Backoff::Fibonacci => {
                let mut previous = self.initial_delay.saturating_sub(Duration::from_secs(1));
                let mut current = self.initial_delay;
                for _ in 1..attempt {
                    let next = current.saturating_add(previous);
                    previous = current;
                    current = next;
                }
                current
            }
            Backoff::Exponential { max_delay } => {
                let multiplier = 2_u32.saturating_pow(attempt - 1);
                self.initial_delay.saturating_mul(multiplier).min(max_delay)
            }
        };

        if self.jitter > 0.0 && !base.is_zero() {
            let jitter = (fastrand::f64() * 2.0 - 1.0) * self.jitter;
            base.mul_f64((1.0 + jitter).max(0.0))
        } else {
            base
        }
    }

    /// Start a fresh retry loop for `phase`.
    pub fn start(&self, phase: impl Into<String>) -> RetryState {
        RetryState {
            phase: phase.into(),
            policy: self.clone(),
            attempt: 1,
        }
    }
}

/// Stepper for a single retry loop.
///
/// ```ignore
/// let mut retry = policy.start("connect");
/// loop {
///     match transport.open(address).await {
///         Ok(()) => break,
///         Err(err) => retry.backoff(err).await?,
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RetryState {
    phase: String,
    policy: RetryPolicy,
    attempt: u32,
}

impl RetryState {
    /// The attempt currently in flight (1-based).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts()
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_attempts()
    }

    /// Account for a failed attempt.
    ///
    /// Sleeps and returns `Ok(())` when the error is retryable and attempts
    /// remain; otherwise hands the error back.
    pub async fn backoff<E>(&mut self, err: E) -> Result<(), E>
    where
        E: RetryableError + std::fmt::Display,
    {
        if !err.is_retryable() {
            warn!(phase = %self.phase, attempt = self.attempt, error = %err, "attempt failed (non-retryable)");
            return Err(err);
        }
        if self.is_exhausted() {
            warn!(
                phase = %self.phase,
                attempt = self.attempt,
                error = %err,
                "attempt failed, retries exhausted"
            );
            return Err(err);
        }

        let delay = self.policy.backoff_delay(self.attempt);
        warn!(
            phase = %self.phase,
            attempt = self.attempt,
            max_attempts = self.policy.max_attempts(),
            error = %err,
            "attempt failed (retryable)"
        );
        debug!(
            phase = %self.phase,
            attempt = self.attempt,
            delay_secs = delay.as_secs_f64(),
            "retrying after backoff"
        );
        sleep(delay).await;
        self.attempt += 1;
        Ok(())
    }

    /// Sleep before the next round when there is no error to classify
    /// (polling loops). Returns `false` once attempts are exhausted.
    pub async fn wait(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        let delay = self.policy.backoff_delay(self.attempt);
        debug!(
            phase = %self.phase,
            attempt = self.attempt,
            delay_secs = delay.as_secs_f64(),
            "waiting before next round"
        );
        sleep(delay).await;
        self.attempt += 1;
        true
    }
}

/// Run an async operation with retries on retryable errors.
pub async fn run_with_retry<F, Fut, T, E>(phase: &str, policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let mut state = policy.start(phase);

    loop {
        debug!(phase, attempt = state.attempt(), "starting attempt");

        match op().await {
            Ok(value) => {
                info!(phase, attempt = state.attempt(), "attempt succeeded");
                return Ok(value);
            }
            Err(err) => state.backoff(err).await?,
        }
    }
}
