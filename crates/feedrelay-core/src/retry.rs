//! Retry-with-exponential-backoff around any fallible async operation

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::{RelayError, Result};

/// Failure returned by [`RetryPolicy::run`]. Every variant except
/// `Cancelled` carries the operation's own error unchanged.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempt(s): {error}")]
    Exhausted { attempts: u32, error: E },

    #[error("non-retryable failure on attempt {attempt}: {error}")]
    Rejected { attempt: u32, error: E },

    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    /// Number of times the operation actually ran.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Rejected { attempt, .. } => *attempt,
            RetryError::Cancelled { attempts } => *attempts,
        }
    }

    /// The last error produced by the operation, if it ran at all.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::Rejected { error, .. } => Some(error),
            RetryError::Cancelled { .. } => None,
        }
    }
}

type Predicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Attempt/backoff contract shared by every retried call site.
pub struct RetryPolicy<E> {
    max_attempts: u32,
    initial_delay: Duration,
    backoff_multiplier: f64,
    retryable: Predicate<E>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            initial_delay: self.initial_delay,
            backoff_multiplier: self.backoff_multiplier,
            retryable: self.retryable.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .finish()
    }
}

impl<E: fmt::Display> RetryPolicy<E> {
    /// Every failure is retryable until [`with_predicate`](Self::with_predicate)
    /// says otherwise.
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_multiplier: f64) -> Result<Self> {
        if max_attempts < 1 {
            return Err(RelayError::Validation("retry max_attempts must be at least 1".into()));
        }
        if initial_delay.is_zero() {
            return Err(RelayError::Validation("retry initial delay must be positive".into()));
        }
        if !(backoff_multiplier >= 1.0) || !backoff_multiplier.is_finite() {
            return Err(RelayError::Validation(format!(
                "retry backoff multiplier must be >= 1, got {}",
                backoff_multiplier
            )));
        }

        Ok(Self {
            max_attempts,
            initial_delay,
            backoff_multiplier,
            retryable: Arc::new(|_| true),
        })
    }

    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay slept after the given failed attempt (1-based).
    /// Saturates at `Duration::MAX`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        scale(self.initial_delay, self.backoff_multiplier.powi(exponent))
    }

    /// Run `op` until it succeeds, fails non-retryably, runs out of attempts,
    /// or `token` is cancelled.
    ///
    /// Cancellation is checked before each attempt and raced against each
    /// backoff sleep; an attempt already in flight is left to the operation's
    /// own timeout.
    pub async fn run<T, F, Fut>(&self, token: &CancellationToken, mut op: F) -> std::result::Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut delay = self.initial_delay;
        let mut attempt = 0;

        loop {
            if token.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }

            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !(self.retryable)(&err) {
                return Err(RetryError::Rejected { attempt, error: err });
            }

            if attempt >= self.max_attempts {
                error!("Operation failed after {} attempts: {}", attempt, err);
                return Err(RetryError::Exhausted { attempts: attempt, error: err });
            }

            warn!(
                "Attempt {}/{} failed: {}. Retrying in {:.1}s...",
                attempt,
                self.max_attempts,
                err,
                delay.as_secs_f64()
            );

            tokio::select! {
                _ = token.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = scale(delay, self.backoff_multiplier);
        }
    }
}

fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}
