//! Bounded retry with backoff, shared by the publisher (inline retries) and
//! the queue processor (retries across passes).

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base + step * (attempt - 1)`
    Linear { base: Duration, step: Duration },
}

impl Backoff {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Linear { base, step } => base + step * attempt.saturating_sub(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            backoff: Backoff::Fixed(delay),
        }
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// The predicate said the error is not worth retrying.
    Aborted(E),
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Aborted(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is reached. `op` receives the 1-based attempt number.
/// There is no sleep after the final attempt.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: RetryPolicy,
    is_retryable: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let started = Instant::now();
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if !is_retryable(&err) => return Err(RetryError::Aborted(err)),
            Err(err) if attempt >= max_attempts => {
                warn!(
                    attempts = attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %err,
                    "Retries exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            Err(err) => {
                let delay = policy.backoff.delay(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %err,
                    "Attempt failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// What to do with a queue entry whose publish just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to pending with `retry_count + 1`.
    Requeue,
    /// Terminal failure, `retry_count` stays as is.
    DeadLetter,
}

impl RetryDecision {
    pub fn for_failure(retry_count: i32, max_retries: i32) -> Self {
        if retry_count < max_retries {
            RetryDecision::Requeue
        } else {
            RetryDecision::DeadLetter
        }
    }
}
