//! Exponential backoff for transient backend failures.

use std::future::Future;
use std::time::Duration;
use tabvault_backend::ErrorClass;

/// Delays of `base, 2 * base, 4 * base, ...` for at most `max_retries` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max_retries: u32,
    retries: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max_retries,
            retries: 0,
        }
    }

    /// The delay before the next retry, or `None` once retries are used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.max_retries {
            return None;
        }
        let delay = self.base.saturating_mul(2u32.saturating_pow(self.retries));
        self.retries += 1;
        Some(delay)
    }

    /// Attempts made so far, counting the first one
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }
}

/// A call that failed for good, after `attempts` tries.
#[derive(Debug)]
pub struct RetryFailure {
    pub attempts: u32,
    pub source: tabvault_backend::Error,
}

/// Run `op` until it succeeds, fails with a non-transient error, or `backoff` runs out.
/// `on_retry` is told about every retry before its delay starts.
pub async fn retry<T, F, Fut>(
    mut backoff: Backoff,
    mut on_retry: impl FnMut(u32, Duration, &tabvault_backend::Error),
    mut op: F,
) -> Result<T, RetryFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = tabvault_backend::Result<T>>,
{
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(source) if source.class() == ErrorClass::Transient => {
                let attempts = backoff.attempts();
                match backoff.next_delay() {
                    Some(delay) => {
                        on_retry(attempts, delay, &source);
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(RetryFailure { attempts, source }),
                }
            }
            Err(source) => {
                return Err(RetryFailure {
                    attempts: backoff.attempts(),
                    source,
                });
            }
        }
    }
}
