//! Retry combinator for transient engine faults.
//!
//! Attempts run serially; between attempts the task sleeps for the policy's
//! backoff. Errors the predicate rejects, and the final error on
//! exhaustion, are returned to the caller unchanged.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `base * 2^(attempt-1)`, capped.
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    /// Delay to sleep after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { base, cap } => {
                let shift = attempt.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << shift).min(cap)
            }
        }
    }
}

/// A retry policy: how many attempts, and how long to wait between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// LLM backend calls: 3 retries, exponential 1 s / 2 s / 4 s.
    pub fn backend() -> Self {
        Self {
            max_attempts: 4,
            backoff: Backoff::Exponential {
                base: Duration::from_secs(1),
                cap: Duration::from_secs(30),
            },
        }
    }

    /// TTS synthesis: 2 retries, fixed 0.5 s.
    pub fn synthesis() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_millis(500)),
        }
    }

    /// STT subprocess: one retry after 0.5 s (covers engine cold start).
    pub fn transcription() -> Self {
        Self {
            max_attempts: 2,
            backoff: Backoff::Fixed(Duration::from_millis(500)),
        }
    }
}

/// Run `op` until it succeeds, the predicate rejects its error, or
/// `policy.max_attempts` is exhausted.
pub async fn with_retry<T, E, F, Fut, P>(policy: &RetryPolicy, mut op: F, retryable: P) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_attempts || !retryable(&err) {
                    return Err(err);
                }
                let delay = policy.backoff.delay(attempt);
                debug!(attempt, %err, ?delay, "retrying after failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_backoff_schedule() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(4));
        assert_eq!(backoff.delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_fixed_backoff_schedule() {
        let backoff = Backoff::Fixed(Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(7), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retry(
            &RetryPolicy::backend(),
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("failure {n}"))
                } else {
                    Ok(n)
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_retry(
            &RetryPolicy::synthesis(),
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("failure {n}"))
            },
            |_| true,
        )
        .await;
        assert_eq!(result.unwrap_err(), "failure 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_immediate() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = with_retry(
            &RetryPolicy::backend(),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("bad request")
            },
            |_| false,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
