//! Bounded retry with jittered exponential backoff.
//!
//! A small reusable policy object parameterizing the access layer. Only
//! errors classified transient by [`LdapError::is_transient`] are retried;
//! bind rejections and missing entries fail on the first attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{LdapError, Result};

/// Retry policy: attempt bound plus backoff shape.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 3).
    pub max_attempts: u32,
    /// Delay before the first retry (default: 500ms).
    pub base_delay: Duration,
    /// Upper bound for any single backoff (default: 10s).
    pub max_delay: Duration,
    /// Exponential growth factor between retries (default: 2.0).
    pub multiplier: f64,
    /// Multiply each delay by a random factor in [0.5, 1.5].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (0-based), jitter applied.
    pub fn backoff(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.multiplier.powi(retry as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }

    /// Run `op`, retrying transient failures up to the attempt bound.
    ///
    /// The last error is returned once attempts are exhausted or a
    /// non-transient error is seen.
    pub async fn run<F, Fut, T>(&self, op_name: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt - 1);
                    debug!(
                        op = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried_to_bound() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy()
            .run("search", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LdapError::Connection {
                    target: "ldapi://sock".into(),
                    detail: "reset".into(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = policy()
            .run("bind", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LdapError::Auth {
                    code: 49,
                    hint: "invalid credentials".into(),
                })
            })
            .await;
        assert!(matches!(result, Err(LdapError::Auth { code: 49, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = policy()
            .run("search", || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(LdapError::Connection {
                        target: "t".into(),
                        detail: "timeout".into(),
                    })
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(10), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut p = policy();
        p.jitter = true;
        for retry in 0..6 {
            let d = p.backoff(retry);
            assert!(d <= p.max_delay);
            assert!(d >= p.base_delay / 2);
        }
    }
}
