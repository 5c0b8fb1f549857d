//! Bounded retry loop shared by both wire protocols.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::LlmError;

/// Retry configuration for LLM calls.
///
/// Rate limits wait for the provider's `Retry-After` when one is given.
/// Server errors and transport failures back off exponentially:
/// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given 1-indexed failed attempt.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before retrying after `error` on the given attempt.
    pub fn delay_for(&self, error: &LlmError, attempt: u32) -> Duration {
        match error {
            LlmError::RateLimited {
                retry_after: Some(after),
                ..
            } => (*after).min(self.max_delay),
            _ => self.backoff_delay(attempt),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt bound is reached. The last error is returned unchanged.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    provider: &str,
    mut op: F,
) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt >= max_attempts => return Err(e),
            Err(e) => {
                let delay = policy.delay_for(&e, attempt);
                warn!(
                    provider,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    kind = %e.kind(),
                    error = %e,
                    "LLM call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;
    use crate::error::LlmErrorKind;

    fn server_error() -> LlmError {
        LlmError::Api {
            provider: "test".into(),
            status: 503,
            reason: "unavailable".into(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(p.backoff_delay(1), Duration::from_millis(500));
        assert_eq!(p.backoff_delay(2), Duration::from_millis(1000));
        assert_eq!(p.backoff_delay(3), Duration::from_millis(2000));
        assert_eq!(p.backoff_delay(4), Duration::from_secs(3));
        assert_eq!(p.backoff_delay(40), Duration::from_secs(3));
    }

    #[test]
    fn rate_limit_uses_retry_after() {
        let p = policy();
        let limited = LlmError::RateLimited {
            provider: "test".into(),
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(p.delay_for(&limited, 1), Duration::from_secs(7));

        let no_hint = LlmError::RateLimited {
            provider: "test".into(),
            retry_after: None,
        };
        assert_eq!(p.delay_for(&no_hint, 2), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_server_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = Arc::clone(&calls);
        let result = with_retry(&policy(), "test", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(server_error())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = with_retry(&policy(), "test", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::Timeout {
                    provider: "test".into(),
                    reason: "connection reset".into(),
                })
            }
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), LlmErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn never_retries_invalid_request_or_empty_response() {
        for error in [
            LlmError::InvalidRequest {
                provider: "test".into(),
                status: 400,
                reason: "bad".into(),
            },
            LlmError::EmptyResponse {
                provider: "test".into(),
                reason: "no content".into(),
            },
        ] {
            let kind = error.kind();
            let mut slot = Some(error);
            let calls = Arc::new(AtomicU32::new(0));
            let counter = Arc::clone(&calls);
            let result: Result<(), _> = with_retry(&policy(), "test", || {
                counter.fetch_add(1, Ordering::SeqCst);
                let err = slot.take().unwrap_or_else(server_error);
                async move { Err(err) }
            })
            .await;

            assert_eq!(result.unwrap_err().kind(), kind);
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }
}
