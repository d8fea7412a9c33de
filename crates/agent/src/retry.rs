//! Retry executor for model calls.
//!
//! Bounded attempts with exponential backoff and a ceiling. Only transient
//! provider errors are retried; everything else fails on the first attempt.
//! Every attempt and every backoff sleep is raced against the caller's
//! cancellation token and deadline.

use std::future::Future;
use std::time::Duration;

use toolweave_config::RetryConfig;
use toolweave_core::{Error, InvocationContext, ProviderError, Result};
use tracing::{debug, warn};

/// Delay before retry number `retry` (1-based) after `err`.
///
/// A rate-limit hint raises the delay to at least the hinted value, still
/// capped by the policy ceiling.
pub fn backoff_delay(policy: &RetryConfig, retry: u32, err: &ProviderError) -> Duration {
    let delay = policy.backoff_for(retry);
    match err {
        ProviderError::RateLimited { retry_after_secs } => delay
            .max(Duration::from_secs(*retry_after_secs))
            .min(policy.max_backoff()),
        _ => delay,
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryConfig,
    ctx: &InvocationContext,
    label: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ProviderError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        ctx.check()?;

        let outcome = tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            outcome = op() => outcome,
        };

        let err = match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!(label, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            warn!(label, attempt, error = %err, "Non-retryable provider error");
            return Err(Error::Provider(err));
        }

        if attempt >= max_attempts {
            warn!(label, attempts = attempt, error = %err, "Retries exhausted");
            return Err(Error::RetriesExhausted {
                attempts: attempt,
                last: err,
            });
        }

        let delay = backoff_delay(policy, attempt, &err);
        warn!(
            label,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Provider call failed, retrying"
        );

        tokio::select! {
            biased;
            err = ctx.done() => return Err(err),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
        }
    }

    fn network() -> ProviderError {
        ProviderError::Network("connection reset".into())
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let out = retry_with_backoff(&policy(3), &InvocationContext::new(), "test", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(network())
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(out, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempts_and_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = retry_with_backoff(&policy(3), &InvocationContext::new(), "test", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(network()) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            Error::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(last, ProviderError::Network(_)));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = retry_with_backoff(&policy(5), &InvocationContext::new(), "test", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ProviderError::AuthenticationFailed("bad key".into())) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            err,
            Error::Provider(ProviderError::AuthenticationFailed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sleep_honors_cancellation() {
        let ctx = InvocationContext::new();
        let token = ctx.cancellation_token().clone();

        let handle = tokio::spawn(async move {
            retry_with_backoff(&policy(10), &ctx, "test", || async {
                Err::<(), _>(network())
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        token.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cuts_a_hanging_attempt() {
        let ctx = InvocationContext::new().with_timeout(Duration::from_secs(2));
        let err = retry_with_backoff(&policy(3), &ctx, "test", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, ProviderError>(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::DeadlineExceeded));
    }

    #[test]
    fn rate_limit_hint_raises_delay_up_to_ceiling() {
        let policy = policy(5);
        let hinted = ProviderError::RateLimited {
            retry_after_secs: 0,
        };
        assert_eq!(backoff_delay(&policy, 1, &hinted), Duration::from_millis(100));

        let long_hint = ProviderError::RateLimited {
            retry_after_secs: 30,
        };
        assert_eq!(
            backoff_delay(&policy, 1, &long_hint),
            Duration::from_millis(1_000)
        );

        let short_hint = ProviderError::RateLimited {
            retry_after_secs: 1,
        };
        assert_eq!(backoff_delay(&policy, 1, &short_hint), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(&policy, 2, &network()), Duration::from_millis(200));
    }
}
