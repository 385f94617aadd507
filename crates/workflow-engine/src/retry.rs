//! Retry strategy: exponential backoff with jitter, a cap, and a
//! non-retryable short-circuit, with cooperative cancellation.

use common::types::RetryPolicyConfig;
use common::Classification;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::classifier;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    Succeeded(T),
    /// The cancellation token fired while waiting between attempts.
    Cancelled,
}

/// Computes the backoff delay for 0-indexed attempt `n`:
/// `min(InitialBackoff * BackoffMultiplier^n, MaxBackoff)`, optionally
/// scaled by a uniform jitter factor in `[0.75, 1.25]`.
pub fn backoff_for_attempt(policy: &RetryPolicyConfig, attempt: u32) -> Duration {
    let base_ms = policy.initial_backoff_ms as f64 * policy.backoff_multiplier.powi(attempt as i32);
    let capped_ms = base_ms.min(policy.max_backoff_ms as f64);
    let final_ms = if policy.jitter {
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        capped_ms * factor
    } else {
        capped_ms
    };
    Duration::from_millis(final_ms.max(0.0) as u64)
}

/// Run `f` up to `1 + policy.max_retries` times, waiting the computed
/// backoff delay between attempts. On a permanent (non-retryable) error,
/// returns immediately. If `cancel` fires while waiting between attempts,
/// returns `Ok(RetryOutcome::Cancelled)` instead of the last error.
pub async fn execute<F, Fut, T, E>(
    policy: &RetryPolicyConfig,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<RetryOutcome<T>, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + 'static,
{
    let max_attempts = policy.max_retries + 1;
    let mut attempt = 0;

    loop {
        match f(attempt).await {
            Ok(value) => return Ok(RetryOutcome::Succeeded(value)),
            Err(err) => {
                let classification = classifier::classify(&err);
                let retryable = classification == Classification::Transient
                    && attempt + 1 < max_attempts;
                if !retryable {
                    return Err(err);
                }

                let delay = backoff_for_attempt(policy, attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Ok(RetryOutcome::Cancelled),
                }

                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter_policy(max_retries: u32) -> RetryPolicyConfig {
        RetryPolicyConfig {
            max_retries,
            initial_backoff_ms: 10,
            max_backoff_ms: 1000,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = no_jitter_policy(5);
        assert_eq!(backoff_for_attempt(&policy, 0), Duration::from_millis(10));
        assert_eq!(backoff_for_attempt(&policy, 1), Duration::from_millis(20));
        assert_eq!(backoff_for_attempt(&policy, 2), Duration::from_millis(40));

        let capped = RetryPolicyConfig { max_backoff_ms: 25, ..no_jitter_policy(5) };
        assert_eq!(backoff_for_attempt(&capped, 3), Duration::from_millis(25));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicyConfig { jitter: true, ..no_jitter_policy(5) };
        for attempt in 0..4 {
            let base = 10.0 * 2f64.powi(attempt as i32);
            let delay = backoff_for_attempt(&policy, attempt).as_millis() as f64;
            assert!(delay >= base * 0.75 - 1.0 && delay <= base * 1.25 + 1.0, "attempt {attempt}: {delay}");
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct StrError(String);

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = no_jitter_policy(3);
        let cancel = CancellationToken::new();

        let calls2 = calls.clone();
        let result = execute(&policy, &cancel, move |_attempt| {
            let calls = calls2.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(StrError("rate limit exceeded".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, RetryOutcome::Succeeded(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_short_circuits() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = no_jitter_policy(5);
        let cancel = CancellationToken::new();

        let calls2 = calls.clone();
        let result: Result<RetryOutcome<i32>, StrError> =
            execute(&policy, &cancel, move |_| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StrError("unauthorized".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_returns_last_error() {
        let policy = no_jitter_policy(2);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<RetryOutcome<i32>, StrError> =
            execute(&policy, &cancel, move |_| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StrError("service unavailable".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3); // initial + 2 retries
    }

    #[tokio::test]
    async fn cancellation_aborts_wait_between_attempts() {
        let policy = RetryPolicyConfig { initial_backoff_ms: 5_000, ..no_jitter_policy(3) };
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel2.cancel();
        });

        let result: Result<RetryOutcome<i32>, StrError> = execute(&policy, &cancel, |_| async {
            Err(StrError("timeout".to_string()))
        })
        .await;

        assert_eq!(result.unwrap(), RetryOutcome::Cancelled);
    }
}
