use crate::error::LiftError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

pub const BASE_RETRY_DELAY_MS: u64 = 1_000;
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Backoff before retry number `attempt` (zero based): `min(1000 * 2^attempt, 30000)` ms.
pub fn retry_delay(attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    let millis = BASE_RETRY_DELAY_MS
        .saturating_mul(factor)
        .min(MAX_RETRY_DELAY_MS);
    Duration::from_millis(millis)
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub attempts: u32,
    pub retry_on: fn(&LiftError) -> bool,
}

impl RetryPolicy {
    /// Queries retry network and server failures.
    pub fn query(attempts: u32) -> Self {
        Self {
            attempts,
            retry_on: LiftError::is_transient,
        }
    }

    /// Mutations only retry when the request never reached the server.
    pub fn mutation(attempts: u32) -> Self {
        Self {
            attempts,
            retry_on: LiftError::is_network,
        }
    }

    pub fn none() -> Self {
        Self {
            attempts: 0,
            retry_on: |_| false,
        }
    }
}

pub async fn run_with_retry<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, LiftError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LiftError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.attempts && (policy.retry_on)(&err) => {
                let delay = retry_delay(attempt);
                tracing::debug!(
                    operation = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %err,
                    "retrying after failure"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_auth() {
                    tracing::info!(operation = label, "request rejected as unauthenticated");
                } else {
                    tracing::warn!(operation = label, attempt, %err, "request failed");
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_is_capped_exponential() {
        let expected = [1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000];
        for (attempt, millis) in expected.iter().enumerate() {
            assert_eq!(retry_delay(attempt as u32), Duration::from_millis(*millis));
        }
        assert_eq!(retry_delay(u32::MAX), Duration::from_millis(MAX_RETRY_DELAY_MS));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_network_errors_up_to_budget() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = run_with_retry(RetryPolicy::query(2), "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(LiftError::network("offline"))
        })
        .await;
        assert!(matches!(result, Err(LiftError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_errors_short_circuit() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = run_with_retry(RetryPolicy::query(2), "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(LiftError::Auth("expired".into()))
        })
        .await;
        assert!(matches!(result, Err(LiftError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mutation_policy_skips_server_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = run_with_retry(RetryPolicy::mutation(1), "test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(LiftError::Server("500".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = run_with_retry(RetryPolicy::mutation(1), "test", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(LiftError::network("reset"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
    }
}
