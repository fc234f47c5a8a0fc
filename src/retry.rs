// 🔁 Retry Policy - Exponential backoff for transient provider failures
// A reusable value object plus a gated executor, so the policy is
// testable without any provider in the loop.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::warn;

use crate::error::ProviderError;

// ============================================================================
// RETRY POLICY
// ============================================================================

/// Max attempts, base delay, cap. Delay doubles per attempt and is
/// capped at `max_delay_ms`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt_index` failures (0-based).
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt_index).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Run `op` up to `policy.max_attempts` times, sleeping between
/// attempts. Only retryable errors re-enter the loop; auth and other
/// non-retryable failures surface immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err = None;

    for attempt in 0..attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    target: "ledger_recon::retry",
                    %err, label, attempt, delay_ms = delay.as_millis() as u64,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_err.expect("retry loop exits early unless a retryable error was seen"))
}

// ============================================================================
// REQUEST GATE
// ============================================================================

/// Bounds concurrent provider calls and enforces a minimum delay
/// between request starts, honoring upstream rate limits.
pub struct RequestGate {
    limit: Arc<Semaphore>,
    min_interval: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl RequestGate {
    pub fn new(max_concurrent: usize, min_interval: Duration) -> Self {
        RequestGate {
            limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
            min_interval,
            last_start: Mutex::new(None),
        }
    }

    /// Wait for a slot and for the inter-request interval, then hold
    /// the permit for the duration of the call.
    pub async fn admit(&self) -> tokio::sync::OwnedSemaphorePermit {
        let permit = self
            .limit
            .clone()
            .acquire_owned()
            .await
            .expect("gate semaphore is never closed");

        if !self.min_interval.is_zero() {
            let mut last = self.last_start.lock().await;
            if let Some(prev) = *last {
                let elapsed = prev.elapsed();
                if elapsed < self.min_interval {
                    tokio::time::sleep(self.min_interval - elapsed).await;
                }
            }
            *last = Some(Instant::now());
        }

        permit
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 350,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_after_transient_failures() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result = with_retry(&policy, "pull", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::transient("inbox", "timeout"))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 10,
        };
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&policy, "pull", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::transient("inbox", "still down")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(&policy, "pull", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::auth("ledger", "token expired")) }
        })
        .await;

        assert!(matches!(result, Err(ProviderError::Auth { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
