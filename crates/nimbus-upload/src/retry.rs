//! Timeouts, bounded retry, and the outage circuit breaker.

use std::future::Future;
use std::time::Duration;

use nimbus_core::config::{NetworkConfig, UploaderConfig};
use nimbus_core::{NimbusError, NimbusResult};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Attempt `n` (1-based) waits `n * backoff` before retrying.
    pub backoff: Duration,
}

impl From<&UploaderConfig> for RetryPolicy {
    fn from(c: &UploaderConfig) -> Self {
        Self {
            max_retries: c.max_retries,
            backoff: Duration::from_millis(c.retry_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Revision creation, listing, commit, verification data
    pub request: Duration,
    /// One block PUT or GET
    pub block: Duration,
}

impl From<&NetworkConfig> for Timeouts {
    fn from(c: &NetworkConfig) -> Self {
        Self {
            request: Duration::from_secs(c.request_timeout_secs),
            block: Duration::from_secs(c.block_timeout_secs),
        }
    }
}

/// Run `fut` with a deadline. Expiry is a transient error.
pub async fn with_timeout<T>(
    limit: Duration,
    what: &str,
    fut: impl Future<Output = NimbusResult<T>>,
) -> NimbusResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(NimbusError::transient(format!(
            "{what} timed out after {limit:?}"
        ))),
    }
}

/// Retry retryable failures up to `policy.max_retries` times.
/// Cancellation aborts the in-flight attempt and any backoff sleep.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut attempt: F,
) -> NimbusResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = NimbusResult<T>>,
{
    let mut retries = 0;
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NimbusError::Canceled),
            r = attempt() => r,
        };
        match result {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && retries < policy.max_retries => {
                retries += 1;
                tracing::warn!(what, retry = retries, error = %e, "retrying after transient failure");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(NimbusError::Canceled),
                    _ = tokio::time::sleep(policy.backoff * retries) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// After a server outage, new uploads hold off until the cooldown ends.
#[derive(Debug)]
pub struct CircuitBreaker {
    cooldown: Duration,
    open_until: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            open_until: Mutex::new(None),
        }
    }

    pub fn trip(&self) {
        let until = Instant::now() + self.cooldown;
        *self.open_until.lock() = Some(until);
        tracing::warn!(cooldown = ?self.cooldown, "server outage: suspending new uploads");
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.open_until.lock(), Some(until) if until > Instant::now())
    }

    /// Wait until the breaker is closed (or `cancel` fires).
    pub async fn wait_closed(&self, cancel: &CancellationToken) -> NimbusResult<()> {
        loop {
            let until = *self.open_until.lock();
            match until {
                Some(until) if until > Instant::now() => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(NimbusError::Canceled),
                        _ = tokio::time::sleep_until(until) => {}
                    }
                }
                _ => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let res = with_retry(fast(), &CancellationToken::new(), "op", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(NimbusError::transient("flaky"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(res.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let res: NimbusResult<()> = with_retry(fast(), &CancellationToken::new(), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(NimbusError::transient("down"))
        })
        .await;
        assert!(matches!(res, Err(NimbusError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let res: NimbusResult<()> = with_retry(fast(), &CancellationToken::new(), "op", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(NimbusError::Validation(
                nimbus_core::ValidationError::QuotaExceeded,
            ))
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_interrupts_attempt() {
        let token = CancellationToken::new();
        token.cancel();
        let res: NimbusResult<()> =
            with_retry(fast(), &token, "op", || std::future::pending()).await;
        assert!(matches!(res, Err(NimbusError::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_transient() {
        let res: NimbusResult<()> =
            with_timeout(Duration::from_secs(1), "put", std::future::pending()).await;
        let err = res.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("put timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_holds_until_cooldown() {
        let breaker = CircuitBreaker::new(Duration::from_secs(60));
        assert!(!breaker.is_open());
        breaker.trip();
        assert!(breaker.is_open());

        let start = Instant::now();
        breaker.wait_closed(&CancellationToken::new()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(!breaker.is_open());
    }
}
