#![forbid(unsafe_code)]

use std::time::Duration;

use crate::backend::BackendError;

/// Total attempts per operation (1 initial + 2 retries).
pub const MAX_ATTEMPTS: u32 = 3;

const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Failure text fragments treated as transient. Anything outside this set
/// (and the retryable status codes) surfaces to the caller unretried.
const TRANSIENT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "network unreachable",
    "temporary failure",
    "rate limit",
];

const RETRYABLE_STATUS: &[u16] = &[429, 502, 503, 504];

#[must_use]
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}

#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS.contains(&status)
}

/// Delay before retry number `attempt` (1-based): 2 s, 4 s, 8 s, 16 s,
/// capped at 30 s.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = BACKOFF_BASE * 2u32.pow(exp);
    delay.min(BACKOFF_CAP)
}

pub async fn with_retry<T, F, Fut>(op: &str, mut call: F) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                tracing::warn!(
                    op,
                    attempt,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "transient backend failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_schedule_doubles_then_caps() {
        let secs: Vec<u64> = (1..=6).map(|a| backoff_delay(a).as_secs()).collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn transient_set_is_closed() {
        for msg in [
            "operation timed out",
            "Connection refused (os error 111)",
            "connection reset by peer",
            "network unreachable",
            "Temporary failure in name resolution",
            "rate limit exceeded",
        ] {
            assert!(is_transient_message(msg), "should retry: {msg}");
        }
        for msg in ["invalid api key", "not found", "bad request body"] {
            assert!(!is_transient_message(msg), "should not retry: {msg}");
        }
    }

    #[test]
    fn retryable_status_codes() {
        for status in [429u16, 502, 503, 504] {
            assert!(is_retryable_status(status));
        }
        for status in [400u16, 401, 403, 404, 500] {
            assert!(!is_retryable_status(status));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_up_to_attempt_cap() {
        let calls = AtomicU32::new(0);
        let result: Result<(), BackendError> = with_retry("poll", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Timeout)
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_auth_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<(), BackendError> = with_retry("claim", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Auth)
        })
        .await;
        assert!(matches!(result, Err(BackendError::Auth)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry("poll", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(BackendError::Timeout)
            } else {
                Ok(42u32)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
