//! Bounded exponential back-off for `Transient` cloud failures, per §6.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::CloudError;

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_millis(250);

/// Retry `f` up to `MAX_ATTEMPTS` times with jittered exponential
/// back-off, but only for errors where `is_retryable()` is true. Any
/// other error (or the final attempt's error) is returned immediately.
pub async fn with_retry<T, F, Fut>(mut f: F) -> Result<T, CloudError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CloudError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                let backoff = BASE_DELAY * 2u32.pow(attempt - 1);
                let jitter_ms = rand::thread_rng().gen_range(0..100);
                tokio::time::sleep(backoff + Duration::from_millis(jitter_ms)).await;
                tracing::debug!(attempt, ?e, "retrying after transient cloud error");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, CloudError> = with_retry(|| async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(CloudError::Transient("not yet".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_transient() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, CloudError> = with_retry(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CloudError::NotFound("gone".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
