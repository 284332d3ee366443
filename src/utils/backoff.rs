//! Exponential backoff for transient backend failures
//!
//! Delays double from the base up to the 30 second cap from the error
//! handling design. Used by the search bulk flusher, incident actions,
//! and store writes.

use crate::utils::error::EngineResult;
use std::future::Future;
use std::time::Duration;

/// Backoff policy: `base * 2^attempt`, capped
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self { base, cap, max_attempts }
    }

    /// Delay before the given retry attempt (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        exp.min(self.cap)
    }

    /// Run `op`, retrying transient failures with increasing delay.
    ///
    /// Non-transient errors (validation, fatal, policy) are returned
    /// immediately without retrying.
    pub async fn retry<T, F, Fut>(&self, name: &str, mut op: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        "'{}' failed (attempt {}/{}), retrying in {:?}: {}",
                        name,
                        attempt + 1,
                        self.max_attempts,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Convenience wrapper with default policy
pub async fn retry_transient<T, F, Fut>(name: &str, op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    Backoff::default().retry(name, op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::EngineError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_caps_at_thirty_seconds() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(10), Duration::from_secs(30));
        assert_eq!(backoff.delay(30), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 5);

        let counter = Arc::clone(&calls);
        let result = backoff
            .retry("test-op", move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(EngineError::transient("relational", "down"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.ok(), Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 5);

        let counter = Arc::clone(&calls);
        let result: EngineResult<()> = backoff
            .retry("test-op", move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::fatal("search", "bad mapping"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
