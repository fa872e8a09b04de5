//! Named retry policies for collaborator calls.

use std::future::Future;
use std::time::Duration;

use crate::errors::AppError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub name: &'static str,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
}

/// Search-provider calls.
pub const SOURCING: RetryPolicy = RetryPolicy {
    name: "sourcing",
    max_attempts: 3,
    initial_backoff: Duration::from_secs(2),
    multiplier: 2.0,
};

/// Crawl and scrape calls.
pub const CONTENT_FETCH: RetryPolicy = RetryPolicy {
    name: "content_fetch",
    max_attempts: 4,
    initial_backoff: Duration::from_secs(1),
    multiplier: 2.0,
};

/// LLM generation calls.
pub const AI_GENERATION: RetryPolicy = RetryPolicy {
    name: "ai_generation",
    max_attempts: 3,
    initial_backoff: Duration::from_secs(3),
    multiplier: 2.0,
};

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt as i32);
        self.initial_backoff.mul_f64(factor)
    }

    /// Same policy without any waiting between attempts.
    pub fn without_backoff(self) -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            ..self
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are exhausted. The last error is returned unchanged.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    tracing::warn!(
                        "⚠ {} failed (attempt {}/{}, policy {}): {}. Retrying in {:?}",
                        operation,
                        attempt + 1,
                        attempts,
                        self.name,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::error!(
                            "✗ {} failed after {} attempts (policy {}): {}",
                            operation,
                            attempts,
                            self.name,
                            e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// The three policies used by the workflow, overridable for tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicies {
    pub sourcing: RetryPolicy,
    pub content_fetch: RetryPolicy,
    pub ai_generation: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            sourcing: SOURCING,
            content_fetch: CONTENT_FETCH,
            ai_generation: AI_GENERATION,
        }
    }
}

impl RetryPolicies {
    pub fn without_backoff() -> Self {
        Self {
            sourcing: SOURCING.without_backoff(),
            content_fetch: CONTENT_FETCH.without_backoff(),
            ai_generation: AI_GENERATION.without_backoff(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_exponentially() {
        assert_eq!(CONTENT_FETCH.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(CONTENT_FETCH.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(CONTENT_FETCH.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(
            SOURCING.without_backoff().delay_for_attempt(2),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = CONTENT_FETCH.without_backoff();

        let result = policy
            .run("fetch page", move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(AppError::ExternalApiError("503".into()))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = SOURCING.without_backoff();

        let result: Result<(), AppError> = policy
            .run("search", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AppError::ExternalApiError("timeout".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), SOURCING.max_attempts);
    }

    #[tokio::test]
    async fn does_not_retry_business_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), AppError> = AI_GENERATION
            .without_backoff()
            .run("dossier", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AppError::SchemaError("gaps: too few".into()))
            })
            .await;

        assert!(matches!(result, Err(AppError::SchemaError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
