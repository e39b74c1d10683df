use std::future::Future;
use std::time::Duration;

use crate::errors::AgentError;

/// Bounded retry that only re-attempts on a timeout signal.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails with a non-timeout error, or the
    /// attempts are used up. Non-timeout failures propagate immediately.
    pub async fn retry_on_timeout<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, AgentError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            tracing::debug!(operation, attempt, max_attempts, "Calling agent");
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_timeout() && attempt < max_attempts => {
                    tracing::warn!(
                        operation,
                        attempt,
                        backoff_secs = self.backoff.as_secs(),
                        "Agent timed out, retrying"
                    );
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
