//! Bounded exponential backoff for transient failures inside mutation
//! critical sections.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy: attempt count, base delay, and growth factor.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub factor: f64,
}

impl RetryPolicy {
    /// The store/bus mutation policy: 15 attempts, 250 ms base, factor 1.2.
    pub fn mutation() -> Self {
        RetryPolicy {
            attempts: 15,
            base: Duration::from_millis(250),
            factor: 1.2,
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let ms = self.base.as_millis() as f64 * self.factor.powi(attempt as i32);
        Duration::from_millis(ms as u64)
    }
}

/// Run `f` until it succeeds or the policy's attempts are exhausted.
/// The last error is returned unchanged.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, label: &str, mut f: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.attempts {
                    return Err(e);
                }
                let delay = policy.delay(attempt - 1);
                warn!(label, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
