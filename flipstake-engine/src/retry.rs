use crate::error::Result;
use flipstake_core::RetryPolicy;
use std::future::Future;
use tracing::warn;

/// Runs `op` until it succeeds, fails permanently, or the policy runs out.
///
/// Only [`crate::EngineError::TransientChain`] is retried. The delay doubles
/// after every attempt.
pub async fn with_backoff<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = policy.base_delay;
    let mut attempt = 1;

    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    what, attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            result => return result,
        }
    }
}
