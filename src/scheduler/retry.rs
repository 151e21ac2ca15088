use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::error::AnalysisError;

/// Delay before retry number `attempt` (1-based)
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let base = policy.initial_delay().as_secs_f64() * policy.backoff_multiplier.powi(exponent);
    let mut delay = base.min(policy.max_delay().as_secs_f64());

    if policy.jitter {
        delay *= rand::thread_rng().gen_range(0.9..1.1);
    }

    Duration::from_secs_f64(delay.max(0.0))
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// exhausts `policy.max_attempts`. Returns the final outcome together with the
/// number of attempts made.
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    policy: &RetryPolicy,
    operation_name: &str,
) -> (Result<T, AnalysisError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AnalysisError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!("Attempting {} (attempt {}/{})", operation_name, attempt, max_attempts);

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!("{} succeeded after {} attempts", operation_name, attempt);
                }
                return (Ok(result), attempt);
            }
            Err(e) if !e.is_retryable() => {
                warn!("{} failed permanently: {}", operation_name, e);
                return (Err(e), attempt);
            }
            Err(e) if attempt >= max_attempts => {
                warn!("{} failed after {} attempts: {}", operation_name, attempt, e);
                return (Err(e), attempt);
            }
            Err(e) => {
                let delay = backoff_delay(policy, attempt);
                warn!(
                    "{} attempt {} failed: {}, retrying in {:?}",
                    operation_name, attempt, e, delay
                );
                sleep(delay).await;
            }
        }
    }
}
