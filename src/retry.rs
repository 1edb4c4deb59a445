//! Retry with exponential backoff.
//!
//! Network calls to the results source go through [`retry`]; only errors
//! the caller classifies as transient are retried.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff schedule between attempts, built from `[external.retry]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Upper bound on a single wait
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Backoff {
    /// Wait before retry number `retry` (0-based).
    fn wait(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(64) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Run `operation` until it succeeds, `should_retry` rejects the error, or
/// the retries run out. The last error is returned.
pub async fn retry<T, E, F, Fut, P>(
    backoff: &Backoff,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut retries = 0;
    loop {
        let err = match operation().await {
            Ok(result) => {
                if retries > 0 {
                    debug!("{} succeeded after {} retries", operation_name, retries);
                }
                return Ok(result);
            }
            Err(e) => e,
        };

        if !should_retry(&err) {
            debug!("{} failed with a non-retryable error: {}", operation_name, err);
            return Err(err);
        }
        if retries >= backoff.max_retries {
            warn!("{} gave up after {} retries: {}", operation_name, retries, err);
            return Err(err);
        }

        let wait = backoff.wait(retries);
        warn!(
            "{} failed (attempt {}/{}): {}. Retrying in {:?}",
            operation_name,
            retries + 1,
            backoff.max_retries + 1,
            err,
            wait
        );
        sleep(wait).await;
        retries += 1;
    }
}
