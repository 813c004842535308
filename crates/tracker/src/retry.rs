//! Fixed-delay retries for chain queries.

use std::{fmt::Display, future::Future, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::TrackerConfig;

/// How often and how long to retry a failed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    pub(crate) max_retries: usize,
    pub(crate) sleep: Duration,
}

impl From<&TrackerConfig> for RetryPolicy {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            max_retries: config.max_retry_times,
            sleep: config.retry_sleep,
        }
    }
}

/// Runs `op` until it succeeds, the retries are exhausted or `cancel` fires.
///
/// The last error is returned on failure.
pub(crate) async fn retry<A, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<A, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<A, E>>,
    E: Display,
{
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries && !cancel.is_cancelled() => {
                attempt += 1;
                warn!(%e, %what, %attempt, "request failed, retrying");

                tokio::select! {
                    _ = cancel.cancelled() => return Err(e),
                    _ = tokio::time::sleep(policy.sleep) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}
