use std::{future::Future, time::Duration};

use anyhow::{Result, anyhow};
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::constants::{INITIAL_RETRY_BACKOFF, MAX_RETRY_BACKOFF};

/// Run `operation` until it succeeds or `timeout` has elapsed, backing off exponentially between attempts.
///
/// The operation is always attempted at least once. When the deadline passes, the error from the final attempt is
/// returned with the number of attempts attached as context.
pub async fn with_retries<T, F, Fut>(name: &str, timeout: Duration, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + timeout;
    let mut backoff = INITIAL_RETRY_BACKOFF;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let now = Instant::now();
        if now >= deadline {
            return Err(error.context(format!("{name} failed after {attempts} attempts")));
        }
        debug!(name, attempts, "retrying after error: {error:#}");
        sleep(backoff.min(deadline - now)).await;
        backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
    }
}

/// Run a single RPC call against `endpoint`, failing if it takes longer than `timeout`.
pub async fn timed<T, E>(
    endpoint: &str,
    timeout: Duration,
    call: impl Future<Output = Result<T, E>>,
) -> Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    Ok(tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| anyhow!("request to {endpoint} timed out after {timeout:?}"))??)
}
