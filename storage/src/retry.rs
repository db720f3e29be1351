use std::time::Duration;

use futures::future::BoxFuture;
use log::warn;

use crate::StorageError;

/// Maximum number of attempts for a retried storage operation.
pub const MAX_RETRIES: u32 = 7;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Runs `op` until it succeeds, it fails with a non-transient error, or
/// `MAX_RETRIES` attempts are exhausted. Backoff doubles per attempt.
pub async fn with_retries<'a, T>(
    what: &str,
    mut op: impl FnMut() -> BoxFuture<'a, Result<T, StorageError>>,
) -> Result<T, StorageError> {
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < MAX_RETRIES => {
                let delay = backoff_delay(attempt);
                warn!(
                    "{what}: attempt {} failed ({err}), retrying in {:?}",
                    attempt + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_BASE
        .checked_mul(1 << attempt.min(16))
        .map(|d| d.min(BACKOFF_CAP))
        .unwrap_or(BACKOFF_CAP)
}
