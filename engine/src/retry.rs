//! Timeout and bounded retry around a single remote call.

use crate::{
    config::SyncConfig,
    error::Result,
    remote::{RemoteError, RemoteResult},
    Error,
};
use std::future::Future;
use tracing::warn;

/// Run `call` under the configured timeout, retrying transient failures.
///
/// Network errors and timeouts are retried up to `max_retries` extra times
/// with doubling backoff. Anything else is returned on the first attempt.
/// `table` and `id` give errors their record context.
pub(crate) async fn remote_call<T, F, Fut>(
    config: &SyncConfig,
    table: &str,
    id: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        let outcome = match tokio::time::timeout(config.remote_timeout(), call()).await {
            Ok(result) => result.map_err(|e: RemoteError| e.for_record(table, id)),
            Err(_) => Err(Error::Timeout(config.remote_timeout_ms)),
        };

        match outcome {
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                attempt += 1;
                let delay = config.retry_delay(attempt);
                warn!(
                    table,
                    id,
                    attempt,
                    "Remote call failed: {}, retrying after {:?}",
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}
