use std::future::Future;
use std::time::Duration;

use drivesync_core::RemoteError;
use log::warn;

use super::backoff::Backoff;
use crate::status::StatusSink;

pub const MAX_ATTEMPTS: u32 = 3;
pub const BASE_DELAY: Duration = Duration::from_millis(1000);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Runs a remote mutation with bounded exponential backoff.
///
/// Authorization failures and not-found responses return immediately: the
/// first needs new credentials, the second is handled by the caller (a
/// delete of something already gone is a success). Everything else retries
/// up to [`MAX_ATTEMPTS`] with delays of 1000 ms doubling per attempt, each
/// retry reported to the status sink.
pub async fn with_retry<T, F, Fut>(
    status: &StatusSink,
    label: &str,
    mut op: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let backoff = Backoff::new(BASE_DELAY, MAX_DELAY, false);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_auth() || err.is_not_found() => return Err(err),
            Err(err) if attempt >= MAX_ATTEMPTS => {
                warn!("{label} failed after {attempt} attempts: {err}");
                return Err(err);
            }
            Err(err) => {
                let delay = backoff.delay(attempt - 1);
                status.warning(format!(
                    "{label} failed (attempt {attempt}/{MAX_ATTEMPTS}), retrying in {}ms: {err}",
                    delay.as_millis()
                ));
                tokio::time::sleep(delay).await;
            }
        }
    }
}
