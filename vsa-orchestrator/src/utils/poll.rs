//! Bounded polling primitive.
//!
//! External state (job links, cleanup of CBT artifacts, metadata rows) shows
//! up asynchronously. Callers express "wait until this appears" with
//! [`poll_until`] instead of looping on errors.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use super::errors::{EngineError, Result};

/// Repeatedly run `check` until it yields `Some(value)`.
///
/// The check runs at least once. Errors from the check abort the wait
/// immediately; only `Ok(None)` means "not yet". When the budget is spent a
/// [`EngineError::Timeout`] naming `entity` is returned.
pub async fn poll_until<T, F, Fut>(
    entity: &str,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let started = Instant::now();
    let deadline = started + timeout;

    loop {
        if let Some(value) = check().await? {
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(EngineError::Timeout {
                entity: entity.to_string(),
                waited_secs: now.duration_since(started).as_secs(),
            });
        }

        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
