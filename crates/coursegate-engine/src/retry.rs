//! Retry with jittered exponential backoff for transient store failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{EngineError, Result};

const BASE_DELAY: Duration = Duration::from_millis(50);
const MAX_ATTEMPTS: u32 = 3;

/// Run `op` until it succeeds, fails with a non-transient error, or
/// `MAX_ATTEMPTS` is reached. Only [`EngineError::StoreUnavailable`] is
/// retried here; conflicts need a fresh read and are handled by callers.
pub(crate) async fn with_backoff<T, F, Fut>(what: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(EngineError::StoreUnavailable(reason)) if attempt < MAX_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                debug!(what, attempt, ?delay, %reason, "store unavailable, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY * 2u32.pow(attempt - 1);
    let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
    exp + Duration::from_millis(jitter_ms)
}
