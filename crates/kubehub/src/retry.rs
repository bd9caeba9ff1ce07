use std::future::Future;
use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use ksync_core::config::RetryConfig;
use ksync_core::{SyncError, SyncResult};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Exponential backoff without an elapsed-time cap: transient failures are
/// retried until they succeed or the surrounding token is cancelled.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self::from(&RetryConfig::default()) }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(c: &RetryConfig) -> Self {
        Self {
            initial: Duration::from_millis(c.initial_interval_ms),
            max: Duration::from_millis(c.max_interval_ms),
            multiplier: c.multiplier,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial)
            .with_max_interval(self.max)
            .with_multiplier(self.multiplier)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Run `op` until it succeeds or fails permanently (see [`SyncError::is_permanent`]).
/// Returns [`SyncError::Cancelled`] once `cancel` fires.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, cancel: &CancellationToken, what: &'static str, mut op: F) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let attempt = backoff::future::retry_notify(
        policy.backoff(),
        || {
            let fut = op();
            async move {
                fut.await.map_err(|e| if e.is_permanent() { backoff::Error::permanent(e) } else { backoff::Error::transient(e) })
            }
        },
        |err: SyncError, after: Duration| {
            counter!("ksync_retries_total", 1u64, "op" => what);
            warn!(op = what, error = %err, retry_in_ms = after.as_millis() as u64, "transient failure; retrying");
        },
    );
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        res = attempt => res,
    }
}
