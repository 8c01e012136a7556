use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::error;

use crate::Error;
use crate::Result;
use crate::StoreError;

/// Spawns a named background worker on the tracker.
///
/// Errors returned by the worker are logged, cancellation is not.
pub(crate) fn spawn_task<Fut>(
    name: &str,
    tracker: &TaskTracker,
    fut: Fut,
) -> JoinHandle<()>
where
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.to_string();
    tracker.spawn(async move {
        if let Err(e) = fut.await {
            if !e.is_cancelled() {
                error!("spawned task: {name} stopped or encountered an error: {:?}", e);
            }
        }
    })
}

/// Runs `fut` with a deadline, mapping expiry to [`StoreError::Timeout`].
pub(crate) async fn with_timeout<T, Fut>(
    duration: Duration,
    fut: Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(r) => r,
        Err(_) => Err(StoreError::Timeout(duration).into()),
    }
}

/// Runs `fut` until it completes or `cancel` fires.
pub(crate) async fn cancellable<T, Fut>(
    cancel: &CancellationToken,
    fut: Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        r = fut => r,
    }
}

/// Sleeps for `delay`, returns `false` if `cancel` fired first.
pub(crate) async fn sleep_or_cancel(
    cancel: &CancellationToken,
    delay: Duration,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
