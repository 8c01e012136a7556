use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::RestartHandle;
use super::WatchEvent;
use super::WatchResponse;
use super::WatchStream;
use crate::store::ResponseHeader;
use crate::Error;
use crate::Result;
use crate::WatchError;

pub type ForEachFn = Box<dyn FnMut(Vec<WatchEvent>, ResponseHeader, bool) + Send>;
pub type OnCreatedFn = Box<dyn Fn(&ResponseHeader) + Send + Sync>;
pub type OnRestartedFn = Box<dyn Fn(&str, Duration) + Send + Sync>;
pub type OnErrorFn = Box<dyn Fn(&Error) + Send + Sync>;
pub type OnCloseFn = Box<dyn Fn(&Error) + Send + Sync>;

/// Resolved exactly once: `Ok(())` when the watcher is created, or the
/// error which stopped the stream before that.
pub type InitReceiver = oneshot::Receiver<Result<()>>;

/// Dispatches a [`WatchStream`] to callbacks from one worker.
///
/// `for_each` receives the events of one revision, or the full state after a
/// restart. It is never called concurrently with itself.
pub struct WatchConsumer {
    stream: WatchStream,
    restart: RestartHandle,
    on_created: Vec<OnCreatedFn>,
    on_restarted: Vec<OnRestartedFn>,
    on_error: Vec<OnErrorFn>,
    on_close: Vec<OnCloseFn>,
    for_each: ForEachFn,
}

pub struct WatchConsumerBuilder {
    stream: WatchStream,
    on_created: Vec<OnCreatedFn>,
    on_restarted: Vec<OnRestartedFn>,
    on_error: Vec<OnErrorFn>,
    on_close: Vec<OnCloseFn>,
    for_each: Option<ForEachFn>,
}

impl WatchConsumer {
    pub fn builder(stream: WatchStream) -> WatchConsumerBuilder {
        WatchConsumerBuilder {
            stream,
            on_created: vec![],
            on_restarted: vec![],
            on_error: vec![],
            on_close: vec![],
            for_each: None,
        }
    }

    pub fn prefix(&self) -> &str {
        self.stream.prefix()
    }

    pub fn restart(
        &self,
        cause: impl Into<String>,
    ) {
        self.restart.restart(cause)
    }

    pub fn restart_handle(&self) -> RestartHandle {
        self.restart.clone()
    }

    /// Spawns the dispatch worker.
    pub fn start(
        self,
        tracker: &TaskTracker,
    ) -> InitReceiver {
        let (init_tx, init_rx) = oneshot::channel();
        tracker.spawn(self.dispatch(init_tx));
        init_rx
    }

    async fn dispatch(
        mut self,
        init_tx: oneshot::Sender<Result<()>>,
    ) {
        let prefix = self.stream.prefix().to_string();
        let threshold = self.stream.error_threshold();
        let mut init_tx = Some(init_tx);
        let mut last_error_at: Option<Instant> = None;

        while let Some(resp) = self.stream.recv().await {
            match resp {
                WatchResponse::InitErr(err) => {
                    error!(prefix = %prefix, "watch stream init failed: {err}");
                    for f in &self.on_close {
                        f(&err);
                    }
                    if let Some(tx) = init_tx.take() {
                        let _ = tx.send(Err(err));
                    }
                    return;
                }
                WatchResponse::Err(err) => {
                    let now = Instant::now();
                    if last_error_at.is_some_and(|at| now.duration_since(at) < threshold) {
                        error!(prefix = %prefix, "{err}");
                    } else {
                        warn!(prefix = %prefix, "{err}");
                    }
                    last_error_at = Some(now);
                    for f in &self.on_error {
                        f(&err);
                    }
                }
                WatchResponse::Closed(err) => {
                    error!(prefix = %prefix, "watch stream closed: {err}");
                    for f in &self.on_close {
                        f(&err);
                    }
                    if let Some(tx) = init_tx.take() {
                        let _ = tx.send(Err(err));
                    }
                    return;
                }
                WatchResponse::Restarted { cause, delay } => {
                    info!(prefix = %prefix, "watch stream consumer restarted: {cause}");
                    for f in &self.on_restarted {
                        f(&cause, delay);
                    }
                }
                WatchResponse::Created { header } => {
                    info!(prefix = %prefix, revision = header.revision, "watch stream created");
                    for f in &self.on_created {
                        f(&header);
                    }
                    if let Some(tx) = init_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                WatchResponse::Events {
                    header,
                    events,
                    restart,
                } => {
                    debug!(
                        prefix = %prefix,
                        revision = header.revision,
                        restart,
                        events = events.len(),
                        "watch stream batch"
                    );
                    (self.for_each)(events, header, restart);
                }
            }
        }

        info!(prefix = %prefix, "watch stream consumer closed");
        let err = Error::Cancelled;
        for f in &self.on_close {
            f(&err);
        }
        if let Some(tx) = init_tx.take() {
            let _ = tx.send(Err(Error::Watch(WatchError::CancelledBeforeCreated)));
        }
    }
}

impl WatchConsumerBuilder {
    /// Called once, when the watcher is created for the first time.
    pub fn on_created(
        mut self,
        f: impl Fn(&ResponseHeader) + Send + Sync + 'static,
    ) -> Self {
        self.on_created.push(Box::new(f));
        self
    }

    /// Called before the full state is streamed again.
    pub fn on_restarted(
        mut self,
        f: impl Fn(&str, Duration) + Send + Sync + 'static,
    ) -> Self {
        self.on_restarted.push(Box::new(f));
        self
    }

    /// Called on every recoverable error.
    pub fn on_error(
        mut self,
        f: impl Fn(&Error) + Send + Sync + 'static,
    ) -> Self {
        self.on_error.push(Box::new(f));
        self
    }

    /// Called when the stream ends, with the terminal error of the stream or
    /// [`Error::Cancelled`] on a regular shutdown.
    pub fn on_close(
        mut self,
        f: impl Fn(&Error) + Send + Sync + 'static,
    ) -> Self {
        self.on_close.push(Box::new(f));
        self
    }

    pub fn for_each(
        mut self,
        f: impl FnMut(Vec<WatchEvent>, ResponseHeader, bool) + Send + 'static,
    ) -> Self {
        self.for_each = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Result<WatchConsumer> {
        let Some(for_each) = self.for_each else {
            return Err(WatchError::MissingForEach(self.stream.prefix().to_string()).into());
        };
        Ok(WatchConsumer {
            restart: self.stream.restart_handle(),
            stream: self.stream,
            on_created: self.on_created,
            on_restarted: self.on_restarted,
            on_error: self.on_error,
            on_close: self.on_close,
            for_each,
        })
    }
}
