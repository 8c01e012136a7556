use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::trace;

use super::sort_revision_events;
use super::WatchEvent;
use super::WatchResponse;
use crate::metrics::CoordMetrics;
use crate::store::KvStore;
use crate::store::RangeOptions;
use crate::store::RawWatchResponse;
use crate::store::ResponseHeader;
use crate::store::Revision;
use crate::store::WatchOptions;
use crate::store::WatchReceiver;
use crate::utils::async_task::sleep_or_cancel;
use crate::utils::backoff::ExponentialBackoff;
use crate::Error;
use crate::StoreError;
use crate::WatchConfig;
use crate::WatchError;

#[derive(Debug, Clone, Default)]
pub struct WatchStreamOptions {
    /// Attach previous values to update and delete events
    pub prev_kv: bool,
    /// First revision of a plain `watch`, 0 means "from now"
    pub start_revision: Revision,
    pub config: WatchConfig,
    pub metrics: Option<CoordMetrics>,
}

/// Requests a restart of a running stream. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RestartHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl RestartHandle {
    /// Re-creates the watcher, the state is streamed again from the beginning.
    pub fn restart(
        &self,
        cause: impl Into<String>,
    ) {
        let _ = self.tx.send(cause.into());
    }
}

/// Receiving side of a resilient watch stream.
///
/// The stream ends when the cancellation token fires, when the first attempt
/// fails (after one [`WatchResponse::InitErr`]), after a terminal
/// [`WatchResponse::Closed`] or when the receiver is dropped.
#[derive(Debug)]
pub struct WatchStream {
    prefix: String,
    error_threshold: Duration,
    rx: mpsc::Receiver<WatchResponse>,
    restart: RestartHandle,
}

impl WatchStream {
    /// Watches changes in the prefix, without the initial state.
    ///
    /// A broken watcher is resumed at the revision after the last delivered
    /// one. If that revision has been compacted, the stream ends after the
    /// error, there is no state to restart from.
    pub fn watch(
        store: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        options: WatchStreamOptions,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self::spawn(Mode::WatchOnly, store, prefix.into(), options, tracker, cancel)
    }

    /// Loads all keys in the prefix at one revision, then watches for changes
    /// from the next revision.
    ///
    /// Any fatal error after the watcher was created triggers a restart: the
    /// stream emits [`WatchResponse::Restarted`] after the backoff delay and
    /// then the full current state as one batch with `restart = true`.
    pub fn get_all_and_watch(
        store: Arc<dyn KvStore>,
        prefix: impl Into<String>,
        options: WatchStreamOptions,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self::spawn(Mode::GetAllAndWatch, store, prefix.into(), options, tracker, cancel)
    }

    fn spawn(
        mode: Mode,
        store: Arc<dyn KvStore>,
        prefix: String,
        options: WatchStreamOptions,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(options.config.channel_capacity.max(1));
        let error_threshold = options.config.error_threshold();
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();

        let worker = StreamWorker {
            mode,
            store,
            prefix: prefix.clone(),
            backoff: ExponentialBackoff::new(options.config.restart_backoff),
            options,
            tx,
            restart_rx,
            cancel,
            created: false,
            last_revision: 0,
        };
        tracker.spawn(worker.run());

        Self {
            prefix,
            error_threshold,
            rx,
            restart: RestartHandle { tx: restart_tx },
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Two errors closer than this are logged as errors, otherwise as warnings.
    pub fn error_threshold(&self) -> Duration {
        self.error_threshold
    }

    /// Next message, `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<WatchResponse> {
        self.rx.recv().await
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
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    WatchOnly,
    GetAllAndWatch,
}

/// How one attempt of the load-then-watch sequence ended.
enum AttemptEnd {
    /// Cancellation token fired or the receiver was dropped
    Stopped,
    /// The attempt failed before the watcher was created
    InitFailed(Error),
    /// The established watcher broke or a restart was requested
    Interrupted {
        cause: String,
        manual: bool,
        compacted: Option<StoreError>,
    },
}

struct StreamWorker {
    mode: Mode,
    store: Arc<dyn KvStore>,
    prefix: String,
    options: WatchStreamOptions,
    backoff: ExponentialBackoff,
    tx: mpsc::Sender<WatchResponse>,
    restart_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
    /// `Created` was already emitted
    created: bool,
    /// Revision of the last delivered batch, resume point of `WatchOnly`
    last_revision: Revision,
}

impl StreamWorker {
    async fn run(mut self) {
        let mut restart = false;
        loop {
            let (cause, manual) = match self.attempt(restart).await {
                AttemptEnd::Stopped => return,
                AttemptEnd::InitFailed(err) => {
                    if err.is_cancelled() || self.cancel.is_cancelled() {
                        return;
                    }
                    if !self.created {
                        // Errors of the first attempt are not retried
                        let err = Error::Watch(WatchError::Init(Box::new(err)));
                        self.emit(WatchResponse::InitErr(err)).await;
                        return;
                    }
                    let cause = format!("watch init error: {err}");
                    let compacted = match &err {
                        Error::Store(e @ StoreError::Compacted { .. }) => Some(e.clone()),
                        _ => None,
                    };
                    self.record_error();
                    if !self.emit(WatchResponse::Err(err)).await {
                        return;
                    }
                    if let Some(compacted) = compacted {
                        if self.mode == Mode::WatchOnly {
                            self.close_compacted(compacted).await;
                            return;
                        }
                    }
                    (cause, false)
                }
                AttemptEnd::Interrupted {
                    cause,
                    manual,
                    compacted,
                } => {
                    if let Some(compacted) = compacted {
                        if self.mode == Mode::WatchOnly {
                            self.close_compacted(compacted).await;
                            return;
                        }
                    }
                    (cause, manual)
                }
            };

            let Some(delay) = self.backoff.next_backoff() else {
                error!(prefix = %self.prefix, "watch stream closed, restart retries exhausted: {cause}");
                self.emit(WatchResponse::Closed(WatchError::RetriesExhausted(cause).into()))
                    .await;
                return;
            };
            if !sleep_or_cancel(&self.cancel, delay).await {
                return;
            }

            let cause = if manual {
                cause
            } else {
                format!("unexpected restart, backoff delay {delay:?}, cause: {cause}")
            };
            debug!(prefix = %self.prefix, "watch stream restarting: {cause}");
            if let Some(m) = &self.options.metrics {
                m.watch_restarts.with_label_values(&[&self.prefix]).inc();
            }
            if !self.emit(WatchResponse::Restarted { cause, delay }).await {
                return;
            }
            restart = true;
        }
    }

    async fn attempt(
        &mut self,
        restart: bool,
    ) -> AttemptEnd {
        // Restart requests sent before this attempt are already satisfied
        while self.restart_rx.try_recv().is_ok() {}

        let (initial, start_revision) = match self.mode {
            Mode::GetAllAndWatch => match self.get_all().await {
                Ok((header, events)) => (Some((header, events)), header.revision + 1),
                Err(err) => return AttemptEnd::InitFailed(err),
            },
            Mode::WatchOnly if self.last_revision > 0 => (None, self.last_revision + 1),
            Mode::WatchOnly => (None, self.options.start_revision),
        };

        let watch = self.store.watch(
            &self.prefix,
            WatchOptions {
                start_revision,
                prev_kv: self.options.prev_kv,
            },
        );
        let mut raw_rx = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return AttemptEnd::Stopped,
            r = watch => match r {
                Ok(rx) => rx,
                Err(err) => return AttemptEnd::InitFailed(err),
            },
        };

        let created_header = match self.wait_created(&mut raw_rx).await {
            Ok(header) => header,
            Err(end) => return end,
        };

        if let Some((header, events)) = initial {
            // The state batch is sent even if empty after a restart, consumers must reset
            if !events.is_empty() || restart {
                self.last_revision = header.revision;
                if !self
                    .emit(WatchResponse::Events {
                        header,
                        events,
                        restart,
                    })
                    .await
                {
                    return AttemptEnd::Stopped;
                }
            }
        }

        if self.last_revision == 0 {
            self.last_revision = if start_revision > 0 {
                start_revision - 1
            } else {
                created_header.revision
            };
        }
        debug!(prefix = %self.prefix, revision = created_header.revision, "watch stream created");
        self.backoff.reset();
        if !self.created {
            self.created = true;
            if !self.emit(WatchResponse::Created { header: created_header }).await {
                return AttemptEnd::Stopped;
            }
        }

        self.forward(raw_rx).await
    }

    /// Paged enumeration of the prefix, all pages at the revision of the first one.
    async fn get_all(&mut self) -> crate::Result<(ResponseHeader, Vec<WatchEvent>)> {
        let limit = self.options.config.get_all_batch_size;
        let mut revision = 0;
        let mut header = ResponseHeader::default();
        let mut after_key = None;
        let mut events = Vec::new();

        loop {
            let page = self.store.get_prefix(
                &self.prefix,
                RangeOptions {
                    revision,
                    after_key: after_key.take(),
                    limit,
                },
            );
            let page = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                r = page => r?,
            };

            if revision == 0 {
                header = page.header;
                revision = page.header.revision;
            }
            after_key = page.kvs.last().map(|kv| kv.key.clone());
            events.extend(page.kvs.into_iter().map(WatchEvent::from_existing));
            trace!(prefix = %self.prefix, loaded = events.len(), "get all page");

            if !page.more {
                return Ok((header, events));
            }
        }
    }

    async fn wait_created(
        &mut self,
        raw_rx: &mut WatchReceiver,
    ) -> std::result::Result<ResponseHeader, AttemptEnd> {
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(AttemptEnd::Stopped),
                msg = raw_rx.recv() => msg,
            };
            match msg {
                Some(RawWatchResponse::Created { header }) => return Ok(header),
                Some(RawWatchResponse::Error(err)) => {
                    return Err(AttemptEnd::InitFailed(Error::Store(err)));
                }
                Some(RawWatchResponse::Events { .. }) => {
                    trace!(prefix = %self.prefix, "events before created, ignored");
                }
                None => {
                    return Err(AttemptEnd::InitFailed(Error::Watch(
                        WatchError::CancelledBeforeCreated,
                    )));
                }
            }
        }
    }

    /// Forwards events of an established watcher until it breaks.
    async fn forward(
        &mut self,
        mut raw_rx: WatchReceiver,
    ) -> AttemptEnd {
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return AttemptEnd::Stopped,
                cause = self.restart_rx.recv() => {
                    let Some(cause) = cause else {
                        return AttemptEnd::Stopped;
                    };
                    return AttemptEnd::Interrupted {
                        cause: format!("manual restart: {cause}"),
                        manual: true,
                        compacted: None,
                    };
                }
                msg = raw_rx.recv() => msg,
            };

            match msg {
                None => {
                    return AttemptEnd::Interrupted {
                        cause: "watch channel closed".to_string(),
                        manual: false,
                        compacted: None,
                    };
                }
                Some(RawWatchResponse::Created { .. }) => {}
                Some(RawWatchResponse::Error(err)) => {
                    let compacted = matches!(err, StoreError::Compacted { .. }).then(|| err.clone());
                    let cause = format!("watch error: {err}");
                    self.record_error();
                    if !self.emit(WatchResponse::Err(Error::Watch(WatchError::Stream(err)))).await {
                        return AttemptEnd::Stopped;
                    }
                    if compacted.is_some() {
                        return AttemptEnd::Interrupted {
                            cause,
                            manual: false,
                            compacted,
                        };
                    }
                }
                Some(RawWatchResponse::Events { header, mut events }) => {
                    sort_revision_events(&mut events);
                    let events: Vec<_> = events.into_iter().map(WatchEvent::from_raw).collect();
                    self.last_revision = header.revision;
                    if !self
                        .emit(WatchResponse::Events {
                            header,
                            events,
                            restart: false,
                        })
                        .await
                    {
                        return AttemptEnd::Stopped;
                    }
                }
            }
        }
    }

    /// A plain watch cannot resume behind the compacted revision.
    async fn close_compacted(
        &self,
        err: StoreError,
    ) {
        debug!(prefix = %self.prefix, "watch stream closed, resume revision compacted");
        self.emit(WatchResponse::Closed(Error::Store(err))).await;
    }

    /// Returns false if the stream should stop.
    async fn emit(
        &self,
        resp: WatchResponse,
    ) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            r = self.tx.send(resp) => r.is_ok(),
        }
    }

    fn record_error(&self) {
        if let Some(m) = &self.options.metrics {
            m.watch_errors.with_label_values(&[&self.prefix]).inc();
        }
    }
}
