use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::DistributionAssigner;
use super::TaskConfig;
use super::TaskFn;
use super::TaskKey;
use super::TaskNode;
use crate::metrics::CoordMetrics;
use crate::store::KvStore;
use crate::utils::async_task::sleep_or_cancel;
use crate::utils::async_task::spawn_task;
use crate::utils::backoff::ExponentialBackoff;
use crate::watch::EventKind;
use crate::watch::InitReceiver;
use crate::watch::WatchConsumer;
use crate::watch::WatchEvent;
use crate::watch::WatchStream;
use crate::watch::WatchStreamOptions;
use crate::Error;
use crate::OrchestratorDefaults;
use crate::Result;
use crate::TaskError;
use crate::WatchConfig;
use crate::WatchError;

pub type DistributionKeyFn = Arc<dyn Fn(&WatchEvent) -> String + Send + Sync>;
pub type TaskKeyFn = Arc<dyn Fn(&WatchEvent) -> TaskKey + Send + Sync>;
pub type LockFn = Arc<dyn Fn(&WatchEvent) -> String + Send + Sync>;
/// `Err(reason)` skips the event.
pub type StartTaskIfFn = Arc<dyn Fn(&WatchEvent) -> std::result::Result<(), String> + Send + Sync>;
/// `None` skips the event.
pub type TaskFactoryFn = Arc<dyn Fn(&WatchEvent) -> Option<TaskFn> + Send + Sync>;

/// Definition of one orchestrator: which prefix is watched and how events
/// are converted to tasks.
#[derive(Clone)]
pub struct OrchestratorConfig {
    /// Used as the task type and in logs
    pub name: String,
    pub prefix: String,
    /// Default: `[EventKind::Create]`
    pub event_kinds: Vec<EventKind>,
    /// Interval of full re-processing of the prefix, see [`OrchestratorDefaults`]
    pub resync_interval: Option<Duration>,
    pub task_timeout: Option<Duration>,
    pub distribution_key: Option<DistributionKeyFn>,
    pub task_key: Option<TaskKeyFn>,
    pub lock: Option<LockFn>,
    pub start_task_if: Option<StartTaskIfFn>,
    pub task_factory: Option<TaskFactoryFn>,
}

impl OrchestratorConfig {
    pub fn new(
        name: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            event_kinds: vec![EventKind::Create],
            resync_interval: None,
            task_timeout: None,
            distribution_key: None,
            task_key: None,
            lock: None,
            start_task_if: None,
            task_factory: None,
        }
    }

    pub fn event_kinds(
        mut self,
        kinds: impl IntoIterator<Item = EventKind>,
    ) -> Self {
        self.event_kinds = kinds.into_iter().collect();
        self
    }

    pub fn resync_interval(
        mut self,
        interval: Duration,
    ) -> Self {
        self.resync_interval = Some(interval);
        self
    }

    pub fn task_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn distribution_key(
        mut self,
        f: impl Fn(&WatchEvent) -> String + Send + Sync + 'static,
    ) -> Self {
        self.distribution_key = Some(Arc::new(f));
        self
    }

    pub fn task_key(
        mut self,
        f: impl Fn(&WatchEvent) -> TaskKey + Send + Sync + 'static,
    ) -> Self {
        self.task_key = Some(Arc::new(f));
        self
    }

    /// Lock name of the task, the task key is used if not set.
    pub fn lock(
        mut self,
        f: impl Fn(&WatchEvent) -> String + Send + Sync + 'static,
    ) -> Self {
        self.lock = Some(Arc::new(f));
        self
    }

    pub fn start_task_if(
        mut self,
        f: impl Fn(&WatchEvent) -> std::result::Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.start_task_if = Some(Arc::new(f));
        self
    }

    pub fn task_factory(
        mut self,
        f: impl Fn(&WatchEvent) -> Option<TaskFn> + Send + Sync + 'static,
    ) -> Self {
        self.task_factory = Some(Arc::new(f));
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| -> Result<()> {
            Err(TaskError::InvalidOrchestrator(format!("{}: {msg}", self.name)).into())
        };
        if self.name.is_empty() {
            return Err(TaskError::InvalidOrchestrator("name must be configured".into()).into());
        }
        if self.prefix.is_empty() {
            return invalid("prefix must be configured");
        }
        if self.event_kinds.is_empty() {
            return invalid("at least one event kind must be configured");
        }
        if self.resync_interval.is_some_and(|i| i.is_zero()) {
            return invalid("resync interval must be > 0");
        }
        if self.task_timeout.is_some_and(|t| t.is_zero()) {
            return invalid("task timeout must be > 0");
        }
        if self.distribution_key.is_none() {
            return invalid("distribution key function must be configured");
        }
        if self.task_key.is_none() {
            return invalid("task key function must be configured");
        }
        if self.task_factory.is_none() {
            return invalid("task factory must be configured");
        }
        Ok(())
    }
}

impl fmt::Debug for OrchestratorConfig {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("OrchestratorConfig")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("event_kinds", &self.event_kinds)
            .field("resync_interval", &self.resync_interval)
            .field("task_timeout", &self.task_timeout)
            .field("lock", &self.lock.is_some())
            .field("start_task_if", &self.start_task_if.is_some())
            .finish()
    }
}

/// Components shared by all orchestrators of a node.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub store: Arc<dyn KvStore>,
    pub assigner: Arc<dyn DistributionAssigner>,
    pub tasks: TaskNode,
    pub watch: WatchConfig,
    pub defaults: OrchestratorDefaults,
    pub metrics: Option<CoordMetrics>,
}

/// Starts tasks for the events of a watched prefix.
///
/// All nodes watch the same prefix; a task is started only by the node
/// owning its distribution key. The watcher is re-created periodically and
/// on membership changes, so keys whose owner changed are picked up. Running
/// tasks are not affected by a restart.
pub struct Orchestrator;

impl Orchestrator {
    /// Validates the config and spawns the orchestrator.
    ///
    /// The receiver resolves once the first watcher is created, or with the
    /// error of the first attempt, which is not retried.
    pub fn start(
        deps: OrchestratorDeps,
        config: OrchestratorConfig,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> Result<InitReceiver> {
        config.validate()?;
        deps.defaults.validate()?;

        let resync_interval = config
            .resync_interval
            .unwrap_or_else(|| deps.defaults.resync_interval());
        let handler = Arc::new(EventHandler {
            name: config.name.clone(),
            event_kinds: config.event_kinds.clone(),
            task_timeout: config.task_timeout,
            distribution_key: config.distribution_key.clone().ok_or_else(|| missing(&config))?,
            task_key: config.task_key.clone().ok_or_else(|| missing(&config))?,
            task_factory: config.task_factory.clone().ok_or_else(|| missing(&config))?,
            lock: config.lock.clone(),
            start_task_if: config.start_task_if.clone(),
            assigner: deps.assigner.clone(),
            tasks: deps.tasks.clone(),
            tracker: tracker.clone(),
            cancel: cancel.clone(),
        });

        let (init_tx, init_rx) = oneshot::channel();
        let worker = OrchestratorWorker {
            name: config.name,
            prefix: config.prefix,
            resync_interval,
            backoff: ExponentialBackoff::new(deps.defaults.retry_backoff),
            deps,
            handler,
            cancel,
        };
        tracker.spawn(worker.run(init_tx));
        Ok(init_rx)
    }
}

fn missing(config: &OrchestratorConfig) -> Error {
    TaskError::InvalidOrchestrator(format!("{}: incomplete config", config.name)).into()
}

struct OrchestratorWorker {
    name: String,
    prefix: String,
    resync_interval: Duration,
    backoff: ExponentialBackoff,
    deps: OrchestratorDeps,
    handler: Arc<EventHandler>,
    cancel: CancellationToken,
}

impl OrchestratorWorker {
    async fn run(
        mut self,
        init_tx: oneshot::Sender<Result<()>>,
    ) {
        let name = self.name.clone();
        let mut init_tx = Some(init_tx);
        let mut membership = Some(self.deps.assigner.subscribe());
        if let Some(rx) = membership.as_mut() {
            rx.borrow_and_update();
        }

        loop {
            let watcher_cancel = self.cancel.child_token();
            let watcher_closed = CancellationToken::new();
            let watcher_tracker = TaskTracker::new();

            if let Err(err) = self
                .start_watcher(&watcher_tracker, watcher_cancel.clone(), watcher_closed.clone())
                .await
            {
                watcher_cancel.cancel();
                watcher_tracker.close();
                watcher_tracker.wait().await;
                if self.cancel.is_cancelled() || err.is_cancelled() {
                    break;
                }
                if let Some(tx) = init_tx.take() {
                    error!(orchestrator = %name, "cannot start: {err}");
                    let _ = tx.send(Err(err));
                    return;
                }
                let Some(delay) = self.backoff.next_backoff() else {
                    error!(orchestrator = %name, "cannot re-create watcher, retries exhausted: {err}");
                    break;
                };
                warn!(orchestrator = %name, "re-creating watcher, backoff delay {delay:?}, reason: {err}");
                if !sleep_or_cancel(&self.cancel, delay).await {
                    break;
                }
                continue;
            }

            self.backoff.reset();
            if let Some(tx) = init_tx.take() {
                info!(orchestrator = %name, prefix = %self.prefix, "ready");
                let _ = tx.send(Ok(()));
            }

            let cause = tokio::select! {
                _ = self.cancel.cancelled() => None,
                _ = tokio::time::sleep(self.resync_interval) => Some("resync interval"),
                _ = membership_changed(&mut membership) => Some("distribution change"),
                _ = watcher_closed.cancelled() => Some("watcher closed"),
            };

            watcher_cancel.cancel();
            watcher_tracker.close();
            watcher_tracker.wait().await;

            match cause {
                Some(cause) => debug!(orchestrator = %name, "restart: {cause}"),
                None => break,
            }
        }

        if let Some(tx) = init_tx.take() {
            let _ = tx.send(Err(Error::Cancelled));
        }
        info!(orchestrator = %name, "stopped");
    }

    /// Starts a fresh watcher, every existing key is processed again.
    async fn start_watcher(
        &self,
        tracker: &TaskTracker,
        cancel: CancellationToken,
        closed: CancellationToken,
    ) -> Result<()> {
        let stream = WatchStream::get_all_and_watch(
            self.deps.store.clone(),
            self.prefix.clone(),
            WatchStreamOptions {
                prev_kv: true,
                start_revision: 0,
                config: self.deps.watch.clone(),
                metrics: self.deps.metrics.clone(),
            },
            tracker,
            cancel.clone(),
        );

        let handler = self.handler.clone();
        let init = WatchConsumer::builder(stream)
            .on_close(move |_| closed.cancel())
            .for_each(move |events, _header, _restart| {
                for event in events {
                    handler.on_event(event);
                }
            })
            .build()?
            .start(tracker);

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            r = init => match r {
                Ok(r) => r,
                Err(_) => Err(WatchError::ConsumerClosed(self.prefix.clone()).into()),
            },
        }
    }
}

/// Resolves on the next membership change. A closed channel disables the trigger.
async fn membership_changed(rx: &mut Option<watch::Receiver<u64>>) {
    if let Some(r) = rx.as_mut() {
        if r.changed().await.is_ok() {
            return;
        }
    }
    *rx = None;
    std::future::pending::<()>().await
}

struct EventHandler {
    name: String,
    event_kinds: Vec<EventKind>,
    task_timeout: Option<Duration>,
    distribution_key: DistributionKeyFn,
    task_key: TaskKeyFn,
    task_factory: TaskFactoryFn,
    lock: Option<LockFn>,
    start_task_if: Option<StartTaskIfFn>,
    assigner: Arc<dyn DistributionAssigner>,
    tasks: TaskNode,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl EventHandler {
    fn on_event(
        &self,
        event: WatchEvent,
    ) {
        if !self.event_kinds.contains(&event.kind) {
            return;
        }

        let task_key = (self.task_key)(&event);
        let distribution_key = (self.distribution_key)(&event);
        match self.assigner.is_owner(&distribution_key) {
            Ok(true) => {}
            Ok(false) => {
                debug!(orchestrator = %self.name, "not assigned \"{task_key}\", distribution key \"{distribution_key}\"");
                return;
            }
            Err(e) => {
                error!(orchestrator = %self.name, "cannot check assignment of \"{task_key}\": {e}");
                return;
            }
        }

        if let Some(start_task_if) = &self.start_task_if {
            if let Err(reason) = start_task_if(&event) {
                debug!(orchestrator = %self.name, "skipped \"{task_key}\", {reason}");
                return;
            }
        }

        let Some(operation) = (self.task_factory)(&event) else {
            info!(orchestrator = %self.name, "skipped \"{task_key}\"");
            return;
        };

        let lock = self.lock.as_ref().map(|f| f(&event));
        info!(orchestrator = %self.name, "assigned \"{task_key}\"");

        let cfg = TaskConfig {
            key: task_key,
            task_type: self.name.clone(),
            lock,
            timeout: self.task_timeout,
            operation,
        };
        let tasks = self.tasks.clone();
        let cancel = self.cancel.clone();
        spawn_task(&format!("{} start task", self.name), &self.tracker, async move {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            tasks.start_task(cfg).await.map(|_| ())
        });
    }
}
