use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::info_span;
use tracing::warn;
use tracing::Instrument;

use super::Task;
use super::TaskConfig;
use super::TaskContext;
use super::TaskFn;
use super::TaskResult;
use crate::metrics::CoordMetrics;
use crate::session::Session;
use crate::store::Compare;
use crate::store::CompareOp;
use crate::store::KvStore;
use crate::store::LeaseId;
use crate::store::PutOptions;
use crate::store::Txn;
use crate::store::TxnOp;
use crate::utils::async_task::cancellable;
use crate::utils::async_task::with_timeout;
use crate::utils::time::format_utc_millis;
use crate::utils::time::utc_now_millis;
use crate::CoordConfig;
use crate::Error;
use crate::Result;
use crate::TaskError;
use crate::TaskNodeConfig;

const TASK_ID_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w',
    'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// Cluster node on which tasks are run, see [`TaskNode::start_task`].
///
/// Cheap to clone.
#[derive(Clone)]
pub struct TaskNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    node_id: String,
    config: TaskNodeConfig,
    /// Bound of the finishing transaction, the lease is expired anyway after the TTL
    finish_timeout: Duration,
    store: Arc<dyn KvStore>,
    session: Session,
    session_tracker: TaskTracker,
    tasks_cancel: CancellationToken,
    tasks: TaskTracker,
    local_locks: parking_lot::Mutex<HashSet<String>>,
    metrics: Option<CoordMetrics>,
}

impl TaskNode {
    /// Creates the node and waits for its session.
    pub async fn start(
        store: Arc<dyn KvStore>,
        config: &CoordConfig,
        metrics: Option<CoordMetrics>,
    ) -> Result<TaskNode> {
        config.node.validate()?;
        config.task.validate()?;
        let node_id = config.node.node_id.clone();

        // Not bound to any outer token, the session outlives the tasks, see shutdown
        let session_tracker = TaskTracker::new();
        let session = Session::builder(store.clone(), config.session.clone())
            .start_or_err(&session_tracker, CancellationToken::new())
            .await?;

        info!(node = %node_id, "task node started");
        Ok(TaskNode {
            inner: Arc::new(NodeInner {
                node_id,
                config: config.task.clone(),
                finish_timeout: config.session.ttl(),
                store,
                session,
                session_tracker,
                tasks_cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
                local_locks: parking_lot::Mutex::new(HashSet::new()),
                metrics,
            }),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Number of tasks running on this node.
    pub fn tasks_count(&self) -> usize {
        self.inner.local_locks.lock().len()
    }

    /// Starts the task, if its lock is free in the whole cluster.
    ///
    /// Returns `Ok(None)` if the task is already running, locally or on
    /// another node. The operation runs in the background.
    pub async fn start_task(
        &self,
        cfg: TaskConfig,
    ) -> Result<Option<Task>> {
        cfg.validate()?;
        let inner = &self.inner;

        let lock_name = match &cfg.lock {
            Some(lock) if !lock.is_empty() => lock.clone(),
            _ => cfg.key.to_string(),
        };
        let lock = format!("{}/{}", inner.config.lock_prefix, lock_name);

        let created_at = utc_now_millis();
        let mut key = cfg.key.clone();
        key.task_id = format!(
            "{}/{}_{}",
            key.task_id,
            format_utc_millis(&created_at),
            nanoid::nanoid!(5, &TASK_ID_ALPHABET)
        );

        // Detects locally that the task is already running, e.g. on re-syncs
        let Some(local_lock) = LocalLock::acquire(inner, &lock) else {
            return Ok(None);
        };

        let task = Task {
            key,
            task_type: cfg.task_type.clone(),
            created_at,
            finished_at: None,
            node: inner.node_id.clone(),
            lock: lock.clone(),
            result: None,
            error: None,
            duration: None,
        };
        let task_key = task.key.to_string();

        let created = async {
            let lease = inner.session.session()?;
            let record = Bytes::from(serde_json::to_vec(&task)?);
            // The lock key is bound to the lease, so a crashed node releases it after the TTL
            let txn = Txn::new()
                .when([Compare::key_missing(lock.clone())])
                .and_then([
                    TxnOp::put(inner.task_record_key(&task), record, PutOptions::default()),
                    TxnOp::put(lock.clone(), inner.node_id.clone(), PutOptions::with_lease(lease.id())),
                ]);
            let resp = cancellable(&inner.tasks_cancel, inner.store.txn(txn)).await?;
            Ok::<_, Error>((resp, lease.id()))
        }
        .await;

        let (resp, lease) = created.map_err(|e| TaskError::StartFailed {
            key: task_key.clone(),
            source: Box::new(e),
        })?;
        if !resp.succeeded {
            info!(task = %task_key, "task ignored, the lock \"{lock}\" is in use");
            if let Some(m) = &inner.metrics {
                m.tasks_ignored.with_label_values(&[&task.task_type]).inc();
            }
            return Ok(None);
        }

        info!(task = %task_key, "started task");
        debug!(task = %task_key, "lock acquired \"{lock}\"");
        if let Some(m) = &inner.metrics {
            m.tasks_started.with_label_values(&[&task.task_type]).inc();
        }

        let timeout = cfg.timeout.unwrap_or_else(|| inner.config.default_timeout());
        let span = info_span!(
            "task",
            task = %task_key,
            task_type = %task.task_type,
            lock = %task.lock,
            node = %task.node,
        );
        let run_inner = inner.clone();
        let run_task = task.clone();
        inner.tasks.spawn(
            async move {
                let _local_lock = local_lock;
                run_inner.run_task(run_task, lease, cfg.operation, timeout).await;
            }
            .instrument(span),
        );

        Ok(Some(task))
    }

    /// Cancels running tasks, waits for them, then closes the session.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        info!(node = %inner.node_id, "received shutdown request");
        let count = self.tasks_count();
        if count > 0 {
            info!("waiting for \"{count}\" tasks to be finished");
        }

        inner.tasks_cancel.cancel();
        inner.tasks.close();
        inner.tasks.wait().await;

        inner.session.close().await;
        inner.session_tracker.close();
        inner.session_tracker.wait().await;
        info!(node = %inner.node_id, "shutdown done");
    }
}

impl NodeInner {
    fn task_record_key(
        &self,
        task: &Task,
    ) -> String {
        format!("{}/{}", self.config.task_prefix, task.key)
    }

    async fn run_task(
        &self,
        mut task: Task,
        lease: LeaseId,
        operation: TaskFn,
        timeout: Duration,
    ) {
        let cancel = self.tasks_cancel.child_token();
        let ctx = TaskContext::new(task.clone(), cancel.clone(), Instant::now() + timeout);
        if let Some(m) = &self.metrics {
            m.tasks_running.inc();
        }

        let started = Instant::now();
        let result = run_operation(operation, ctx, cancel, timeout).await;
        let duration = started.elapsed();

        task.finished_at = Some(utc_now_millis());
        task.duration = Some(duration);
        let outcome = match result {
            Ok(result) => {
                info!("task succeeded ({duration:?}): {result}");
                task.result = Some(result);
                "succeeded"
            }
            Err(err) => {
                warn!("task failed ({duration:?}): {err}");
                task.error = Some(err.to_string());
                "failed"
            }
        };

        if let Some(m) = &self.metrics {
            m.tasks_running.dec();
            m.tasks_finished.with_label_values(&[&task.task_type, outcome]).inc();
            m.task_duration_seconds
                .with_label_values(&[&task.task_type])
                .observe(duration.as_secs_f64());
        }

        if let Err(e) = self.finish_task(&task, lease).await {
            error!("cannot update task and release lock: {e}");
        }
    }

    /// Updates the task record and releases the lock in one transaction.
    ///
    /// The lock is deleted only while it is still held by this node under the
    /// lease of the start, after a lost lease it may belong to another node.
    async fn finish_task(
        &self,
        task: &Task,
        lease: LeaseId,
    ) -> Result<()> {
        let record = Bytes::from(serde_json::to_vec(task)?);
        let record_key = self.task_record_key(task);
        let txn = Txn::new()
            .when([
                Compare::value(task.lock.clone(), CompareOp::Equal, self.node_id.clone()),
                Compare::lease(task.lock.clone(), CompareOp::Equal, lease),
            ])
            .and_then([
                TxnOp::put(record_key.clone(), record.clone(), PutOptions::default()),
                TxnOp::delete(task.lock.clone()),
            ])
            .or_else([TxnOp::put(record_key, record, PutOptions::default())]);

        // Independent of the node cancellation, the result must be persisted on shutdown
        let resp = with_timeout(self.finish_timeout, self.store.txn(txn)).await?;
        if resp.succeeded {
            debug!("lock released \"{}\"", task.lock);
        } else {
            error!("cannot release task lock \"{}\", not found or held by another session", task.lock);
        }
        Ok(())
    }
}

async fn run_operation(
    operation: TaskFn,
    ctx: TaskContext,
    cancel: CancellationToken,
    timeout: Duration,
) -> TaskResult {
    let op = AssertUnwindSafe(async move { operation(ctx).await }).catch_unwind();
    match tokio::time::timeout(timeout, op).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => {
            let err = format!(
                "panic: {}, stacktrace: {}",
                panic_message(panic.as_ref()),
                Backtrace::force_capture()
            );
            error!("task panic: {err}");
            Err(err.into())
        }
        Err(_) => {
            cancel.cancel();
            Err(format!("task timeout after {timeout:?}").into())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Guarantees that a lock is used at most once on this node, released on drop.
struct LocalLock {
    node: Arc<NodeInner>,
    lock: String,
}

impl LocalLock {
    fn acquire(
        node: &Arc<NodeInner>,
        lock: &str,
    ) -> Option<LocalLock> {
        if !node.local_locks.lock().insert(lock.to_string()) {
            return None;
        }
        Some(LocalLock {
            node: node.clone(),
            lock: lock.to_string(),
        })
    }
}

impl Drop for LocalLock {
    fn drop(&mut self) {
        self.node.local_locks.lock().remove(&self.lock);
    }
}

impl std::fmt::Debug for TaskNode {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("TaskNode")
            .field("node_id", &self.inner.node_id)
            .field("tasks_count", &self.tasks_count())
            .finish()
    }
}
