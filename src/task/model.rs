use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::utils::time::utc_millis;
use crate::BoxError;
use crate::Result;
use crate::TaskError;

/// Identity of a task, stored under `<task prefix>/<project id>/<task id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskKey {
    pub project_id: u64,
    pub task_id: String,
}

impl TaskKey {
    pub fn new(
        project_id: u64,
        task_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id,
            task_id: task_id.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.task_id)
    }
}

/// Persisted task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(flatten)]
    pub key: TaskKey,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(with = "utc_millis")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "utc_millis::option")]
    pub finished_at: Option<DateTime<Utc>>,
    pub node: String,
    /// Lock key
    pub lock: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_nanos")]
    pub duration: Option<Duration>,
}

impl Task {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn is_successful(&self) -> bool {
        self.is_finished() && self.error.is_none()
    }
}

/// Integer nanoseconds.
mod duration_nanos {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_nanos))
    }
}

pub type TaskResult = std::result::Result<String, BoxError>;

/// Unit of work executed by a [`TaskNode`](super::TaskNode).
pub type TaskFn = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, TaskResult> + Send>;

/// Boxes an async closure into a [`TaskFn`].
pub fn task_fn<F, Fut>(operation: F) -> TaskFn
where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = TaskResult> + Send + 'static,
{
    Box::new(move |ctx| operation(ctx).boxed())
}

/// Passed to the task operation.
#[derive(Debug, Clone)]
pub struct TaskContext {
    task: Task,
    cancel: CancellationToken,
    deadline: Instant,
}

impl TaskContext {
    pub(crate) fn new(
        task: Task,
        cancel: CancellationToken,
        deadline: Instant,
    ) -> Self {
        Self { task, cancel, deadline }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn key(&self) -> &TaskKey {
        &self.task.key
    }

    /// Fired on node shutdown and when the deadline is exceeded.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

pub struct TaskConfig {
    pub key: TaskKey,
    pub task_type: String,
    /// Lock name, the task key is used if not set
    pub lock: Option<String>,
    /// Deadline of the operation, the node default is used if not set
    pub timeout: Option<Duration>,
    pub operation: TaskFn,
}

impl TaskConfig {
    pub fn new<F, Fut>(
        key: TaskKey,
        task_type: impl Into<String>,
        operation: F,
    ) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            key,
            task_type: task_type.into(),
            lock: None,
            timeout: None,
            operation: task_fn(operation),
        }
    }

    pub fn with_lock(
        mut self,
        lock: impl Into<String>,
    ) -> Self {
        self.lock = Some(lock.into());
        self
    }

    pub fn with_timeout(
        mut self,
        timeout: Duration,
    ) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.task_type.is_empty() {
            return Err(TaskError::InvalidConfig("task type must be configured".into()).into());
        }
        if self.key.task_id.is_empty() {
            return Err(TaskError::InvalidConfig("task ID must be configured".into()).into());
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(TaskError::InvalidConfig("task timeout must be > 0".into()).into());
        }
        Ok(())
    }
}

impl fmt::Debug for TaskConfig {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("TaskConfig")
            .field("key", &self.key)
            .field("task_type", &self.task_type)
            .field("lock", &self.lock)
            .field("timeout", &self.timeout)
            .finish()
    }
}
