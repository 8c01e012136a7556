use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use super::BackoffPolicy;
use crate::Error;
use crate::Result;

/// Task node configuration
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TaskNodeConfig {
    /// Prefix of persisted task records
    ///
    /// Default: "task"
    #[serde(default = "default_task_prefix")]
    pub task_prefix: String,

    /// Prefix of lease-bound lock keys
    ///
    /// Default: "runtime/lock/task"
    #[serde(default = "default_lock_prefix")]
    pub lock_prefix: String,

    /// Deadline of a task operation if the task does not define its own
    ///
    /// Default: 600000 (10 minutes)
    #[serde(default = "default_task_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for TaskNodeConfig {
    fn default() -> Self {
        Self {
            task_prefix: default_task_prefix(),
            lock_prefix: default_lock_prefix(),
            default_timeout_ms: default_task_timeout_ms(),
        }
    }
}

impl TaskNodeConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, prefix) in [("task_prefix", &self.task_prefix), ("lock_prefix", &self.lock_prefix)] {
            if prefix.is_empty() || prefix.ends_with('/') {
                return Err(Error::Config(ConfigError::Message(format!(
                    "task.{name} must be non-empty and must not end with '/', got {prefix:?}"
                ))));
            }
        }
        if self.default_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "task.default_timeout_ms must be > 0".into(),
            )));
        }
        Ok(())
    }
}

/// Orchestrator defaults, used when an orchestrator config leaves them unset
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OrchestratorDefaults {
    /// Interval after which all keys in the watched prefix are processed again
    ///
    /// Default: 60000
    #[serde(default = "default_resync_interval_ms")]
    pub resync_interval_ms: u64,

    /// Backoff between watcher re-creations after an error
    #[serde(default)]
    pub retry_backoff: BackoffPolicy,
}

impl Default for OrchestratorDefaults {
    fn default() -> Self {
        Self {
            resync_interval_ms: default_resync_interval_ms(),
            retry_backoff: BackoffPolicy::default(),
        }
    }
}

impl OrchestratorDefaults {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resync_interval_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "orchestrator.resync_interval_ms must be > 0".into(),
            )));
        }
        self.retry_backoff.validate("orchestrator.retry_backoff")
    }
}

fn default_task_prefix() -> String {
    "task".to_string()
}

fn default_lock_prefix() -> String {
    "runtime/lock/task".to_string()
}

fn default_task_timeout_ms() -> u64 {
    600_000
}

fn default_resync_interval_ms() -> u64 {
    60_000
}
