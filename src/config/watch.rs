use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use super::BackoffPolicy;
use crate::Error;
use crate::Result;

/// Resilient watch stream configuration
///
/// ```toml
/// [watch]
/// get_all_batch_size = 100
/// error_threshold_ms = 5000
///
/// [watch.restart_backoff]
/// base_delay_ms = 50
/// max_delay_ms = 60000
/// ```
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WatchConfig {
    /// Page size of the "get all" phase of `get_all_and_watch`
    ///
    /// Default: 100
    #[serde(default = "default_get_all_batch_size")]
    pub get_all_batch_size: usize,

    /// If two errors arrive within this window, the second one is logged
    /// as an error instead of a warning.
    ///
    /// Default: 5000
    #[serde(default = "default_error_threshold_ms")]
    pub error_threshold_ms: u64,

    /// Capacity of the channel between the stream worker and the consumer
    ///
    /// Default: 64
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Backoff between restarts of the watcher, reset on every `Created`
    #[serde(default)]
    pub restart_backoff: BackoffPolicy,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            get_all_batch_size: default_get_all_batch_size(),
            error_threshold_ms: default_error_threshold_ms(),
            channel_capacity: default_channel_capacity(),
            restart_backoff: BackoffPolicy::default(),
        }
    }
}

impl WatchConfig {
    pub fn error_threshold(&self) -> Duration {
        Duration::from_millis(self.error_threshold_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.get_all_batch_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.get_all_batch_size must be > 0".into(),
            )));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.channel_capacity must be > 0".into(),
            )));
        }
        self.restart_backoff.validate("watch.restart_backoff")
    }
}

fn default_get_all_batch_size() -> usize {
    100
}

fn default_error_threshold_ms() -> u64 {
    5_000
}

fn default_channel_capacity() -> usize {
    64
}
