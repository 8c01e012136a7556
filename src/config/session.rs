use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use super::BackoffPolicy;
use crate::Error;
use crate::Result;

/// Lease-backed session configuration
///
/// Keys bound to the session lease (task locks, mutex keys) are removed by
/// the store `ttl_secs` seconds after the node stops sending keep-alives.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SessionConfig {
    /// Lease TTL in seconds
    ///
    /// Default: 15
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,

    /// Maximum time to wait for a lease grant
    ///
    /// Default: 5000
    #[serde(default = "default_grant_timeout_ms")]
    pub grant_timeout_ms: u64,

    /// Backoff between attempts to re-create an expired session
    #[serde(default)]
    pub recreate_backoff: BackoffPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            grant_timeout_ms: default_grant_timeout_ms(),
            recreate_backoff: BackoffPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs.max(0) as u64)
    }

    pub fn grant_timeout(&self) -> Duration {
        Duration::from_millis(self.grant_timeout_ms)
    }

    /// Interval between two keep-alive requests, a third of the TTL.
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis((self.ttl_secs.max(1) as u64 * 1000) / 3)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl_secs <= 0 {
            return Err(Error::Config(ConfigError::Message(format!(
                "session.ttl_secs must be > 0, got {}",
                self.ttl_secs
            ))));
        }
        if self.grant_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "session.grant_timeout_ms must be > 0".into(),
            )));
        }
        self.recreate_backoff.validate("session.recreate_backoff")
    }
}

fn default_ttl_secs() -> i64 {
    15
}

fn default_grant_timeout_ms() -> u64 {
    5_000
}
