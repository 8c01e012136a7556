use std::time::Duration;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Exponential backoff policy
///
/// The delay starts at `base_delay_ms`, is multiplied by `multiplier` after
/// each attempt and capped at `max_delay_ms`. Every delay is randomized by
/// `±randomization_factor`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Maximum number of retries (0 means unlimited retries)
    #[serde(default)]
    pub max_retries: usize,

    /// Backoff base (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff time (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Delay multiplier applied after each attempt
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter, 0.2 means the delay is randomized in the range ±20%
    #[serde(default = "default_randomization_factor")]
    pub randomization_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            randomization_factor: default_randomization_factor(),
        }
    }
}

impl BackoffPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(
        &self,
        name: &str,
    ) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(Error::Config(ConfigError::Message(format!(
                "{name}: base_delay_ms must be > 0"
            ))));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(Error::Config(ConfigError::Message(format!(
                "{name}: max_delay_ms({}) must be >= base_delay_ms({})",
                self.max_delay_ms, self.base_delay_ms
            ))));
        }
        if self.multiplier < 1.0 {
            return Err(Error::Config(ConfigError::Message(format!(
                "{name}: multiplier must be >= 1.0, got {}",
                self.multiplier
            ))));
        }
        if !(0.0..1.0).contains(&self.randomization_factor) {
            return Err(Error::Config(ConfigError::Message(format!(
                "{name}: randomization_factor must be in [0, 1), got {}",
                self.randomization_factor
            ))));
        }
        Ok(())
    }
}

fn default_base_delay_ms() -> u64 {
    50
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_randomization_factor() -> f64 {
    0.2
}
