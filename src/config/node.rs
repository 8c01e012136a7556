use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Identity of the local node
///
/// The node id is written as the value of every task lock key
/// and into the `node` field of task records, for diagnostics.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NodeConfig {
    /// Unique node identifier in cluster
    ///
    /// Default: `default_node_id()` ("node1")
    #[serde(default = "default_node_id")]
    pub node_id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "node_id cannot be empty".into(),
            )));
        }
        if self.node_id.contains('/') {
            return Err(Error::Config(ConfigError::Message(format!(
                "node_id must not contain '/', got {}",
                self.node_id
            ))));
        }
        Ok(())
    }
}

fn default_node_id() -> String {
    "node1".to_string()
}
