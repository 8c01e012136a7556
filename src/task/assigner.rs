#[cfg(test)]
use mockall::automock;
use tokio::sync::watch;

use crate::Result;

/// Decides which node of the cluster handles a distribution key.
///
/// All nodes receive all events, each one starts only the tasks assigned to
/// it. Nodes must share the same view of the membership to make the same
/// decisions; a short-term difference is covered by the task locks.
#[cfg_attr(test, automock)]
pub trait DistributionAssigner: Send + Sync + 'static {
    fn is_owner(
        &self,
        key: &str,
    ) -> Result<bool>;

    /// Membership generation, incremented on every change of the node set.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// Assigner of a cluster with one node, owns every key.
#[derive(Debug)]
pub struct SingleNodeAssigner {
    generation: watch::Sender<u64>,
}

impl SingleNodeAssigner {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self { generation }
    }

    /// Signals a membership change, orchestrators rescan their prefixes.
    pub fn notify_change(&self) {
        self.generation.send_modify(|g| *g += 1);
    }
}

impl Default for SingleNodeAssigner {
    fn default() -> Self {
        Self::new()
    }
}

impl DistributionAssigner for SingleNodeAssigner {
    fn is_owner(
        &self,
        _key: &str,
    ) -> Result<bool> {
        Ok(true)
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }
}
