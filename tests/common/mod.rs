use std::sync::Arc;
use std::time::Duration;

use d_coord::store::KvStore;
use d_coord::store::MemStore;
use d_coord::task::TaskNode;
use d_coord::CoordConfig;

pub fn node_config(node_id: &str) -> CoordConfig {
    let mut config = CoordConfig::default();
    config.node.node_id = node_id.to_string();
    config
}

pub async fn start_node(
    store: &MemStore,
    node_id: &str,
) -> TaskNode {
    TaskNode::start(Arc::new(store.clone()) as Arc<dyn KvStore>, &node_config(node_id), None)
        .await
        .expect("node started")
}

/// Polls `f` every 10ms, panics after 5s.
pub async fn eventually(mut f: impl FnMut() -> bool) {
    for _ in 0..500 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
