use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_test::traced_test;

use super::*;
use crate::store::KvStore;
use crate::store::MemStore;
use crate::store::PutOptions;
use crate::watch::EventKind;
use crate::watch::WatchEvent;
use crate::CoordConfig;
use crate::Error;
use crate::OrchestratorDefaults;
use crate::TaskError;
use crate::WatchConfig;

struct Harness {
    store: MemStore,
    node: TaskNode,
    tracker: TaskTracker,
    cancel: CancellationToken,
    executed: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    async fn new() -> Self {
        let store = MemStore::new();
        let node = TaskNode::start(Arc::new(store.clone()), &CoordConfig::default(), None)
            .await
            .unwrap();
        Self {
            store,
            node,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            executed: Arc::new(Mutex::new(vec![])),
        }
    }

    fn deps(
        &self,
        assigner: Arc<dyn DistributionAssigner>,
    ) -> OrchestratorDeps {
        OrchestratorDeps {
            store: Arc::new(self.store.clone()),
            assigner,
            tasks: self.node.clone(),
            watch: WatchConfig::default(),
            defaults: OrchestratorDefaults::default(),
            metrics: None,
        }
    }

    /// Config which records the last path segment of every executed key.
    fn config(&self) -> OrchestratorConfig {
        let executed = self.executed.clone();
        OrchestratorConfig::new("job.runner", "job/")
            .distribution_key(|event: &WatchEvent| event.key.clone())
            .task_key(|event: &WatchEvent| TaskKey::new(1, event.key.trim_start_matches("job/")))
            .task_factory(move |event: &WatchEvent| {
                let executed = executed.clone();
                let name = event.key.trim_start_matches("job/").to_string();
                Some(task_fn(move |_ctx| async move {
                    executed.lock().push(name);
                    Ok(String::new())
                }))
            })
    }

    async fn put(
        &self,
        key: &str,
    ) {
        self.store
            .put(key, Bytes::from_static(b"{}"), PutOptions::default())
            .await
            .unwrap();
    }

    async fn wait_executed(
        &self,
        name: &str,
        count: usize,
    ) {
        for _ in 0..500 {
            if self.executed.lock().iter().filter(|n| *n == name).count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{name} not executed {count}x, executed: {:?}", self.executed.lock());
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.node.shutdown().await;
    }
}

fn owner_of_all_but(
    excluded: &'static str,
    generation: &watch::Sender<u64>,
) -> MockDistributionAssigner {
    let mut assigner = MockDistributionAssigner::new();
    assigner.expect_is_owner().returning(move |key| Ok(key != excluded));
    let rx = generation.subscribe();
    assigner.expect_subscribe().returning(move || rx.clone());
    assigner
}

#[tokio::test]
#[traced_test]
async fn test_starts_tasks_of_owned_keys() {
    let h = Harness::new().await;
    h.put("job/a").await;
    h.put("job/b").await;

    let (generation, _) = watch::channel(0);
    let assigner = owner_of_all_but("job/b", &generation);
    let init = Orchestrator::start(h.deps(Arc::new(assigner)), h.config(), &h.tracker, h.cancel.clone()).unwrap();
    init.await.unwrap().unwrap();

    // Existing and new keys
    h.put("job/c").await;
    h.wait_executed("a", 1).await;
    h.wait_executed("c", 1).await;
    assert!(!h.executed.lock().contains(&"b".to_string()));
    assert!(logs_contain("ready"));

    h.shutdown().await;
}

#[tokio::test]
async fn test_ignores_other_event_kinds() {
    let h = Harness::new().await;
    let init = Orchestrator::start(
        h.deps(Arc::new(SingleNodeAssigner::new())),
        h.config(),
        &h.tracker,
        h.cancel.clone(),
    )
    .unwrap();
    init.await.unwrap().unwrap();

    h.put("job/a").await;
    h.wait_executed("a", 1).await;
    while h.node.tasks_count() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Update of the same key is not a Create event
    h.put("job/a").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*h.executed.lock(), vec!["a".to_string()]);

    h.shutdown().await;
}

#[tokio::test]
async fn test_skipped_by_predicate_and_factory() {
    let h = Harness::new().await;
    let executed = h.executed.clone();
    let config = OrchestratorConfig::new("job.runner", "job/")
        .event_kinds([EventKind::Create, EventKind::Update])
        .distribution_key(|event: &WatchEvent| event.key.clone())
        .task_key(|event: &WatchEvent| TaskKey::new(1, event.key.clone()))
        .start_task_if(|event: &WatchEvent| {
            if event.key.ends_with("skip") {
                Err("skipped by predicate".to_string())
            } else {
                Ok(())
            }
        })
        .task_factory(move |event: &WatchEvent| {
            if event.key.ends_with("none") {
                return None;
            }
            let executed = executed.clone();
            let key = event.key.clone();
            Some(task_fn(move |_| async move {
                executed.lock().push(key);
                Ok(String::new())
            }))
        });

    let init = Orchestrator::start(
        h.deps(Arc::new(SingleNodeAssigner::new())),
        config,
        &h.tracker,
        h.cancel.clone(),
    )
    .unwrap();
    init.await.unwrap().unwrap();

    h.put("job/skip").await;
    h.put("job/none").await;
    h.put("job/run").await;
    h.wait_executed("job/run", 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*h.executed.lock(), vec!["job/run".to_string()]);

    h.shutdown().await;
}

#[tokio::test]
async fn test_task_uses_configured_lock_and_type() {
    let h = Harness::new().await;
    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let config = OrchestratorConfig::new("job.runner", "job/")
        .distribution_key(|event: &WatchEvent| event.key.clone())
        .task_key(|_: &WatchEvent| TaskKey::new(7, "task"))
        .lock(|_: &WatchEvent| "shared-lock".to_string())
        .task_timeout(Duration::from_secs(5))
        .task_factory(move |_: &WatchEvent| {
            let started_tx = started_tx.clone();
            Some(task_fn(move |ctx: TaskContext| async move {
                let _ = started_tx.send(ctx.task().clone());
                Ok(String::new())
            }))
        });

    Orchestrator::start(
        h.deps(Arc::new(SingleNodeAssigner::new())),
        config,
        &h.tracker,
        h.cancel.clone(),
    )
    .unwrap()
    .await
    .unwrap()
    .unwrap();

    h.put("job/a").await;
    let task = started_rx.recv().await.unwrap();
    assert_eq!(task.task_type, "job.runner");
    assert_eq!(task.lock, "runtime/lock/task/shared-lock");
    assert_eq!(task.key.project_id, 7);

    h.shutdown().await;
}

#[tokio::test]
async fn test_membership_change_reprocesses_keys() {
    let h = Harness::new().await;
    h.put("job/a").await;

    let assigner = Arc::new(SingleNodeAssigner::new());
    let init = Orchestrator::start(h.deps(assigner.clone()), h.config(), &h.tracker, h.cancel.clone()).unwrap();
    init.await.unwrap().unwrap();
    h.wait_executed("a", 1).await;
    while h.node.tasks_count() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assigner.notify_change();
    h.wait_executed("a", 2).await;

    h.shutdown().await;
}

#[tokio::test]
async fn test_resync_interval_reprocesses_keys() {
    let h = Harness::new().await;
    h.put("job/a").await;

    let config = h.config().resync_interval(Duration::from_millis(100));
    let init = Orchestrator::start(
        h.deps(Arc::new(SingleNodeAssigner::new())),
        config,
        &h.tracker,
        h.cancel.clone(),
    )
    .unwrap();
    init.await.unwrap().unwrap();
    h.wait_executed("a", 2).await;

    h.shutdown().await;
}

#[tokio::test]
async fn test_first_init_error_is_returned() {
    let h = Harness::new().await;
    h.store.set_unavailable(Some("network down"));

    let init = Orchestrator::start(
        h.deps(Arc::new(SingleNodeAssigner::new())),
        h.config(),
        &h.tracker,
        h.cancel.clone(),
    )
    .unwrap();
    let err = init.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("network down"), "{err}");

    h.store.set_unavailable(None);
    h.shutdown().await;
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let h = Harness::new().await;
    let config = OrchestratorConfig::new("job.runner", "job/")
        .distribution_key(|event: &WatchEvent| event.key.clone())
        .task_key(|_: &WatchEvent| TaskKey::new(1, "t"));

    let err = Orchestrator::start(
        h.deps(Arc::new(SingleNodeAssigner::new())),
        config,
        &h.tracker,
        h.cancel.clone(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Task(TaskError::InvalidOrchestrator(_))));

    h.shutdown().await;
}
