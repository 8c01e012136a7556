use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use d_coord::store::KvStore;
use d_coord::store::MemStore;
use d_coord::store::RangeOptions;
use d_coord::task::Task;
use d_coord::task::TaskConfig;
use d_coord::task::TaskKey;
use tokio::sync::oneshot;

use crate::common::eventually;
use crate::common::start_node;

fn my_lock_task(
    name: &str,
    release: Option<oneshot::Receiver<()>>,
) -> TaskConfig {
    TaskConfig::new(TaskKey::new(1, name), "some.task", move |_| async move {
        if let Some(release) = release {
            let _ = release.await;
        }
        Ok("done".to_string())
    })
    .with_lock("my-lock")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_node_ignores_locked_task_until_released() {
    let store = MemStore::new();
    let node1 = start_node(&store, "node1").await;
    let node2 = start_node(&store, "node2").await;

    let (release_tx, release_rx) = oneshot::channel();
    let first = node1
        .start_task(my_lock_task("first", Some(release_rx)))
        .await
        .unwrap()
        .expect("first task started");
    assert_eq!(first.lock, "runtime/lock/task/my-lock");

    // Locked by node1
    assert!(node2.start_task(my_lock_task("second", None)).await.unwrap().is_none());

    release_tx.send(()).unwrap();
    eventually(|| node1.tasks_count() == 0).await;

    let third = node2.start_task(my_lock_task("third", None)).await.unwrap();
    assert!(third.is_some());
    eventually(|| node2.tasks_count() == 0).await;

    // Only the started tasks have records
    let records = store.get_prefix("task/1/", RangeOptions::default()).await.unwrap();
    let tasks: Vec<Task> = records
        .kvs
        .iter()
        .map(|kv| serde_json::from_slice(&kv.value).unwrap())
        .collect();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.is_successful()));

    node1.shutdown().await;
    node2.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_run_at_most_one_task() {
    let store = MemStore::new();
    let mut nodes = vec![];
    for i in 0..3 {
        nodes.push(start_node(&store, &format!("node{i}")).await);
    }

    let started = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];
    for (i, node) in nodes.iter().enumerate() {
        for j in 0..5 {
            let node = node.clone();
            let started = started.clone();
            handles.push(tokio::spawn(async move {
                let cfg = TaskConfig::new(TaskKey::new(1, format!("t-{i}-{j}")), "some.task", |_| async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(String::new())
                })
                .with_lock("my-lock");
                if node.start_task(cfg).await.unwrap().is_some() {
                    started.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(started.load(Ordering::SeqCst), 1);
    for node in &nodes {
        eventually(|| node.tasks_count() == 0).await;
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_crashed_node_releases_lock_with_lease() {
    let store = MemStore::new();
    let node1 = start_node(&store, "node1").await;
    let node2 = start_node(&store, "node2").await;

    let (_never_released, release_rx) = oneshot::channel();
    node1
        .start_task(my_lock_task("first", Some(release_rx)))
        .await
        .unwrap()
        .unwrap();
    assert!(node2.start_task(my_lock_task("second", None)).await.unwrap().is_none());

    // The lease of node1 is gone, as after a crash
    let lease = node1.session().session().unwrap();
    store.expire_lease(lease.id()).unwrap();

    assert!(node2.start_task(my_lock_task("third", None)).await.unwrap().is_some());
    eventually(|| node2.tasks_count() == 0).await;
    node2.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_finished_after_lost_lease_keeps_lock_of_new_holder() {
    let store = MemStore::new();
    let node1 = start_node(&store, "node1").await;
    let node2 = start_node(&store, "node2").await;
    let node3 = start_node(&store, "node3").await;

    let (release1_tx, release1_rx) = oneshot::channel();
    let first = node1
        .start_task(my_lock_task("first", Some(release1_rx)))
        .await
        .unwrap()
        .unwrap();

    let lease = node1.session().session().unwrap();
    store.expire_lease(lease.id()).unwrap();

    let (release2_tx, release2_rx) = oneshot::channel();
    let second = node2
        .start_task(my_lock_task("second", Some(release2_rx)))
        .await
        .unwrap()
        .expect("lock of the expired lease is free");

    // The task of node1 finishes while node2 holds the lock
    release1_tx.send(()).unwrap();
    eventually(|| node1.tasks_count() == 0).await;

    let lock = store.get(&second.lock).await.unwrap();
    assert_eq!(&lock.kvs[0].value[..], b"node2");
    assert!(node3.start_task(my_lock_task("third", None)).await.unwrap().is_none());

    // The record of node1 is still finished
    let record = store.get(&format!("task/{}", first.key)).await.unwrap();
    let finished: Task = serde_json::from_slice(&record.kvs[0].value).unwrap();
    assert!(finished.is_successful());

    release2_tx.send(()).unwrap();
    eventually(|| node2.tasks_count() == 0).await;
    assert!(store.get(&second.lock).await.unwrap().kvs.is_empty());
    assert!(node3.start_task(my_lock_task("fourth", None)).await.unwrap().is_some());
    eventually(|| node3.tasks_count() == 0).await;

    node1.shutdown().await;
    node2.shutdown().await;
    node3.shutdown().await;
}
