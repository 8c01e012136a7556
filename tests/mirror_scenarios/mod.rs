use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use d_coord::mirror::MirrorTree;
use d_coord::store::KvStore;
use d_coord::store::MemStore;
use d_coord::store::PutOptions;
use d_coord::store::Txn;
use d_coord::store::TxnOp;
use d_coord::watch::WatchStream;
use d_coord::watch::WatchStreamOptions;
use d_coord::StoreError;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::common::eventually;

fn value(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn config_tree(
    store: &MemStore,
    tracker: &TaskTracker,
    cancel: &CancellationToken,
    restarts: Arc<Mutex<usize>>,
) -> MirrorTree<String> {
    let stream = WatchStream::get_all_and_watch(
        Arc::new(store.clone()) as Arc<dyn KvStore>,
        "config/",
        WatchStreamOptions::default(),
        tracker,
        cancel.clone(),
    );
    MirrorTree::builder(
        stream,
        |key, _| key.trim_start_matches("config/").to_string(),
        |_, value, _, _| String::from_utf8_lossy(value).into_owned(),
    )
    .on_update(move |update| {
        if update.restart {
            *restarts.lock() += 1;
        }
    })
    .build()
    .unwrap()
}

#[tokio::test]
async fn test_compaction_restart_replaces_mirror_state() {
    let store = MemStore::new();
    for key in ["key1", "key2", "key3"] {
        store
            .put(&format!("config/{key}"), value(key), PutOptions::default())
            .await
            .unwrap();
    }

    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();
    let restarts = Arc::new(Mutex::new(0));
    let tree = config_tree(&store, &tracker, &cancel, restarts.clone());
    tree.start_mirroring(&tracker).unwrap().await.unwrap().unwrap();
    assert_eq!(tree.all(), vec!["key1", "key2", "key3"]);

    // Changes made while the watcher is down
    store.cancel_watchers(None);
    store.delete("config/key1", false).await.unwrap();
    store.put("config/key2", value("updated"), PutOptions::default()).await.unwrap();
    let last = store.put("config/key4", value("key4"), PutOptions::default()).await.unwrap();
    store.compact(store.revision()).unwrap();

    tree.wait_for_revision(&cancel, last.header.revision).await.unwrap();
    assert_eq!(tree.all(), vec!["updated", "key3", "key4"]);
    assert!(tree.get("key1").is_none());
    eventually(|| *restarts.lock() >= 1).await;

    // The restarted mirror keeps following changes
    let next = store.put("config/key5", value("key5"), PutOptions::default()).await.unwrap();
    tree.wait_for_revision(&cancel, next.header.revision).await.unwrap();
    assert_eq!(tree.len(), 4);

    cancel.cancel();
    tracker.close();
    tracker.wait().await;
}

#[tokio::test]
async fn test_compacted_watch_error_triggers_restart() {
    let store = MemStore::new();
    store.put("config/key1", value("key1"), PutOptions::default()).await.unwrap();

    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();
    let restarts = Arc::new(Mutex::new(0));
    let tree = config_tree(&store, &tracker, &cancel, restarts.clone());
    tree.start_mirroring(&tracker).unwrap().await.unwrap().unwrap();

    let rev = store.revision();
    store.compact(rev).unwrap();
    store.cancel_watchers(Some(StoreError::Compacted {
        requested: rev,
        compact_revision: rev,
    }));

    eventually(|| *restarts.lock() >= 1).await;
    assert_eq!(tree.all(), vec!["key1"]);
    cancel.cancel();
}

#[tokio::test]
async fn test_wait_for_revision_is_monotonic() {
    let store = MemStore::new();
    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();
    let tree = Arc::new(config_tree(&store, &tracker, &cancel, Arc::new(Mutex::new(0))));
    tree.start_mirroring(&tracker).unwrap().await.unwrap().unwrap();

    let target = store.revision() + 3;
    let waiter = {
        let tree = tree.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tree.wait_for_revision(&cancel, target).await.unwrap();
            tree.revision()
        })
    };

    for key in ["key1", "key2", "key3"] {
        tokio::time::sleep(Duration::from_millis(5)).await;
        store
            .put(&format!("config/{key}"), value(key), PutOptions::default())
            .await
            .unwrap();
    }
    let observed = waiter.await.unwrap();
    assert!(observed >= target);

    // Already reached revisions return immediately
    tree.wait_for_revision(&cancel, target - 2).await.unwrap();
    assert!(tree.revision() >= observed);
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_see_partial_transactions() {
    let store = MemStore::new();
    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();
    let tree = Arc::new(config_tree(&store, &tracker, &cancel, Arc::new(Mutex::new(0))));
    tree.start_mirroring(&tracker).unwrap().await.unwrap().unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let tree = tree.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut reads = 0;
            while !done.load(Ordering::SeqCst) {
                let snapshot = tree.to_map();
                let generations: Vec<&String> = snapshot.values().collect();
                assert!(
                    snapshot.is_empty() || snapshot.len() == 10,
                    "partial batch: {snapshot:?}"
                );
                assert!(
                    generations.windows(2).all(|w| w[0] == w[1]),
                    "mixed generations: {snapshot:?}"
                );
                reads += 1;
                tokio::task::yield_now().await;
            }
            reads
        })
    };

    let mut last = 0;
    for generation in 0..50 {
        let ops = (0..10).map(|i| {
            TxnOp::put(
                format!("config/key{i}"),
                value(&format!("gen{generation}")),
                PutOptions::default(),
            )
        });
        last = store.txn(Txn::new().and_then(ops)).await.unwrap().header.revision;
        tokio::task::yield_now().await;
    }
    tree.wait_for_revision(&cancel, last).await.unwrap();
    done.store(true, Ordering::SeqCst);

    assert!(reader.await.unwrap() > 0);
    assert!(tree.all().iter().all(|v| v == "gen49"));
    cancel.cancel();
}

#[tokio::test]
async fn test_manual_restart_rebuilds_same_state() {
    let store = MemStore::new();
    store.put("config/key1", value("key1"), PutOptions::default()).await.unwrap();

    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();
    let restarts = Arc::new(Mutex::new(0));
    let tree = config_tree(&store, &tracker, &cancel, restarts.clone());
    tree.start_mirroring(&tracker).unwrap().await.unwrap().unwrap();

    store.put("config/key2", value("key2"), PutOptions::default()).await.unwrap();
    store.put("config/key1", value("updated"), PutOptions::default()).await.unwrap();
    store.put("config/dir/key3", value("key3"), PutOptions::default()).await.unwrap();
    let last = store.delete("config/key2", false).await.unwrap();
    tree.wait_for_revision(&cancel, last.header.revision).await.unwrap();
    let before = tree.to_map();

    tree.restart("resync");
    eventually(|| *restarts.lock() >= 1).await;

    assert_eq!(tree.to_map(), before);
    assert_eq!(tree.revision(), last.header.revision);
    cancel.cancel();
}
