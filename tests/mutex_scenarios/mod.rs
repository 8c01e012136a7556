use std::sync::Arc;
use std::time::Duration;

use d_coord::session::Session;
use d_coord::store::KvStore;
use d_coord::store::MemStore;
use d_coord::store::PutOptions;
use d_coord::store::Txn;
use d_coord::store::TxnOp;
use d_coord::SessionConfig;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

async fn session(
    store: &MemStore,
    tracker: &TaskTracker,
    cancel: &CancellationToken,
) -> Session {
    Session::builder(Arc::new(store.clone()) as Arc<dyn KvStore>, SessionConfig::default())
        .start_or_err(tracker, cancel.clone())
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_holders_share_one_store_lock() {
    let store = MemStore::new();
    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();
    let session = session(&store, &tracker, &cancel).await;

    let before = store.revision();
    let holders = Arc::new(Mutex::new(0usize));
    let mut handles = vec![];
    for _ in 0..20 {
        let session = session.clone();
        let cancel = cancel.clone();
        let holders = holders.clone();
        handles.push(tokio::spawn(async move {
            let mut mutex = session.new_mutex("shared/lock");
            mutex.lock(&cancel).await.unwrap();
            {
                let mut h = holders.lock();
                *h += 1;
                assert_eq!(*h, 1, "one local holder at a time");
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
            *holders.lock() -= 1;
            mutex.unlock().await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    // One acquisition and one release in the store
    assert_eq!(store.revision() - before, 2);
    cancel.cancel();
    tracker.close();
    tracker.wait().await;
}

#[tokio::test]
async fn test_fenced_write_fails_after_lock_lost() {
    let store = MemStore::new();
    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();
    let session1 = session(&store, &tracker, &cancel).await;
    let session2 = session(&store, &tracker, &cancel).await;

    let mut m1 = session1.new_mutex("fenced");
    m1.lock(&cancel).await.unwrap();
    let guard = m1.is_owner();
    assert!(guard.is_some());

    // Lease of the holder expires, another session takes over
    store.expire_lease(session1.session().unwrap().id()).unwrap();
    let mut m2 = session2.new_mutex("fenced");
    m2.lock(&cancel).await.unwrap();

    let resp = store
        .txn(Txn::new().when(guard).and_then([TxnOp::put("protected", "v", PutOptions::default())]))
        .await
        .unwrap();
    assert!(!resp.succeeded, "stale holder must not write");

    m2.unlock().await.unwrap();
    cancel.cancel();
}
