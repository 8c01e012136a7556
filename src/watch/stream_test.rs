use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::*;
use crate::store::KvStore;
use crate::store::MemStore;
use crate::store::PutOptions;
use crate::store::Txn;
use crate::store::TxnOp;
use crate::Error;
use crate::StoreError;

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

async fn next(stream: &mut WatchStream) -> WatchResponse {
    tokio::time::timeout(Duration::from_secs(30), stream.recv())
        .await
        .expect("timeout waiting for watch response")
        .expect("stream closed")
}

fn keys(events: &[WatchEvent]) -> Vec<String> {
    events.iter().map(|e| format!("{} {}", e.kind, e.key)).collect()
}

fn setup(
    store: &MemStore,
    prev_kv: bool,
) -> (WatchStream, CancellationToken, TaskTracker) {
    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();
    let stream = WatchStream::get_all_and_watch(
        Arc::new(store.clone()) as Arc<dyn KvStore>,
        "my/prefix/",
        WatchStreamOptions {
            prev_kv,
            ..Default::default()
        },
        &tracker,
        cancel.clone(),
    );
    (stream, cancel, tracker)
}

#[tokio::test]
async fn test_get_all_and_watch_streams_state_then_changes() {
    let store = MemStore::new();
    store.put("my/prefix/key1", b("v1"), PutOptions::default()).await.unwrap();
    store.put("my/prefix/key2", b("v2"), PutOptions::default()).await.unwrap();
    store.put("other/key", b("x"), PutOptions::default()).await.unwrap();

    let (mut stream, cancel, tracker) = setup(&store, true);

    match next(&mut stream).await {
        WatchResponse::Events { header, events, restart } => {
            assert!(!restart);
            assert_eq!(header.revision, 3);
            assert_eq!(keys(&events), vec!["create my/prefix/key1", "create my/prefix/key2"]);
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert!(matches!(next(&mut stream).await, WatchResponse::Created { .. }));

    store.put("my/prefix/key3", b("v3"), PutOptions::default()).await.unwrap();
    store.put("my/prefix/key3", b("v4"), PutOptions::default()).await.unwrap();
    store.delete("my/prefix/key3", false).await.unwrap();

    let mut seen = vec![];
    for _ in 0..3 {
        if let WatchResponse::Events { events, restart, .. } = next(&mut stream).await {
            assert!(!restart);
            seen.push(events.into_iter().next().unwrap());
        }
    }
    assert_eq!(seen[0].kind, EventKind::Create);
    assert_eq!(seen[1].kind, EventKind::Update);
    assert_eq!(seen[1].prev_value, Some(b("v3")));
    assert_eq!(seen[2].kind, EventKind::Delete);
    assert_eq!(seen[2].value, b("v4"), "delete carries the previous value");

    cancel.cancel();
    tracker.close();
    tracker.wait().await;
}

#[tokio::test]
async fn test_get_all_pages_are_delivered_as_one_batch() {
    let store = MemStore::new();
    for i in 0..250 {
        store.put(&format!("my/prefix/{i:04}"), b("v"), PutOptions::default()).await.unwrap();
    }
    let (mut stream, cancel, _tracker) = setup(&store, false);

    match next(&mut stream).await {
        WatchResponse::Events { events, header, .. } => {
            assert_eq!(events.len(), 250);
            assert_eq!(header.revision, 250);
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert!(matches!(next(&mut stream).await, WatchResponse::Created { header } if header.revision == 250));
    cancel.cancel();
}

#[tokio::test]
async fn test_empty_prefix_starts_with_created() {
    let store = MemStore::new();
    let (mut stream, cancel, _tracker) = setup(&store, false);
    assert!(matches!(next(&mut stream).await, WatchResponse::Created { .. }));
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_compaction_restarts_with_full_state() {
    let store = MemStore::new();
    store.put("my/prefix/key1", b("v1"), PutOptions::default()).await.unwrap();
    let (mut stream, cancel, _tracker) = setup(&store, false);
    assert!(matches!(next(&mut stream).await, WatchResponse::Events { .. }));
    assert!(matches!(next(&mut stream).await, WatchResponse::Created { .. }));

    store.put("my/prefix/key2", b("v2"), PutOptions::default()).await.unwrap();
    store.put("my/prefix/key3", b("v3"), PutOptions::default()).await.unwrap();
    assert!(matches!(next(&mut stream).await, WatchResponse::Events { .. }));
    assert!(matches!(next(&mut stream).await, WatchResponse::Events { .. }));

    let rev = store.revision();
    store.compact(rev).unwrap();
    store.cancel_watchers(Some(StoreError::Compacted {
        requested: rev,
        compact_revision: rev,
    }));

    assert!(matches!(
        next(&mut stream).await,
        WatchResponse::Err(Error::Watch(crate::WatchError::Stream(StoreError::Compacted { .. })))
    ));
    match next(&mut stream).await {
        WatchResponse::Restarted { cause, delay } => {
            assert!(cause.starts_with("unexpected restart, backoff delay"), "{cause}");
            assert!(cause.contains("has been compacted"), "{cause}");
            assert!(delay <= Duration::from_millis(60));
        }
        other => panic!("unexpected: {other:?}"),
    }
    match next(&mut stream).await {
        WatchResponse::Events { events, restart, .. } => {
            assert!(restart);
            assert_eq!(
                keys(&events),
                vec!["create my/prefix/key1", "create my/prefix/key2", "create my/prefix/key3"]
            );
        }
        other => panic!("unexpected: {other:?}"),
    }

    // Created is not repeated, following batches are regular again
    store.put("my/prefix/key4", b("v4"), PutOptions::default()).await.unwrap();
    match next(&mut stream).await {
        WatchResponse::Events { events, restart, .. } => {
            assert!(!restart);
            assert_eq!(keys(&events), vec!["create my/prefix/key4"]);
        }
        other => panic!("unexpected: {other:?}"),
    }
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_manual_restart_sends_empty_restart_batch() {
    let store = MemStore::new();
    let (mut stream, cancel, _tracker) = setup(&store, false);
    assert!(matches!(next(&mut stream).await, WatchResponse::Created { .. }));

    stream.restart("test restart");

    match next(&mut stream).await {
        WatchResponse::Restarted { cause, .. } => assert_eq!(cause, "manual restart: test restart"),
        other => panic!("unexpected: {other:?}"),
    }
    match next(&mut stream).await {
        WatchResponse::Events { events, restart, .. } => {
            assert!(restart);
            assert!(events.is_empty());
        }
        other => panic!("unexpected: {other:?}"),
    }
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_closed_watch_channel_restarts_stream() {
    let store = MemStore::new();
    store.put("my/prefix/a", b("1"), PutOptions::default()).await.unwrap();
    let (mut stream, cancel, _tracker) = setup(&store, false);
    next(&mut stream).await;
    next(&mut stream).await;

    store.cancel_watchers(None);

    match next(&mut stream).await {
        WatchResponse::Restarted { cause, .. } => assert!(cause.contains("watch channel closed"), "{cause}"),
        other => panic!("unexpected: {other:?}"),
    }
    assert!(matches!(next(&mut stream).await, WatchResponse::Events { restart: true, .. }));
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_init_errors_after_first_created_are_retried() {
    let store = MemStore::new();
    let (mut stream, cancel, _tracker) = setup(&store, false);
    assert!(matches!(next(&mut stream).await, WatchResponse::Created { .. }));

    store.set_unavailable(Some("network partition"));
    store.cancel_watchers(None);

    assert!(matches!(next(&mut stream).await, WatchResponse::Restarted { .. }));
    // The re-created attempt fails, it is reported as a common error
    assert!(matches!(
        next(&mut stream).await,
        WatchResponse::Err(Error::Store(StoreError::Unavailable(_)))
    ));
    store.set_unavailable(None);

    loop {
        match next(&mut stream).await {
            WatchResponse::Events { restart: true, .. } => break,
            WatchResponse::Err(_) | WatchResponse::Restarted { .. } => continue,
            other => panic!("unexpected: {other:?}"),
        }
    }
    cancel.cancel();
}

#[tokio::test]
async fn test_first_attempt_failure_is_init_error() {
    let store = MemStore::new();
    store.set_unavailable(Some("down"));
    let (mut stream, _cancel, _tracker) = setup(&store, false);

    assert!(matches!(
        next(&mut stream).await,
        WatchResponse::InitErr(Error::Watch(crate::WatchError::Init(_)))
    ));
    assert!(stream.recv().await.is_none());
}

#[tokio::test]
async fn test_events_of_one_revision_are_sorted() {
    let store = MemStore::new();
    store.put("my/prefix/c", b("1"), PutOptions::default()).await.unwrap();
    let (mut stream, cancel, _tracker) = setup(&store, false);
    next(&mut stream).await;
    next(&mut stream).await;

    store
        .txn(Txn::new().and_then([
            TxnOp::delete("my/prefix/c"),
            TxnOp::put("my/prefix/b", b("2"), PutOptions::default()),
            TxnOp::put("my/prefix/a", b("3"), PutOptions::default()),
        ]))
        .await
        .unwrap();

    match next(&mut stream).await {
        WatchResponse::Events { events, .. } => {
            assert_eq!(
                keys(&events),
                vec!["create my/prefix/a", "create my/prefix/b", "delete my/prefix/c"]
            );
        }
        other => panic!("unexpected: {other:?}"),
    }
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_plain_watch_resumes_after_last_revision() {
    let store = MemStore::new();
    store.put("my/prefix/old", b("1"), PutOptions::default()).await.unwrap();

    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();
    let mut stream = WatchStream::watch(
        Arc::new(store.clone()),
        "my/prefix/",
        WatchStreamOptions::default(),
        &tracker,
        cancel.clone(),
    );
    assert!(matches!(next(&mut stream).await, WatchResponse::Created { .. }));

    store.put("my/prefix/a", b("1"), PutOptions::default()).await.unwrap();
    assert!(matches!(next(&mut stream).await, WatchResponse::Events { .. }));

    store.cancel_watchers(None);
    store.put("my/prefix/b", b("1"), PutOptions::default()).await.unwrap();

    assert!(matches!(next(&mut stream).await, WatchResponse::Restarted { .. }));
    match next(&mut stream).await {
        WatchResponse::Events { events, restart, .. } => {
            assert!(!restart);
            assert_eq!(keys(&events), vec!["create my/prefix/b"]);
        }
        other => panic!("unexpected: {other:?}"),
    }
    cancel.cancel();
}

#[tokio::test]
async fn test_cancel_closes_stream() {
    let store = MemStore::new();
    let (mut stream, cancel, tracker) = setup(&store, false);
    next(&mut stream).await;

    cancel.cancel();
    assert!(stream.recv().await.is_none());
    tracker.close();
    tracker.wait().await;
}
