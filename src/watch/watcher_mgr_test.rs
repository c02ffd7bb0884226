use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::WatcherMgr;
use crate::Error;
use crate::WatchError;

const WAIT: Duration = Duration::from_secs(5);

fn new_mgr(
    parent: &CancellationToken,
    snapshot: Option<Vec<u32>>,
) -> Arc<WatcherMgr<u32>> {
    WatcherMgr::new("svc", 1, 4, parent, snapshot)
}

#[tokio::test]
async fn test_fork_ids_are_monotonic() {
    let parent = CancellationToken::new();
    let mgr = new_mgr(&parent, Some(vec![]));

    let w1 = mgr.fork().expect("should fork");
    let w2 = mgr.fork().expect("should fork");
    let w3 = mgr.fork().expect("should fork");
    assert!(w1.id() < w2.id());
    assert!(w2.id() < w3.id());
    assert_eq!(mgr.fork_count(), 3);
}

#[tokio::test]
async fn test_first_next_returns_snapshot_immediately() {
    let parent = CancellationToken::new();
    let mgr = new_mgr(&parent, Some(vec![7, 8]));

    let mut watcher = mgr.fork().expect("should fork");
    let events = timeout(WAIT, watcher.next())
        .await
        .expect("should not block")
        .expect("should succeed");
    assert_eq!(events, vec![7, 8]);
}

#[tokio::test]
async fn test_broadcast_reaches_every_fork_in_order() {
    let parent = CancellationToken::new();
    let mgr = new_mgr(&parent, None);

    let mut w1 = mgr.fork().expect("should fork");
    let mut w2 = mgr.fork().expect("should fork");

    mgr.broadcast(vec![1]).await;
    mgr.broadcast(vec![2, 3]).await;

    for watcher in [&mut w1, &mut w2] {
        let first = timeout(WAIT, watcher.next()).await.expect("should succeed");
        assert_eq!(first.expect("should succeed"), vec![1]);
        let second = timeout(WAIT, watcher.next()).await.expect("should succeed");
        assert_eq!(second.expect("should succeed"), vec![2, 3]);
    }
}

#[tokio::test]
async fn test_fork_without_snapshot_blocks_until_broadcast() {
    let parent = CancellationToken::new();
    let mgr = new_mgr(&parent, None);
    let mut watcher = mgr.fork().expect("should fork");

    // Nothing broadcast yet; the first next must not resolve
    assert!(timeout(Duration::from_millis(50), watcher.next()).await.is_err());

    mgr.broadcast(vec![9]).await;
    let events = timeout(WAIT, watcher.next())
        .await
        .expect("should succeed")
        .expect("should succeed");
    assert_eq!(events, vec![9]);
}

#[tokio::test]
async fn test_last_recycle_closes_manager_and_runs_on_close() {
    let parent = CancellationToken::new();
    let mgr = new_mgr(&parent, Some(vec![]));

    let closed = Arc::new(AtomicUsize::new(0));
    let counter = closed.clone();
    mgr.set_on_close(Box::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let mut w1 = mgr.fork().expect("should fork");
    let mut w2 = mgr.fork().expect("should fork");

    w1.stop().expect("should succeed");
    assert!(!mgr.is_closed());
    assert!(!mgr.token().is_cancelled());
    assert_eq!(closed.load(Ordering::SeqCst), 0);

    w2.stop().expect("should succeed");
    assert!(mgr.is_closed());
    assert!(mgr.token().is_cancelled());
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    // A recycled manager refuses new forks
    assert!(mgr.fork().is_none());
}

#[tokio::test]
async fn test_subscription_scope_lives_iff_a_fork_does() {
    let parent = CancellationToken::new();
    let mgr = new_mgr(&parent, Some(vec![]));

    // Stand-in for the upstream subscription loop
    let loop_done = Arc::new(AtomicUsize::new(0));
    let done = loop_done.clone();
    let token = mgr.token().clone();
    tokio::spawn(async move {
        token.cancelled().await;
        done.fetch_add(1, Ordering::SeqCst);
    });

    let mut fork_a = mgr.fork().expect("should fork");
    let mut fork_b = mgr.fork().expect("should fork");
    fork_a.stop().expect("should succeed");
    fork_b.stop().expect("should succeed");

    // Loop must observe cancellation once the table empties
    timeout(WAIT, async {
        while loop_done.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("subscription loop should exit");
}

#[tokio::test]
async fn test_stop_is_idempotent_and_next_after_stop_errors() {
    let parent = CancellationToken::new();
    let mgr = new_mgr(&parent, Some(vec![1]));

    let mut watcher = mgr.fork().expect("should fork");
    watcher.stop().expect("should succeed");
    watcher.stop().expect("should succeed");

    match watcher.next().await {
        Err(Error::Watch(WatchError::Canceled)) => {}
        other => panic!("expected Canceled, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dropping_a_watcher_recycles_its_fork() {
    let parent = CancellationToken::new();
    let mgr = new_mgr(&parent, Some(vec![]));

    let watcher = mgr.fork().expect("should fork");
    assert_eq!(mgr.fork_count(), 1);
    drop(watcher);
    assert_eq!(mgr.fork_count(), 0);
    assert!(mgr.is_closed());
}

#[tokio::test]
async fn test_parent_cancellation_unblocks_pending_next() {
    let parent = CancellationToken::new();
    let mgr = new_mgr(&parent, None);
    let mut watcher = mgr.fork().expect("should fork");

    let handle = tokio::spawn(async move { watcher.next().await });
    tokio::task::yield_now().await;
    parent.cancel();

    let result = timeout(WAIT, handle).await.expect("should succeed").expect("join");
    match result {
        Err(Error::Watch(WatchError::Canceled)) => {}
        other => panic!("expected Canceled, got {:?}", other),
    }
}

#[tokio::test]
async fn test_slow_fork_backpressures_broadcaster_until_stopped() {
    let parent = CancellationToken::new();
    // Capacity 1: the second undrained broadcast must block
    let mgr: Arc<WatcherMgr<u32>> = WatcherMgr::new("svc", 1, 1, &parent, None);

    let mut stalled = mgr.fork().expect("should fork");
    let mut healthy = mgr.fork().expect("should fork");

    mgr.broadcast(vec![1]).await;
    // The healthy consumer keeps draining; the stalled one never does
    let events = timeout(WAIT, healthy.next())
        .await
        .expect("should succeed")
        .expect("should succeed");
    assert_eq!(events, vec![1]);

    let broadcaster = {
        let mgr = mgr.clone();
        tokio::spawn(async move { mgr.broadcast(vec![2]).await })
    };
    tokio::task::yield_now().await;
    assert!(!broadcaster.is_finished());

    // The stalled fork's full queue is the only thing holding the
    // broadcast; stopping it drops the receiver and releases it
    stalled.stop().expect("should succeed");
    timeout(WAIT, broadcaster)
        .await
        .expect("broadcast should unblock")
        .expect("join");

    let events = timeout(WAIT, healthy.next())
        .await
        .expect("should succeed")
        .expect("should succeed");
    assert_eq!(events, vec![2]);
}
