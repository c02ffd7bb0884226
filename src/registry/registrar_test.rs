use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::Registrar;
use crate::JsonCodec;
use crate::MockStore;
use crate::RegistryConfig;
use crate::ServiceInstance;
use crate::Store;
use crate::StoreError;

fn test_instance() -> ServiceInstance {
    ServiceInstance::with_id("n1", "node", "node").with_endpoint("grpc://127.0.0.1:9000")
}

fn new_registrar(store: Arc<dyn Store>) -> Arc<Registrar> {
    Registrar::new(
        store,
        Arc::new(JsonCodec),
        RegistryConfig::default(),
        &CancellationToken::new(),
    )
}

#[tokio::test]
async fn test_register_puts_record_with_lease() {
    let mut mock = MockStore::new();
    mock.expect_put()
        .withf(|key, value, ttl| {
            key == "gridlink/services/node/n1"
                && !value.is_empty()
                && *ttl == Some(Duration::from_secs(10))
        })
        .returning(|_, _, _| Ok(Some(7)));

    let registrar = new_registrar(Arc::new(mock));
    registrar.register(test_instance()).await.expect("should succeed");
    assert_eq!(registrar.current_lease().await, Some(7));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_renews_on_half_ttl_cadence() {
    let renews = Arc::new(AtomicUsize::new(0));
    let counter = renews.clone();

    let mut mock = MockStore::new();
    mock.expect_put().returning(|_, _, _| Ok(Some(1)));
    mock.expect_renew().returning(move |lease| {
        assert_eq!(lease, 1);
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let registrar = new_registrar(Arc::new(mock));
    registrar.register(test_instance()).await.expect("should succeed");

    // Default TTL is 10s, so the heartbeat ticks every 5s
    sleep(Duration::from_secs(11)).await;
    let observed = renews.load(Ordering::SeqCst);
    assert!((2..=3).contains(&observed), "observed {} renewals", observed);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_renewals_trigger_reregistration() {
    let puts = Arc::new(AtomicU64::new(0));
    let put_counter = puts.clone();
    let renews = Arc::new(AtomicUsize::new(0));
    let renew_counter = renews.clone();

    let mut mock = MockStore::new();
    mock.expect_put().returning(move |_, _, _| {
        let lease = put_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(lease))
    });
    // Every renewal times out; the retry budget must give way to a
    // fresh put
    mock.expect_renew().returning(move |_| {
        renew_counter.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Timeout(Duration::from_millis(10)).into())
    });

    let registrar = new_registrar(Arc::new(mock));
    registrar.register(test_instance()).await.expect("should succeed");
    assert_eq!(registrar.current_lease().await, Some(1));

    // One heartbeat (5s) plus the retry backoffs (3 x 500ms)
    sleep(Duration::from_secs(7)).await;

    assert!(renews.load(Ordering::SeqCst) >= 3);
    assert!(puts.load(Ordering::SeqCst) >= 2);
    let lease = registrar.current_lease().await.expect("lease expected");
    assert!(lease > 1, "expected a fresh lease, got {}", lease);
}

#[tokio::test(start_paused = true)]
async fn test_untracked_lease_reregisters_without_retrying() {
    let puts = Arc::new(AtomicU64::new(0));
    let put_counter = puts.clone();
    let renews = Arc::new(AtomicUsize::new(0));
    let renew_counter = renews.clone();

    let mut mock = MockStore::new();
    mock.expect_put().returning(move |_, _, _| {
        let lease = put_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(lease))
    });
    mock.expect_renew().returning(move |lease| {
        renew_counter.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::LeaseNotFound(lease).into())
    });

    let registrar = new_registrar(Arc::new(mock));
    registrar.register(test_instance()).await.expect("should succeed");

    // Just past the first heartbeat, well inside the retry backoff window
    sleep(Duration::from_millis(5100)).await;

    assert_eq!(renews.load(Ordering::SeqCst), 1);
    assert!(puts.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_deregister_is_idempotent() {
    let deletes = Arc::new(AtomicUsize::new(0));
    let delete_counter = deletes.clone();

    let mut mock = MockStore::new();
    mock.expect_put().returning(|_, _, _| Ok(Some(1)));
    mock.expect_delete()
        .withf(|key| key == "gridlink/services/node/n1")
        .returning(move |_| {
            delete_counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

    let registrar = new_registrar(Arc::new(mock));
    registrar.register(test_instance()).await.expect("should succeed");

    registrar.deregister().await.expect("should succeed");
    registrar.deregister().await.expect("should succeed");
    assert_eq!(deletes.load(Ordering::SeqCst), 1);
    assert_eq!(registrar.current_lease().await, None);
}

#[tokio::test(start_paused = true)]
async fn test_deregistered_registrar_stops_renewing() {
    let renews = Arc::new(AtomicUsize::new(0));
    let counter = renews.clone();

    let mut mock = MockStore::new();
    mock.expect_put().returning(|_, _, _| Ok(Some(1)));
    mock.expect_delete().returning(|_| Ok(()));
    mock.expect_renew().returning(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let registrar = new_registrar(Arc::new(mock));
    registrar.register(test_instance()).await.expect("should succeed");
    registrar.deregister().await.expect("should succeed");

    sleep(Duration::from_secs(30)).await;
    assert_eq!(renews.load(Ordering::SeqCst), 0);
}
