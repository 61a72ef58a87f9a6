//! Exercises the ownership handoff protocol through `gardener-core`'s
//! public `Identity`/`LeaseStore` API against `gardener-testing`'s
//! transactional fake store and manual clock, rather than the private
//! `MemStore` the in-module unit tests use.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gardener_core::{Identity, LeaseError};
use gardener_testing::{InMemoryTxnStore, ManualClock};

#[tokio::test]
async fn handoff_transfers_ownership_and_logs_every_transaction() {
    let clock: Arc<ManualClock> = Arc::new(ManualClock::new(Utc::now()));
    let store = InMemoryTxnStore::with_clock(clock.clone());

    let i1 = Identity::with_clock("h1", "i1", clock.clone()).unwrap();
    let i2 = Identity::with_clock("h2", "i2", clock.clone()).unwrap();

    i1.take_ownership_if_available(&store, Duration::from_secs(60))
        .await
        .unwrap();

    i2.request_lease(&store).await.unwrap();

    let err = i1.renew(&store, Duration::from_secs(60)).await.unwrap_err();
    assert!(matches!(err, LeaseError::OwnershipRequested));

    // i1's renew shortened the lease to "now"; advance past it so i2 can
    // actually take ownership, without any real sleep.
    clock.advance(chrono::Duration::seconds(1));

    i2.take_ownership_if_available(&store, Duration::from_secs(60))
        .await
        .unwrap();

    let err = i1.renew(&store, Duration::from_secs(60)).await.unwrap_err();
    assert!(matches!(err, LeaseError::LostLease));

    i2.delete_lease(&store).await.unwrap();

    // take, renew(OwnershipRequested), take, renew(LostLease), delete.
    assert_eq!(store.log().len(), 5);
}

#[tokio::test]
async fn renewal_survives_an_injected_store_failure_on_retry() {
    let store = InMemoryTxnStore::new();
    let i1 = Identity::new("h1", "i1").unwrap();

    i1.take_ownership_if_available(&store, Duration::from_secs(60))
        .await
        .unwrap();

    store.fail_next_transaction(1);
    assert!(i1.renew(&store, Duration::from_secs(60)).await.is_err());

    // The store is healthy again; a retried renew succeeds.
    i1.renew(&store, Duration::from_secs(60)).await.unwrap();
}
