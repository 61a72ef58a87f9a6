//! Single-leader election via a leased, persisted record with cooperative
//! handoff. The protocol is generic over a
//! [`LeaseStore`] -- a transactional key-value capability -- so it can run
//! against a Postgres-backed store in production and an in-memory fake in
//! tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::LeaseError;

/// The persisted lease record. At most one exists in the store at any
/// time, under the single key the store implementation is configured
/// with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerLease {
    pub hostname: String,
    pub instance_id: String,
    pub lease_expiration: DateTime<Utc>,
    /// Non-empty indicates a pending handoff request from that instance.
    pub new_instance_id: String,
}

impl OwnerLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expiration <= now
    }
}

/// A transactional key-value capability: reads and writes of the single
/// lease record must be atomic with respect to other callers. Implemented
/// by `gardener-persistence`'s Postgres-backed store and by
/// `gardener-testing`'s in-memory fake.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Reads the current lease record, if any, runs `f` against it, and
    /// atomically writes back whatever `f` returns via `LeaseTxn`. The
    /// whole read-modify-write happens under one transaction.
    async fn transact(
        &self,
        f: Box<dyn FnOnce(Option<OwnerLease>) -> LeaseTxn + Send>,
    ) -> anyhow::Result<LeaseTxnOutcome>;
}

/// What a transaction wants done to the record.
pub enum LeaseTxn {
    /// Leave the record as it is observed (used when a transaction
    /// determines no write is needed, e.g. lease not available).
    NoOp(LeaseTxnOutcome),
    /// Write this record.
    Put(OwnerLease, LeaseTxnOutcome),
    /// Delete the record.
    Delete(LeaseTxnOutcome),
}

/// Caller-facing result of a transaction, threaded back out through
/// [`LeaseStore::transact`] so callers don't need a second round trip to
/// learn what happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseTxnOutcome {
    Ok,
    NotAvailable,
    LostLease,
    OwnershipRequested,
    NotOwner,
    NoSuchLease,
}

/// An instance's view of itself, used to drive the lease protocol. Holds
/// no store reference -- callers pass the [`LeaseStore`] into each
/// operation, rather than holding one internally.
///
/// Carries its own [`Clock`] so lease-expiry decisions (`is_expired`,
/// computing a new `lease_expiration`) can be driven deterministically in
/// tests rather than through real sleeps against the wall clock.
#[derive(Clone)]
pub struct Identity {
    pub hostname: String,
    pub instance_id: String,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("hostname", &self.hostname)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

impl Identity {
    pub fn new(hostname: impl Into<String>, instance_id: impl Into<String>) -> Result<Self, LeaseError> {
        Self::with_clock(hostname, instance_id, Arc::new(SystemClock))
    }

    /// As [`Identity::new`], but driven by `clock` instead of the real wall
    /// clock -- how tests get deterministic lease-expiry behavior (see
    /// `gardener_testing::ManualClock`).
    pub fn with_clock(
        hostname: impl Into<String>,
        instance_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LeaseError> {
        let hostname = hostname.into();
        let instance_id = instance_id.into();
        if hostname.is_empty() || instance_id.is_empty() {
            return Err(LeaseError::InvalidState);
        }
        Ok(Identity {
            hostname,
            instance_id,
            clock,
        })
    }

    /// Polling backoff bounds used by [`wait_for_ownership`]. Jittered
    /// 5-15s normally; 1s in test mode.
    fn backoff(&self, test_mode: bool) -> Duration {
        if test_mode {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(5 + fastrand::u64(0..10))
        }
    }

    /// Assumes ownership iff the lease is absent or expired.
    #[instrument(skip(self, store), fields(instance = %self.instance_id))]
    pub async fn take_ownership_if_available(
        &self,
        store: &dyn LeaseStore,
        interval: Duration,
    ) -> Result<(), LeaseError> {
        let me = self.clone();
        let interval_std = interval;
        let outcome = timeout_txn(store, move |current| {
            let now = me.clock.now();
            let available = match &current {
                None => true,
                Some(lease) => lease.is_expired(now),
            };
            if available {
                let lease = OwnerLease {
                    hostname: me.hostname.clone(),
                    instance_id: me.instance_id.clone(),
                    lease_expiration: now + chrono::Duration::from_std(interval_std).unwrap(),
                    new_instance_id: String::new(),
                };
                LeaseTxn::Put(lease, LeaseTxnOutcome::Ok)
            } else {
                LeaseTxn::NoOp(LeaseTxnOutcome::NotAvailable)
            }
        })
        .await
        .map_err(LeaseError::Store)?;

        match outcome {
            LeaseTxnOutcome::Ok => {
                info!("took ownership");
                Ok(())
            }
            LeaseTxnOutcome::NotAvailable => Err(LeaseError::NotAvailable),
            other => Err(unexpected(other)),
        }
    }

    /// Marks the record with our `instance_id` as the challenger, signaling
    /// to the current owner that it should relinquish at its next `renew`.
    /// A no-op if a handoff is already pending.
    pub async fn request_lease(&self, store: &dyn LeaseStore) -> Result<(), LeaseError> {
        let me = self.clone();
        let outcome = timeout_txn(store, move |current| match current {
            None => LeaseTxn::NoOp(LeaseTxnOutcome::NoSuchLease),
            Some(mut lease) => {
                if lease.new_instance_id.is_empty() {
                    lease.new_instance_id = me.instance_id.clone();
                    LeaseTxn::Put(lease, LeaseTxnOutcome::Ok)
                } else {
                    LeaseTxn::NoOp(LeaseTxnOutcome::Ok)
                }
            }
        })
        .await
        .map_err(LeaseError::Store)?;

        match outcome {
            LeaseTxnOutcome::Ok => Ok(()),
            LeaseTxnOutcome::NoSuchLease => Err(LeaseError::InvalidState),
            other => Err(unexpected(other)),
        }
    }

    /// Extends the lease for `interval`, UNLESS another instance has
    /// requested it, in which case this relinquishes early and returns
    /// [`LeaseError::OwnershipRequested`]. Returns
    /// [`LeaseError::LostLease`] if the stored owner no longer matches us
    /// -- the caller MUST stop all operations requiring ownership.
    #[instrument(skip(self, store), fields(instance = %self.instance_id))]
    pub async fn renew(&self, store: &dyn LeaseStore, interval: Duration) -> Result<(), LeaseError> {
        let me = self.clone();
        let outcome = timeout_txn(store, move |current| {
            let now = me.clock.now();
            let mut lease = match current {
                None => return LeaseTxn::NoOp(LeaseTxnOutcome::LostLease),
                Some(l) => l,
            };
            if lease.hostname != me.hostname || lease.instance_id != me.instance_id {
                return LeaseTxn::NoOp(LeaseTxnOutcome::LostLease);
            }
            if !lease.new_instance_id.is_empty() {
                if lease.lease_expiration > now {
                    lease.lease_expiration = now;
                    return LeaseTxn::Put(lease, LeaseTxnOutcome::OwnershipRequested);
                }
                return LeaseTxn::NoOp(LeaseTxnOutcome::OwnershipRequested);
            }
            lease.lease_expiration = now + chrono::Duration::from_std(interval).unwrap();
            LeaseTxn::Put(lease, LeaseTxnOutcome::Ok)
        })
        .await
        .map_err(LeaseError::Store)?;

        match outcome {
            LeaseTxnOutcome::Ok => Ok(()),
            LeaseTxnOutcome::LostLease => {
                warn!("lost ownership lease");
                Err(LeaseError::LostLease)
            }
            LeaseTxnOutcome::OwnershipRequested => {
                info!("relinquishing ownership: handoff requested");
                Err(LeaseError::OwnershipRequested)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Polls [`take_ownership_if_available`] with jittered backoff until
    /// success or a 2-minute ceiling.
    pub async fn wait_for_ownership(
        &self,
        store: &dyn LeaseStore,
        interval: Duration,
        test_mode: bool,
    ) -> Result<(), LeaseError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
        loop {
            match self.take_ownership_if_available(store, interval).await {
                Ok(()) => return Ok(()),
                Err(LeaseError::NotAvailable) => {}
                Err(other) => return Err(other),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LeaseError::NotAvailable);
            }
            tokio::time::sleep(self.backoff(test_mode)).await;
        }
    }

    /// Attempts to take the lease outright; on contention, requests a
    /// handoff and waits for it.
    pub async fn take_ownership(
        &self,
        store: &dyn LeaseStore,
        interval: Duration,
        test_mode: bool,
    ) -> Result<(), LeaseError> {
        match self.take_ownership_if_available(store, interval).await {
            Ok(()) => return Ok(()),
            Err(LeaseError::NotAvailable) => {}
            Err(other) => return Err(other),
        }
        self.request_lease(store).await?;
        self.wait_for_ownership(store, interval, test_mode).await
    }

    /// Deletes the lease record iff we are the recorded owner.
    pub async fn delete_lease(&self, store: &dyn LeaseStore) -> Result<(), LeaseError> {
        let me = self.clone();
        let outcome = timeout_txn(store, move |current| match current {
            None => LeaseTxn::NoOp(LeaseTxnOutcome::NotOwner),
            Some(lease) => {
                if lease.hostname == me.hostname && lease.instance_id == me.instance_id {
                    LeaseTxn::Delete(LeaseTxnOutcome::Ok)
                } else {
                    LeaseTxn::NoOp(LeaseTxnOutcome::NotOwner)
                }
            }
        })
        .await
        .map_err(LeaseError::Store)?;

        match outcome {
            LeaseTxnOutcome::Ok => Ok(()),
            LeaseTxnOutcome::NotOwner => Err(LeaseError::NotOwner),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(outcome: LeaseTxnOutcome) -> LeaseError {
    LeaseError::Store(anyhow::anyhow!("unexpected lease transaction outcome: {outcome:?}"))
}

/// All lease transactions run under a 10-second deadline.
async fn timeout_txn(
    store: &dyn LeaseStore,
    f: impl FnOnce(Option<OwnerLease>) -> LeaseTxn + Send + 'static,
) -> anyhow::Result<LeaseTxnOutcome> {
    tokio::time::timeout(Duration::from_secs(10), store.transact(Box::new(f)))
        .await
        .map_err(|_| anyhow::anyhow!("lease transaction timed out after 10s"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// A simple in-process `LeaseStore` good enough to exercise the
    /// protocol's handoff logic without pulling in a real database.
    #[derive(Default)]
    struct MemStore(StdMutex<Option<OwnerLease>>);

    #[async_trait]
    impl LeaseStore for MemStore {
        async fn transact(
            &self,
            f: Box<dyn FnOnce(Option<OwnerLease>) -> LeaseTxn + Send>,
        ) -> anyhow::Result<LeaseTxnOutcome> {
            let mut guard = self.0.lock().unwrap();
            let current = guard.clone();
            let outcome = match f(current) {
                LeaseTxn::NoOp(o) => o,
                LeaseTxn::Put(lease, o) => {
                    *guard = Some(lease);
                    o
                }
                LeaseTxn::Delete(o) => {
                    *guard = None;
                    o
                }
            };
            Ok(outcome)
        }
    }

    #[tokio::test]
    async fn fresh_store_grants_ownership() {
        let store = MemStore::default();
        let me = Identity::new("h1", "i1").unwrap();
        me.take_ownership_if_available(&store, Duration::from_secs(60))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn second_identity_cannot_take_unexpired_lease() {
        let store = MemStore::default();
        let i1 = Identity::new("h1", "i1").unwrap();
        let i2 = Identity::new("h2", "i2").unwrap();
        i1.take_ownership_if_available(&store, Duration::from_secs(60))
            .await
            .unwrap();
        let err = i2
            .take_ownership_if_available(&store, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::NotAvailable));
    }

    #[tokio::test]
    async fn handoff_protocol_transfers_ownership() {
        // A challenger's request_lease must make the incumbent's next
        // renew relinquish, and the challenger must then be able to take
        // over cleanly.
        let store = MemStore::default();
        let i1 = Identity::new("h1", "i1").unwrap();
        let i2 = Identity::new("h2", "i2").unwrap();

        i1.take_ownership_if_available(&store, Duration::from_secs(60))
            .await
            .unwrap();

        i2.request_lease(&store).await.unwrap();

        let err = i1.renew(&store, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, LeaseError::OwnershipRequested));

        // Lease is now expired; i2 can take it.
        i2.take_ownership_if_available(&store, Duration::from_secs(60))
            .await
            .unwrap();

        let err = i1.renew(&store, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, LeaseError::LostLease));

        let err = i1.delete_lease(&store).await.unwrap_err();
        assert!(matches!(err, LeaseError::NotOwner));

        i2.delete_lease(&store).await.unwrap();
    }

    #[tokio::test]
    async fn renew_without_a_held_lease_is_lost_lease() {
        let store = MemStore::default();
        let i1 = Identity::new("h1", "i1").unwrap();
        let err = i1.renew(&store, Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, LeaseError::LostLease));
    }

    #[test]
    fn identity_requires_non_empty_fields() {
        assert!(Identity::new("", "i1").is_err());
        assert!(Identity::new("h1", "").is_err());
    }

    #[tokio::test]
    async fn expired_lease_is_retaken_once_the_clock_advances_past_it() {
        // Deterministic lease-expiry: no real sleep, just a manually
        // advanced clock shared by both identities.
        use gardener_testing::ManualClock;

        let clock: Arc<ManualClock> = Arc::new(ManualClock::new(Utc::now()));
        let store = MemStore::default();
        let i1 = Identity::with_clock("h1", "i1", clock.clone()).unwrap();
        let i2 = Identity::with_clock("h2", "i2", clock.clone()).unwrap();

        i1.take_ownership_if_available(&store, Duration::from_secs(60))
            .await
            .unwrap();

        // Still within the lease window: i2 cannot take it.
        let err = i2
            .take_ownership_if_available(&store, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::NotAvailable));

        // Advance past the lease's expiration without any real time passing.
        clock.advance(chrono::Duration::seconds(61));

        i2.take_ownership_if_available(&store, Duration::from_secs(60))
            .await
            .unwrap();
    }
}
