//! Resource lock manager
//!
//! Exclusive leases over the state store's lock rows. Acquisition is sorted
//! by resource key so overlapping sagas cannot deadlock, bounded by the
//! caller's deadline, and reentrant per owner. The executor renews held
//! leases between steps; a lost lease aborts the saga into compensation.

use std::time::Duration;

use civica_common::common::Lease;
use civica_common::database::{self, DynStateStore};
use civica_common::Error;
use tokio::time::Instant;
use uuid::Uuid;

/// Lease acquisition and renewal for one saga's declared resources
#[derive(Debug, Clone)]
pub struct LockManager {
    store: DynStateStore,
    ttl: Duration,
}

impl LockManager {
    /// Manager issuing leases with the given TTL
    pub fn new(store: DynStateStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Acquire every resource in deterministic (sorted) order.
    ///
    /// Contended resources are retried with a short backoff until
    /// `deadline` elapses; on failure every lease already taken is released
    /// and the contended key is reported in [`Error::Locked`].
    pub async fn acquire_all(
        &self,
        resources: &[String],
        owner_saga_id: &Uuid,
        deadline: Duration,
    ) -> Result<Vec<Lease>, Error> {
        let mut sorted: Vec<&String> = resources.iter().collect();
        sorted.sort();
        sorted.dedup();

        let give_up = Instant::now() + deadline;
        let mut held = Vec::with_capacity(sorted.len());

        for resource in sorted {
            loop {
                match self.store.acquire_lock(resource, owner_saga_id, self.ttl).await {
                    Ok(lease) => {
                        held.push(lease);
                        break;
                    }
                    Err(database::Error::Locked(key)) => {
                        if Instant::now() + RETRY_DELAY > give_up {
                            self.release_all(&held).await;
                            return Err(Error::Locked(key));
                        }
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                    Err(err) => {
                        self.release_all(&held).await;
                        return Err(err.into());
                    }
                }
            }
        }

        Ok(held)
    }

    /// Renew every held lease in place.
    ///
    /// A lease that cannot be renewed means another saga reclaimed the
    /// resource after TTL expiry; the caller must abort.
    pub async fn renew_all(&self, leases: &mut [Lease]) -> Result<(), Error> {
        for lease in leases.iter_mut() {
            match self.store.renew_lock(lease, self.ttl).await {
                Ok(renewed) => *lease = renewed,
                Err(database::Error::LeaseLost(key)) => {
                    tracing::warn!("Lease on {key} lost, aborting saga");
                    return Err(Error::Locked(key));
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    /// Release leases, swallowing individual failures; terminal saga
    /// updates also release everything atomically on the store side
    pub async fn release_all(&self, leases: &[Lease]) {
        for lease in leases {
            if let Err(err) = self.store.release_lock(lease).await {
                tracing::warn!("Failed to release lock {}: {err}", lease.resource_key);
            }
        }
    }
}

const RETRY_DELAY: Duration = Duration::from_millis(50);
