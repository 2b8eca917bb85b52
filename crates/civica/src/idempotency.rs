//! Idempotency manager
//!
//! Thin policy layer over the state store's idempotency entries. A key
//! either short-circuits to a finalized outcome, points at an in-flight
//! saga, or is vacant and gets reserved by the new saga instance.

use civica_common::database::DynStateStore;
use civica_common::{Error, SagaResult};
use uuid::Uuid;

/// What a caller-supplied key currently maps to
#[derive(Debug)]
pub enum IdempotencyCheck {
    /// The operation already ran to a terminal outcome
    Finalized(SagaResult),
    /// A saga with this key is still non-terminal; poll, don't re-invoke
    InFlight(Uuid),
    /// The key is unbound
    Vacant,
}

/// Key lookup and finalization policy
#[derive(Debug, Clone)]
pub struct IdempotencyManager {
    store: DynStateStore,
}

impl IdempotencyManager {
    /// Manager over the given store
    pub fn new(store: DynStateStore) -> Self {
        Self { store }
    }

    /// Resolve a key to its current binding
    pub async fn check(&self, key: &str) -> Result<IdempotencyCheck, Error> {
        if let Some(entry) = self.store.get_idempotency(key).await? {
            let outcome: SagaResult = serde_json::from_value(entry.outcome)?;
            return Ok(IdempotencyCheck::Finalized(outcome));
        }

        if let Some(saga) = self.store.find_saga_by_idempotency_key(key).await? {
            if !saga.status.is_terminal() {
                return Ok(IdempotencyCheck::InFlight(saga.saga_id));
            }
            // Terminal saga that never recorded its outcome (crash between
            // the terminal write and the key write): bind it now so the key
            // becomes observable as finalized
            let outcome = SagaResult {
                saga_id: saga.saga_id,
                status: saga.status,
                result_value: None,
                compensated: saga.status == civica_common::SagaStatus::Compensated,
                error: saga.error.clone(),
                derived_failures: Vec::new(),
            };
            self.finalize(key, &saga.saga_id, &outcome).await?;
            return Ok(IdempotencyCheck::Finalized(outcome));
        }

        Ok(IdempotencyCheck::Vacant)
    }

    /// Record the terminal outcome for a key. Entries are immutable; the
    /// identical binding is a no-op.
    pub async fn finalize(
        &self,
        key: &str,
        saga_id: &Uuid,
        outcome: &SagaResult,
    ) -> Result<(), Error> {
        let value = serde_json::to_value(outcome)?;
        self.store.put_idempotency(key, saga_id, &value).await?;
        Ok(())
    }
}
