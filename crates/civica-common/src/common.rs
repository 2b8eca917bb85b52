//! Shared row types owned by the state store

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::unix_time;

/// A persisted exclusive lock on a named resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Caller-chosen resource key, e.g. `record:<id>` or `draft:<id>`
    pub resource_key: String,
    /// Saga holding the lock
    pub owner_saga_id: Uuid,
    /// When the lock was first acquired (unix seconds)
    pub acquired_at: u64,
    /// Lease expiry (unix seconds, store clock)
    pub expires_at: u64,
}

impl LockRecord {
    /// Whether the lease has lapsed and the row is reclaimable
    pub fn is_expired(&self) -> bool {
        self.expires_at <= unix_time()
    }
}

/// A live lease handle returned by `acquire_lock` and consumed by
/// renew/release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Locked resource key
    pub resource_key: String,
    /// Owning saga
    pub owner_saga_id: Uuid,
    /// Current expiry (unix seconds, store clock)
    pub expires_at: u64,
}

/// A finalized idempotency entry. Immutable once written; it outlives the
/// saga instance it points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    /// Caller-supplied key
    pub key: String,
    /// Saga bound to the key
    pub saga_id: Uuid,
    /// Serialized final result envelope
    pub outcome: serde_json::Value,
    /// Creation timestamp (unix seconds)
    pub created_at: u64,
}
