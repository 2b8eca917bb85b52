//! Civica state store
//!
//! The state store owns saga instances, resource locks, idempotency entries
//! and the civic record rows. Components observe them only through these
//! traits and never mutate underlying storage directly.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::common::{IdempotencyEntry, Lease, LockRecord};
use crate::record::{Draft, Record};
use crate::saga::{SagaInstance, SagaStatus, StepRecord};


/// Civica database error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying driver error
    #[error(transparent)]
    Database(Box<dyn std::error::Error + Send + Sync>),
    /// Serde Error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// Duplicate entry
    #[error("Duplicate entry")]
    Duplicate,
    /// Unknown saga
    #[error("Unknown saga")]
    SagaNotFound,
    /// Optimistic-concurrency conflict; another executor advanced the saga
    #[error("Version conflict on saga update")]
    VersionConflict,
    /// Attempt to update a saga already in a terminal state
    #[error("Attempt to update finished saga")]
    AttemptUpdateFinishedSaga,
    /// A non-expired lock is held by a different owner
    #[error("Resource `{0}` is locked")]
    Locked(String),
    /// The lease row is gone or owned by another saga
    #[error("Lease lost for `{0}`")]
    LeaseLost(String),
    /// The idempotency key is already bound to a finalized outcome
    #[error("Idempotency key `{key}` already finalized by saga `{saga_id}`")]
    IdempotencyFinalized {
        /// The conflicting key
        key: String,
        /// Saga that finalized it
        saga_id: Uuid,
        /// Stored outcome envelope
        outcome: serde_json::Value,
    },
    /// The idempotency key is bound to a different outcome
    #[error("Idempotency key `{0}` bound to a different outcome")]
    IdempotencyConflict(String),
    /// Unknown record
    #[error("Unknown record `{0}`")]
    RecordNotFound(String),
    /// Backend unavailable
    #[error("Unavailable: {0}")]
    Unavailable(String),
    /// Column type mismatch while reading a row
    #[error("Invalid type from db, expected {0} got {1}")]
    InvalidType(String, String),
    /// Row has fewer columns than expected
    #[error("Missing column {0} in row with {1} columns")]
    MissingColumn(usize, usize),
    /// Column value could not be converted
    #[error("Invalid db conversion in column {0} to type {1}")]
    InvalidConversion(String, String),
    /// A statement placeholder was never bound
    #[error("Missing placeholder {0}")]
    MissingPlaceholder(String),
    /// Internal error
    #[error("Internal: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Mutations applied to a saga instance in one atomic update.
///
/// Fields left `None` are untouched. When `status` transitions to a
/// terminal value, the store releases every lock owned by the saga in the
/// same transaction, so no observer can see "saga terminal" and "lock
/// still held" together.
#[derive(Debug, Default, Clone)]
pub struct SagaUpdate {
    /// New lifecycle status
    pub status: Option<SagaStatus>,
    /// New next-step index
    pub current_step: Option<usize>,
    /// Full replacement of the persisted step results
    pub step_results: Option<Vec<StepRecord>>,
    /// Terminal error description
    pub error: Option<String>,
    /// Terminal timestamp (unix seconds)
    pub finished_at: Option<u64>,
}

impl SagaUpdate {
    /// Update that only moves the status
    pub fn status(status: SagaStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Durable persistence for saga instances, locks and idempotency entries.
///
/// Per-`saga_id` updates are serialized by optimistic versioning: two
/// executors cannot both advance the same saga. The store stamps its own
/// clock for lease arithmetic; executors never supply expiry timestamps.
#[async_trait]
pub trait SagaStateStore: Debug + Send + Sync {
    /// Persist a new saga instance.
    ///
    /// Fails [`Error::IdempotencyFinalized`] when the instance carries an
    /// idempotency key already bound to a finalized outcome, and
    /// [`Error::Duplicate`] when another live saga carries the same key.
    async fn create_saga(&self, saga: &SagaInstance) -> Result<(), Error>;

    /// Load a saga instance
    async fn load_saga(&self, saga_id: &Uuid) -> Result<SagaInstance, Error>;

    /// Find the saga currently bound to an idempotency key, if any
    async fn find_saga_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<SagaInstance>, Error>;

    /// Apply `update` if the stored version equals `expected_version`;
    /// returns the new version.
    ///
    /// Fails [`Error::VersionConflict`] on mismatch and
    /// [`Error::AttemptUpdateFinishedSaga`] when the saga is already
    /// terminal (terminal status is write-once).
    async fn update_saga(
        &self,
        saga_id: &Uuid,
        expected_version: u64,
        update: SagaUpdate,
    ) -> Result<u64, Error>;

    /// Bump `updated_at` without touching the version, so the recovery
    /// sweep can tell a live saga from an abandoned one
    async fn heartbeat(&self, saga_id: &Uuid) -> Result<(), Error>;

    /// Page of sagas in any of `statuses`, optionally with `updated_at`
    /// older than the given unix time, bounded by `limit`
    async fn list_sagas(
        &self,
        statuses: &[SagaStatus],
        older_than: Option<u64>,
        limit: usize,
    ) -> Result<Vec<SagaInstance>, Error>;

    /// Acquire or extend an exclusive lease on `resource_key`.
    ///
    /// Re-acquisition by the same owner is reentrant and extends the
    /// lease. An expired row is reclaimable by TTL alone. Fails
    /// [`Error::Locked`] when a live lease has a different owner.
    async fn acquire_lock(
        &self,
        resource_key: &str,
        owner_saga_id: &Uuid,
        ttl: Duration,
    ) -> Result<Lease, Error>;

    /// Extend a held lease; fails [`Error::LeaseLost`] when the row is
    /// gone or owned by another saga
    async fn renew_lock(&self, lease: &Lease, ttl: Duration) -> Result<Lease, Error>;

    /// Release a held lease; releasing an already-absent lease is success
    async fn release_lock(&self, lease: &Lease) -> Result<(), Error>;

    /// Locks currently held by a saga
    async fn locks_held_by(&self, owner_saga_id: &Uuid) -> Result<Vec<LockRecord>, Error>;

    /// Bind a finalized outcome to an idempotency key.
    ///
    /// Entries are immutable: rebinding the same key to the same saga is a
    /// no-op, any other rebind fails [`Error::IdempotencyConflict`].
    async fn put_idempotency(
        &self,
        key: &str,
        saga_id: &Uuid,
        outcome: &serde_json::Value,
    ) -> Result<(), Error>;

    /// Look up an idempotency entry
    async fn get_idempotency(&self, key: &str) -> Result<Option<IdempotencyEntry>, Error>;
}

/// Shared state store handle
pub type DynStateStore = Arc<dyn SagaStateStore>;

/// Relational rows for civic records and drafts.
///
/// Write operations are retry-safe under at-least-once delivery: inserts
/// report [`Error::Duplicate`] so steps can detect their own prior effect,
/// deletes treat "already absent" as success.
#[async_trait]
pub trait RecordStore: Debug + Send + Sync {
    /// Insert a record row; fails [`Error::Duplicate`] when the id exists
    async fn insert_record(&self, record: &Record) -> Result<(), Error>;

    /// Load a record row
    async fn get_record(&self, id: &str) -> Result<Option<Record>, Error>;

    /// Replace a record row; fails [`Error::RecordNotFound`] when absent
    async fn update_record(&self, record: &Record) -> Result<(), Error>;

    /// Delete a record row; already absent is success
    async fn delete_record(&self, id: &str) -> Result<(), Error>;

    /// Insert a draft row; fails [`Error::Duplicate`] when the id exists
    async fn insert_draft(&self, draft: &Draft) -> Result<(), Error>;

    /// Load a draft row
    async fn get_draft(&self, id: &str) -> Result<Option<Draft>, Error>;

    /// Delete a draft row; already absent is success
    async fn delete_draft(&self, id: &str) -> Result<(), Error>;

    /// Bounded listing of record rows, newest first
    async fn list_records(&self, limit: usize) -> Result<Vec<Record>, Error>;
}

/// Shared record store handle
pub type DynRecordStore = Arc<dyn RecordStore>;
