//! Civica saga orchestrator
//!
//! The engine of a civic-records platform where every record is
//! simultaneously a row in a relational store and a markdown file in a
//! version-controlled tree. Logical operations (create, update, publish,
//! archive) run as sagas: ordered steps with compensations, executed
//! at-least-once across the three non-transactional backends, with
//! idempotency by caller key, per-resource leases, durable progress, and a
//! recovery sweep for abandoned instances.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn demo() -> Result<(), civica_common::Error> {
//! use civica::adapters::events::TracingEventSink;
//! use civica::adapters::fs::RecordsTree;
//! use civica::adapters::index::NoopIndex;
//! use civica::adapters::vcs::GitVcs;
//! use civica::step::SagaEnvironment;
//! use civica::{ExecuteOptions, Executor, OrchestratorConfig, SagaRegistry};
//! use civica_common::context::{PublishDraftContext, SagaContext};
//!
//! let db = Arc::new(civica_sqlite::CivicaSqliteDatabase::new("data/civica.sqlite")?);
//! let env = SagaEnvironment {
//!     records: db.clone(),
//!     vcs: Arc::new(GitVcs::open_or_init("data/records")?),
//!     tree: Arc::new(RecordsTree::new("data/records")),
//!     events: Arc::new(TracingEventSink),
//!     index: Arc::new(NoopIndex),
//! };
//! let registry = Arc::new(SagaRegistry::new());
//! civica::sagas::register_all(&registry)?;
//!
//! let executor = Executor::new(db, env, registry, OrchestratorConfig::default());
//! let _result = executor
//!     .execute(
//!         SagaContext::PublishDraft(PublishDraftContext { draft_id: "d1".into() }),
//!         ExecuteOptions::default(),
//!     )
//!     .await?;
//! # Ok(()) }
//! ```

pub mod adapters;
pub mod config;
pub mod executor;
pub mod idempotency;
pub mod locks;
pub mod metrics;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod sagas;
pub mod step;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use civica_common::{Error, SagaResult, SagaStatus};
pub use config::OrchestratorConfig;
pub use executor::{ExecuteOptions, Executor};
pub use metrics::SagaMetrics;
pub use recovery::{RecoveryCoordinator, RecoveryReport};
pub use registry::{SagaDefinition, SagaRegistry};
pub use retry::RetryPolicy;
pub use step::{SagaEnvironment, SagaStep, StepContext, StepOutcome};
