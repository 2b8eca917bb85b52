//! Step model
//!
//! A saga is an ordered list of steps, each pairing a forward action with a
//! compensating action. Outcomes are explicit values the executor inspects
//! to decide between advancement, retry and compensation; panics and plain
//! errors are reserved for the genuinely unexpected.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use civica_common::context::SagaContext;
use civica_common::database::DynRecordStore;
use civica_common::saga::{StepCriticality, StepRecord, StepStatus};
use civica_common::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapters::events::EventSink;
use crate::adapters::fs::WorkingTree;
use crate::adapters::index::IndexingService;
use crate::adapters::vcs::Vcs;
use crate::retry::RetryPolicy;

/// Explicit outcome of one forward attempt
#[derive(Debug)]
pub enum StepOutcome {
    /// Success; the output is persisted for later steps and compensations
    Complete(serde_json::Value),
    /// Transient failure; the retry policy may schedule another attempt
    Transient(Error),
    /// Permanent failure; an authoritative step rolls the saga back
    Permanent(Error),
}

impl StepOutcome {
    /// Classify a plain result by the error's transience
    pub fn from_result(result: Result<serde_json::Value, Error>) -> Self {
        match result {
            Ok(value) => Self::Complete(value),
            Err(err) if err.is_transient() => Self::Transient(err),
            Err(err) => Self::Permanent(err),
        }
    }
}

/// External collaborators the steps operate on
#[derive(Debug, Clone)]
pub struct SagaEnvironment {
    /// Relational rows for records and drafts
    pub records: DynRecordStore,
    /// Version-controlled records tree
    pub vcs: Arc<dyn Vcs>,
    /// Working-tree filesystem under the records root
    pub tree: Arc<dyn WorkingTree>,
    /// Best-effort event sink
    pub events: Arc<dyn EventSink>,
    /// Best-effort indexing service
    pub index: Arc<dyn IndexingService>,
}

/// Read-only view a step receives: the validated saga context, earlier step
/// outputs by step name, and the caller's cancellation token.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Saga identity, used in event payloads and logs
    pub saga_id: Uuid,
    /// Caller trace token
    pub correlation_id: Option<String>,
    /// Validated caller payload
    pub context: SagaContext,
    /// Outputs of earlier steps, keyed by step name
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Cooperative cancellation signal; steps observe it where they block
    pub cancel: CancellationToken,
}

impl StepContext {
    /// Output of an earlier step, if it succeeded and produced one
    pub fn output(&self, step_name: &str) -> Option<&serde_json::Value> {
        self.outputs.get(step_name)
    }

    /// Deserialize an earlier step's output, failing when it is missing.
    ///
    /// Compensations use this to reach data captured by `load_*` steps.
    pub fn require_output<T: serde::de::DeserializeOwned>(
        &self,
        step_name: &str,
    ) -> Result<T, Error> {
        let value = self
            .output(step_name)
            .ok_or_else(|| Error::Internal(format!("Missing output of step `{step_name}`")))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Rebuild the output map from persisted step results
    pub fn outputs_from(step_results: &[StepRecord]) -> BTreeMap<String, serde_json::Value> {
        step_results
            .iter()
            .filter(|s| {
                matches!(s.status, StepStatus::Succeeded | StepStatus::Compensated)
            })
            .filter_map(|s| s.output.clone().map(|o| (s.name.clone(), o)))
            .collect()
    }
}

/// One forward action plus its inverse compensation, with timeout, retry and
/// criticality metadata.
#[async_trait]
pub trait SagaStep: Debug + Send + Sync {
    /// Stable identifier used for persistence and metrics
    fn name(&self) -> &'static str;

    /// Whether failure rolls back the saga
    fn criticality(&self) -> StepCriticality {
        StepCriticality::Authoritative
    }

    /// Per-attempt timeout; the executor default applies when `None`
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Retry policy for transient failures
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// The forward action. Must be retry-safe under at-least-once delivery:
    /// a partially applied prior attempt must be detected, not re-applied.
    async fn forward(&self, env: &SagaEnvironment, ctx: &StepContext) -> StepOutcome;

    /// The inverse action. `output` is this step's persisted forward output;
    /// `None` means the forward action never produced observable state and
    /// the compensation must be a no-op.
    async fn compensate(
        &self,
        env: &SagaEnvironment,
        ctx: &StepContext,
        output: Option<&serde_json::Value>,
    ) -> Result<(), Error> {
        let _ = (env, ctx, output);
        Ok(())
    }
}
