//! Steps shared by every record saga
//!
//! The VCS commit and the derived tail (events, indexing) look the same in
//! all four definitions; only the commit verb and the event type differ.

use civica_common::saga::StepCriticality;
use civica_common::Error;

use crate::retry::RetryPolicy;
use crate::step::{SagaEnvironment, SagaStep, StepContext, StepOutcome};

use super::{record_id, COMMIT_AUTHOR};

/// Stage the files earlier steps touched and commit them.
///
/// The commit is the saga's authoritative boundary. Its compensation is
/// intentionally the default no-op: history is append-only, and rollback
/// happens by reversing the row and file steps beneath it, leaving any
/// orphan commit for a subsequent operation or audit tool to reconcile.
#[derive(Debug)]
pub struct CommitVcs {
    verb: &'static str,
}

impl CommitVcs {
    /// `verb` prefixes the commit message, e.g. `Create record`
    pub fn new(verb: &'static str) -> Self {
        Self { verb }
    }

    async fn run(
        &self,
        env: &SagaEnvironment,
        ctx: &StepContext,
    ) -> Result<serde_json::Value, Error> {
        let id = record_id(&ctx.context)?;

        let mut paths = Vec::new();
        if let Some(output) = ctx.output("write_file") {
            if let Some(path) = output.get("path").and_then(|p| p.as_str()) {
                paths.push(path.to_string());
            }
        }
        if let Some(output) = ctx.output("move_file_to_archive") {
            for key in ["src", "dst"] {
                if let Some(path) = output.get(key).and_then(|p| p.as_str()) {
                    paths.push(path.to_string());
                }
            }
        }

        env.vcs.stage(&paths).await?;
        let commit_id = env
            .vcs
            .commit(&format!("{} {id}", self.verb), COMMIT_AUTHOR)
            .await?;

        Ok(serde_json::json!({ "commit_id": commit_id }))
    }
}

#[async_trait::async_trait]
impl SagaStep for CommitVcs {
    fn name(&self) -> &'static str {
        "commit_vcs"
    }

    async fn forward(&self, env: &SagaEnvironment, ctx: &StepContext) -> StepOutcome {
        StepOutcome::from_result(self.run(env, ctx).await)
    }
}

/// Publish a lifecycle event; derived, best-effort.
#[derive(Debug)]
pub struct EmitEvents {
    event_type: &'static str,
}

impl EmitEvents {
    /// Step publishing `event_type`
    pub fn new(event_type: &'static str) -> Self {
        Self { event_type }
    }
}

#[async_trait::async_trait]
impl SagaStep for EmitEvents {
    fn name(&self) -> &'static str {
        "emit_events"
    }

    fn criticality(&self) -> StepCriticality {
        StepCriticality::Derived
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::none()
    }

    async fn forward(&self, env: &SagaEnvironment, ctx: &StepContext) -> StepOutcome {
        let result = async {
            let id = record_id(&ctx.context)?;
            env.events
                .emit(
                    self.event_type,
                    serde_json::json!({
                        "record_id": id,
                        "saga_id": ctx.saga_id,
                        "correlation_id": ctx.correlation_id,
                    }),
                )
                .await?;
            Ok(serde_json::Value::Null)
        }
        .await;

        StepOutcome::from_result(result)
    }
}

/// Refresh the search index for the record; derived, best-effort.
#[derive(Debug)]
pub struct UpdateIndex;

#[async_trait::async_trait]
impl SagaStep for UpdateIndex {
    fn name(&self) -> &'static str {
        "update_index"
    }

    fn criticality(&self) -> StepCriticality {
        StepCriticality::Derived
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::none()
    }

    async fn forward(&self, env: &SagaEnvironment, ctx: &StepContext) -> StepOutcome {
        let result = async {
            let id = record_id(&ctx.context)?;
            env.index.reindex(&id).await?;
            Ok(serde_json::Value::Null)
        }
        .await;

        StepOutcome::from_result(result)
    }
}
