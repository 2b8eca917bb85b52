//! `update_record`: replace a record's content in row, file and history
//!
//! Steps: load_current → update_row → write_file → commit_vcs →
//! emit_events (derived) → update_index (derived). Locks `record:<id>`.
//! `load_current` captures the pre-update row so the later compensations
//! can restore it exactly.

use std::sync::Arc;

use civica_common::context::{SagaContext, UpdateRecordContext};
use civica_common::record::Record;
use civica_common::util::unix_time;
use civica_common::Error;

use crate::registry::SagaDefinition;
use crate::step::{SagaEnvironment, SagaStep, StepContext, StepOutcome};

use super::steps::{CommitVcs, EmitEvents, UpdateIndex};

/// The `update_record` definition
pub fn definition() -> SagaDefinition {
    SagaDefinition::new("update_record", super::CURRENT_VERSION)
        .step(Arc::new(LoadCurrent))
        .step(Arc::new(UpdateRow))
        .step(Arc::new(WriteFile))
        .step(Arc::new(CommitVcs::new("Update record")))
        .step(Arc::new(EmitEvents::new("record.updated")))
        .step(Arc::new(UpdateIndex))
}

fn ctx(step_ctx: &StepContext) -> Result<&UpdateRecordContext, Error> {
    match &step_ctx.context {
        SagaContext::UpdateRecord(ctx) => Ok(ctx),
        _ => Err(Error::InvalidContext(
            "expected an update_record context".to_string(),
        )),
    }
}

/// Capture the current row; its output feeds every compensation below
#[derive(Debug)]
struct LoadCurrent;

#[async_trait::async_trait]
impl SagaStep for LoadCurrent {
    fn name(&self) -> &'static str {
        "load_current"
    }

    async fn forward(&self, env: &SagaEnvironment, step_ctx: &StepContext) -> StepOutcome {
        let result = async {
            let context = ctx(step_ctx)?;
            let record = env
                .records
                .get_record(&context.record_id)
                .await?
                .ok_or_else(|| Error::UnknownRecord(context.record_id.clone()))?;
            Ok(serde_json::to_value(&record)?)
        }
        .await;

        StepOutcome::from_result(result)
    }
}

/// Apply the new title/body to the row
#[derive(Debug)]
struct UpdateRow;

#[async_trait::async_trait]
impl SagaStep for UpdateRow {
    fn name(&self) -> &'static str {
        "update_row"
    }

    async fn forward(&self, env: &SagaEnvironment, step_ctx: &StepContext) -> StepOutcome {
        let result = async {
            let context = ctx(step_ctx)?;
            let prior: Record = step_ctx.require_output("load_current")?;

            let mut updated = prior.clone();
            if let Some(title) = &context.title {
                updated.title = title.clone();
            }
            if let Some(body) = &context.body {
                updated.body = body.clone();
            }
            updated.updated_at = unix_time();

            env.records.update_record(&updated).await?;
            Ok(serde_json::to_value(&updated)?)
        }
        .await;

        StepOutcome::from_result(result)
    }

    async fn compensate(
        &self,
        env: &SagaEnvironment,
        step_ctx: &StepContext,
        output: Option<&serde_json::Value>,
    ) -> Result<(), Error> {
        if output.is_none() {
            return Ok(());
        }
        let prior: Record = step_ctx.require_output("load_current")?;
        env.records.update_record(&prior).await?;
        Ok(())
    }
}

/// Overwrite the on-disk file with the new content
#[derive(Debug)]
struct WriteFile;

#[async_trait::async_trait]
impl SagaStep for WriteFile {
    fn name(&self) -> &'static str {
        "write_file"
    }

    async fn forward(&self, env: &SagaEnvironment, step_ctx: &StepContext) -> StepOutcome {
        let result = async {
            let updated: Record = step_ctx.require_output("update_row")?;
            let content = updated.to_markdown()?;
            env.tree
                .write_atomic(&updated.path, content.as_bytes())
                .await?;
            Ok(serde_json::json!({ "path": updated.path }))
        }
        .await;

        StepOutcome::from_result(result)
    }

    async fn compensate(
        &self,
        env: &SagaEnvironment,
        step_ctx: &StepContext,
        output: Option<&serde_json::Value>,
    ) -> Result<(), Error> {
        if output.is_none() {
            return Ok(());
        }
        // Put the pre-update content back
        let prior: Record = step_ctx.require_output("load_current")?;
        let content = prior.to_markdown()?;
        env.tree.write_atomic(&prior.path, content.as_bytes()).await?;
        Ok(())
    }
}
