//! `publish_draft`: promote a draft into the records tree
//!
//! Steps: load_draft → move_to_records → write_file → commit_vcs →
//! delete_draft → emit_events (derived) → update_index (derived). Locks
//! `draft:<id>` and `record:<id>`. The published record keeps the draft's
//! id; its row and frontmatter both carry the `published` legal status.

use std::sync::Arc;

use civica_common::context::{PublishDraftContext, SagaContext};
use civica_common::database;
use civica_common::record::{Draft, Record};
use civica_common::Error;

use crate::registry::SagaDefinition;
use crate::step::{SagaEnvironment, SagaStep, StepContext, StepOutcome};

use super::steps::{CommitVcs, EmitEvents, UpdateIndex};

/// The `publish_draft` definition
pub fn definition() -> SagaDefinition {
    SagaDefinition::new("publish_draft", super::CURRENT_VERSION)
        .step(Arc::new(LoadDraft))
        .step(Arc::new(MoveToRecords))
        .step(Arc::new(WriteFile))
        .step(Arc::new(CommitVcs::new("Create record")))
        .step(Arc::new(DeleteDraft))
        .step(Arc::new(EmitEvents::new("record.published")))
        .step(Arc::new(UpdateIndex))
}

fn ctx(step_ctx: &StepContext) -> Result<&PublishDraftContext, Error> {
    match &step_ctx.context {
        SagaContext::PublishDraft(ctx) => Ok(ctx),
        _ => Err(Error::InvalidContext(
            "expected a publish_draft context".to_string(),
        )),
    }
}

/// Capture the draft; later compensations restore it from this output
#[derive(Debug)]
struct LoadDraft;

#[async_trait::async_trait]
impl SagaStep for LoadDraft {
    fn name(&self) -> &'static str {
        "load_draft"
    }

    async fn forward(&self, env: &SagaEnvironment, step_ctx: &StepContext) -> StepOutcome {
        let result = async {
            let context = ctx(step_ctx)?;
            let draft = env
                .records
                .get_draft(&context.draft_id)
                .await?
                .ok_or_else(|| Error::UnknownDraft(context.draft_id.clone()))?;
            Ok(serde_json::to_value(&draft)?)
        }
        .await;

        StepOutcome::from_result(result)
    }
}

/// Insert the published row; a duplicate from a prior attempt is detected
/// and returned as this step's output
#[derive(Debug)]
struct MoveToRecords;

impl MoveToRecords {
    async fn run(
        &self,
        env: &SagaEnvironment,
        step_ctx: &StepContext,
    ) -> Result<serde_json::Value, Error> {
        let draft: Draft = step_ctx.require_output("load_draft")?;
        let record = Record::from_draft(&draft);

        match env.records.insert_record(&record).await {
            Ok(()) => Ok(serde_json::to_value(&record)?),
            Err(database::Error::Duplicate) => {
                // We hold `record:<id>`, so the row is ours from a prior
                // attempt
                let existing = env
                    .records
                    .get_record(&record.id)
                    .await?
                    .ok_or_else(|| Error::UnknownRecord(record.id.clone()))?;
                Ok(serde_json::to_value(&existing)?)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait::async_trait]
impl SagaStep for MoveToRecords {
    fn name(&self) -> &'static str {
        "move_to_records"
    }

    async fn forward(&self, env: &SagaEnvironment, step_ctx: &StepContext) -> StepOutcome {
        StepOutcome::from_result(self.run(env, step_ctx).await)
    }

    async fn compensate(
        &self,
        env: &SagaEnvironment,
        _step_ctx: &StepContext,
        output: Option<&serde_json::Value>,
    ) -> Result<(), Error> {
        let Some(output) = output else {
            return Ok(());
        };
        let record: Record = serde_json::from_value(output.clone())?;
        env.records.delete_record(&record.id).await?;
        Ok(())
    }
}

/// Write the published record into the records tree
#[derive(Debug)]
struct WriteFile;

#[async_trait::async_trait]
impl SagaStep for WriteFile {
    fn name(&self) -> &'static str {
        "write_file"
    }

    async fn forward(&self, env: &SagaEnvironment, step_ctx: &StepContext) -> StepOutcome {
        let result = async {
            let record: Record = step_ctx.require_output("move_to_records")?;
            let content = record.to_markdown()?;
            env.tree.write_new(&record.path, content.as_bytes()).await?;
            Ok(serde_json::json!({ "path": record.path }))
        }
        .await;

        StepOutcome::from_result(result)
    }

    async fn compensate(
        &self,
        env: &SagaEnvironment,
        _step_ctx: &StepContext,
        output: Option<&serde_json::Value>,
    ) -> Result<(), Error> {
        let Some(output) = output else {
            return Ok(());
        };
        if let Some(path) = output.get("path").and_then(|p| p.as_str()) {
            env.tree.remove(path).await?;
        }
        Ok(())
    }
}

/// Remove the draft row; the record row now owns the content
#[derive(Debug)]
struct DeleteDraft;

#[async_trait::async_trait]
impl SagaStep for DeleteDraft {
    fn name(&self) -> &'static str {
        "delete_draft"
    }

    async fn forward(&self, env: &SagaEnvironment, step_ctx: &StepContext) -> StepOutcome {
        let result = async {
            let context = ctx(step_ctx)?;
            // Already absent counts as done
            env.records.delete_draft(&context.draft_id).await?;
            Ok(serde_json::json!({ "draft_id": context.draft_id }))
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
        let draft: Draft = step_ctx.require_output("load_draft")?;
        match env.records.insert_draft(&draft).await {
            Ok(()) => Ok(()),
            // Still present: the delete never took effect
            Err(database::Error::Duplicate) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
