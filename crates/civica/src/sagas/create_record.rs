//! `create_record`: a new record lands as a row, a file, and a commit
//!
//! Steps: reserve_id → insert_row → write_file → commit_vcs →
//! emit_events (derived) → update_index (derived). Locks `record:<id>`.
//! The created record carries the `draft` legal status until a publish
//! adopts it.

use std::sync::Arc;

use civica_common::context::{CreateRecordContext, SagaContext};
use civica_common::database;
use civica_common::record::{Record, RecordStatus};
use civica_common::util::unix_time;
use civica_common::Error;

use crate::registry::SagaDefinition;
use crate::step::{SagaEnvironment, SagaStep, StepContext, StepOutcome};

use super::steps::{CommitVcs, EmitEvents, UpdateIndex};

/// The `create_record` definition
pub fn definition() -> SagaDefinition {
    SagaDefinition::new("create_record", super::CURRENT_VERSION)
        .step(Arc::new(ReserveId))
        .step(Arc::new(InsertRow))
        .step(Arc::new(WriteFile))
        .step(Arc::new(CommitVcs::new("Create record")))
        .step(Arc::new(EmitEvents::new("record.created")))
        .step(Arc::new(UpdateIndex))
}

fn ctx(step_ctx: &StepContext) -> Result<&CreateRecordContext, Error> {
    match &step_ctx.context {
        SagaContext::CreateRecord(ctx) => Ok(ctx),
        _ => Err(Error::InvalidContext(
            "expected a create_record context".to_string(),
        )),
    }
}

/// Confirm the derived record id is free before any side effect
#[derive(Debug)]
struct ReserveId;

#[async_trait::async_trait]
impl SagaStep for ReserveId {
    fn name(&self) -> &'static str {
        "reserve_id"
    }

    async fn forward(&self, env: &SagaEnvironment, step_ctx: &StepContext) -> StepOutcome {
        let result = async {
            let context = ctx(step_ctx)?;
            let id = super::record_id(&step_ctx.context)?;

            if env.records.get_record(&id).await?.is_some() {
                return Err(Error::Conflict(format!(
                    "record id `{id}` is already taken"
                )));
            }

            Ok(serde_json::json!({
                "record_id": id,
                "record_type": context.record_type,
            }))
        }
        .await;

        StepOutcome::from_result(result)
    }
}

/// Insert the record row; a duplicate from a prior attempt is detected and
/// returned as this step's output
#[derive(Debug)]
struct InsertRow;

impl InsertRow {
    async fn run(
        &self,
        env: &SagaEnvironment,
        step_ctx: &StepContext,
    ) -> Result<serde_json::Value, Error> {
        let context = ctx(step_ctx)?;
        let id = super::record_id(&step_ctx.context)?;
        let now = unix_time();

        let record = Record {
            id: id.clone(),
            title: context.title.clone(),
            record_type: context.record_type.clone(),
            status: RecordStatus::Draft,
            body: context.body.clone(),
            path: Record::rel_path(&context.record_type, &id),
            created_at: now,
            updated_at: now,
        };

        match env.records.insert_record(&record).await {
            Ok(()) => Ok(serde_json::to_value(&record)?),
            Err(database::Error::Duplicate) => {
                // We hold the resource lock, so the row is ours from a
                // prior attempt
                let existing = env
                    .records
                    .get_record(&id)
                    .await?
                    .ok_or_else(|| Error::UnknownRecord(id))?;
                Ok(serde_json::to_value(&existing)?)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait::async_trait]
impl SagaStep for InsertRow {
    fn name(&self) -> &'static str {
        "insert_row"
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

/// Render the markdown form and write it into the records tree
#[derive(Debug)]
struct WriteFile;

#[async_trait::async_trait]
impl SagaStep for WriteFile {
    fn name(&self) -> &'static str {
        "write_file"
    }

    async fn forward(&self, env: &SagaEnvironment, step_ctx: &StepContext) -> StepOutcome {
        let result = async {
            let record: Record = step_ctx.require_output::<Record>("insert_row")?;
            let content = record.to_markdown()?;
            env.tree
                .write_new(&record.path, content.as_bytes())
                .await?;
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
