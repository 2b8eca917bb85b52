//! `archive_record`: move a record out of active circulation
//!
//! Steps: load_record → update_row_status → move_file_to_archive →
//! commit_vcs → emit_events (derived). Locks `record:<id>`. The row keeps
//! existing with the `archived` legal status and its path pointing into
//! the archive tree.

use std::sync::Arc;

use civica_common::context::{ArchiveRecordContext, SagaContext};
use civica_common::record::{Record, RecordStatus};
use civica_common::util::unix_time;
use civica_common::Error;

use crate::registry::SagaDefinition;
use crate::step::{SagaEnvironment, SagaStep, StepContext, StepOutcome};

use super::steps::{CommitVcs, EmitEvents};

/// The `archive_record` definition
pub fn definition() -> SagaDefinition {
    SagaDefinition::new("archive_record", super::CURRENT_VERSION)
        .step(Arc::new(LoadRecord))
        .step(Arc::new(UpdateRowStatus))
        .step(Arc::new(MoveFileToArchive))
        .step(Arc::new(CommitVcs::new("Archive record")))
        .step(Arc::new(EmitEvents::new("record.archived")))
}

fn ctx(step_ctx: &StepContext) -> Result<&ArchiveRecordContext, Error> {
    match &step_ctx.context {
        SagaContext::ArchiveRecord(ctx) => Ok(ctx),
        _ => Err(Error::InvalidContext(
            "expected an archive_record context".to_string(),
        )),
    }
}

/// Capture the row as it is before archiving
#[derive(Debug)]
struct LoadRecord;

#[async_trait::async_trait]
impl SagaStep for LoadRecord {
    fn name(&self) -> &'static str {
        "load_record"
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

/// Flip the row to `archived` and point its path into the archive tree
#[derive(Debug)]
struct UpdateRowStatus;

#[async_trait::async_trait]
impl SagaStep for UpdateRowStatus {
    fn name(&self) -> &'static str {
        "update_row_status"
    }

    async fn forward(&self, env: &SagaEnvironment, step_ctx: &StepContext) -> StepOutcome {
        let result = async {
            let prior: Record = step_ctx.require_output("load_record")?;

            if prior.status == RecordStatus::Archived {
                // A prior attempt already archived the row
                return Ok(serde_json::to_value(&prior)?);
            }

            let mut archived = prior.clone();
            archived.status = RecordStatus::Archived;
            archived.path = Record::archive_path(&archived.record_type, &archived.id);
            archived.updated_at = unix_time();

            env.records.update_record(&archived).await?;
            Ok(serde_json::to_value(&archived)?)
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
        let prior: Record = step_ctx.require_output("load_record")?;
        env.records.update_record(&prior).await?;
        Ok(())
    }
}

/// Move the on-disk file under `archive/`
#[derive(Debug)]
struct MoveFileToArchive;

#[async_trait::async_trait]
impl SagaStep for MoveFileToArchive {
    fn name(&self) -> &'static str {
        "move_file_to_archive"
    }

    async fn forward(&self, env: &SagaEnvironment, step_ctx: &StepContext) -> StepOutcome {
        let result = async {
            let prior: Record = step_ctx.require_output("load_record")?;
            let archived: Record = step_ctx.require_output("update_row_status")?;

            // Source gone with the destination present means a prior
            // attempt already moved it
            env.tree.rename(&prior.path, &archived.path).await?;

            Ok(serde_json::json!({
                "src": prior.path,
                "dst": archived.path,
            }))
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
        let src = output.get("src").and_then(|p| p.as_str());
        let dst = output.get("dst").and_then(|p| p.as_str());
        if let (Some(src), Some(dst)) = (src, dst) {
            env.tree.rename(dst, src).await?;
        }
        Ok(())
    }
}
