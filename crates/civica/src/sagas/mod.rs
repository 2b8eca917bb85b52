//! Canonical record-lifecycle sagas
//!
//! Four definitions cover the record lifecycle: create, update, publish and
//! archive. Each orders its authoritative steps so the VCS commit is the
//! authoritative boundary: failures before it roll back both row and file,
//! failures of the derived steps after it are reported without rolling the
//! saga back.

use civica_common::context::SagaContext;
use civica_common::Error;

use crate::registry::SagaRegistry;

pub mod archive_record;
pub mod create_record;
pub mod publish_draft;
pub mod steps;
pub mod update_record;

#[cfg(test)]
mod tests;

/// Version the built-in definitions register under
pub const CURRENT_VERSION: u32 = 1;

/// Author recorded on commits made by the orchestrator
pub(crate) const COMMIT_AUTHOR: &str = "civica";

/// Register every built-in saga definition
pub fn register_all(registry: &SagaRegistry) -> Result<(), Error> {
    registry.register(create_record::definition())?;
    registry.register(update_record::definition())?;
    registry.register(publish_draft::definition())?;
    registry.register(archive_record::definition())?;
    Ok(())
}

/// The record id a saga context operates on
pub(crate) fn record_id(context: &SagaContext) -> Result<String, Error> {
    match context {
        SagaContext::CreateRecord(ctx) => ctx
            .record_id
            .clone()
            .ok_or_else(|| Error::InvalidContext("record_id not derived".to_string())),
        SagaContext::UpdateRecord(ctx) => Ok(ctx.record_id.clone()),
        SagaContext::PublishDraft(ctx) => Ok(ctx.draft_id.clone()),
        SagaContext::ArchiveRecord(ctx) => Ok(ctx.record_id.clone()),
    }
}
