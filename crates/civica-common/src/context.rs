//! Typed saga contexts
//!
//! One variant per registered saga type. Contexts are serialized opaquely
//! into the saga instance and validated at saga entry, so step code never
//! sees an unshaped payload.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::record::slugify;

/// Caller payload for one saga invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SagaContext {
    /// Create a new record from caller-supplied content
    CreateRecord(CreateRecordContext),
    /// Update an existing record's content
    UpdateRecord(UpdateRecordContext),
    /// Promote a draft into the records tree
    PublishDraft(PublishDraftContext),
    /// Move a record out of active circulation
    ArchiveRecord(ArchiveRecordContext),
}

/// Context for `create_record`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRecordContext {
    /// Record title
    pub title: String,
    /// Record type from the catalog, e.g. `bylaw`
    pub record_type: String,
    /// Markdown body
    pub body: String,
    /// Record id; derived from the title when absent so resource keys are
    /// known before the first step runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

/// Context for `update_record`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecordContext {
    /// Target record id
    pub record_id: String,
    /// Replacement title, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Replacement body, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Context for `publish_draft`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishDraftContext {
    /// Draft id; the published record keeps the same id
    pub draft_id: String,
}

/// Context for `archive_record`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecordContext {
    /// Target record id
    pub record_id: String,
}

impl SagaContext {
    /// Definition name this context belongs to
    pub fn saga_type(&self) -> &'static str {
        match self {
            Self::CreateRecord(_) => "create_record",
            Self::UpdateRecord(_) => "update_record",
            Self::PublishDraft(_) => "publish_draft",
            Self::ArchiveRecord(_) => "archive_record",
        }
    }

    /// Validate the context and fill derived fields.
    ///
    /// `CreateRecord` gets its record id derived from the title here, so
    /// resource keys are deterministic before any step runs.
    pub fn validate(&mut self) -> Result<(), Error> {
        match self {
            Self::CreateRecord(ctx) => {
                if ctx.title.trim().is_empty() {
                    return Err(Error::InvalidContext("title must not be empty".into()));
                }
                if ctx.record_type.trim().is_empty() {
                    return Err(Error::InvalidContext(
                        "record_type must not be empty".into(),
                    ));
                }
                if ctx.record_id.is_none() {
                    ctx.record_id = Some(slugify(&ctx.title));
                }
                Ok(())
            }
            Self::UpdateRecord(ctx) => {
                if ctx.record_id.trim().is_empty() {
                    return Err(Error::InvalidContext("record_id must not be empty".into()));
                }
                if ctx.title.is_none() && ctx.body.is_none() {
                    return Err(Error::InvalidContext(
                        "update requires a new title or body".into(),
                    ));
                }
                Ok(())
            }
            Self::PublishDraft(ctx) => {
                if ctx.draft_id.trim().is_empty() {
                    return Err(Error::InvalidContext("draft_id must not be empty".into()));
                }
                Ok(())
            }
            Self::ArchiveRecord(ctx) => {
                if ctx.record_id.trim().is_empty() {
                    return Err(Error::InvalidContext("record_id must not be empty".into()));
                }
                Ok(())
            }
        }
    }

    /// Resource keys this saga must hold for its whole execution.
    ///
    /// The executor acquires these sorted by key, so overlapping sagas
    /// cannot deadlock.
    pub fn resources(&self) -> Vec<String> {
        match self {
            Self::CreateRecord(ctx) => match &ctx.record_id {
                Some(id) => vec![format!("record:{id}")],
                None => vec![],
            },
            Self::UpdateRecord(ctx) => vec![format!("record:{}", ctx.record_id)],
            Self::PublishDraft(ctx) => vec![
                format!("draft:{}", ctx.draft_id),
                format!("record:{}", ctx.draft_id),
            ],
            Self::ArchiveRecord(ctx) => vec![format!("record:{}", ctx.record_id)],
        }
    }
}
