//! Best-effort indexing service

use std::fmt::Debug;

use async_trait::async_trait;
use civica_common::Error;

/// Search-index refresh hook; derived, never fails a saga
#[async_trait]
pub trait IndexingService: Debug + Send + Sync {
    /// Re-index one record
    async fn reindex(&self, record_id: &str) -> Result<(), Error>;
}

/// Indexing disabled
#[derive(Debug, Default, Clone)]
pub struct NoopIndex;

#[async_trait]
impl IndexingService for NoopIndex {
    async fn reindex(&self, _record_id: &str) -> Result<(), Error> {
        Ok(())
    }
}
