//! Best-effort event sink
//!
//! Derived steps publish here; failures are reported in the result envelope
//! but never fail a saga.

use std::fmt::Debug;

use async_trait::async_trait;
use civica_common::Error;

/// Downstream notification sink
#[async_trait]
pub trait EventSink: Debug + Send + Sync {
    /// Publish one event
    async fn emit(&self, event_type: &str, payload: serde_json::Value) -> Result<(), Error>;
}

/// Sink that writes events to the log stream
#[derive(Debug, Default, Clone)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event_type: &str, payload: serde_json::Value) -> Result<(), Error> {
        tracing::info!(event_type, %payload, "record event");
        Ok(())
    }
}
