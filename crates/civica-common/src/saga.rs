//! Saga instance and step types
//!
//! Sagas represent multi-resource mutations that need to survive crashes.
//! They use **optimistic locking** via the `version` field to handle
//! concurrent access from multiple executors safely:
//!
//! 1. Each saga has a `version` number starting at 0
//! 2. When updating, the state store checks `WHERE saga_id = ? AND version = ?`
//! 3. If the version matches, the update succeeds and `version` increments
//! 4. If the version doesn't match, another executor advanced it first
//!
//! Executors treat version conflicts as "someone else owns this saga" and
//! back off rather than retrying.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::unix_time;

/// Saga lifecycle status
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Created, not yet taken by an executor
    Pending,
    /// An executor is driving forward steps
    Executing,
    /// An executor is rolling back succeeded steps
    Compensating,
    /// All authoritative steps succeeded
    Completed,
    /// Terminal failure; compensation failed or was impossible
    Failed,
    /// All eligible compensations were attempted
    Compensated,
}

impl SagaStatus {
    /// Terminal statuses are write-once
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Compensated)
    }

    /// Stable string form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Compensating => "compensating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensated => "compensated",
        }
    }
}

impl std::str::FromStr for SagaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "executing" => Ok(Self::Executing),
            "compensating" => Ok(Self::Compensating),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "compensated" => Ok(Self::Compensated),
            other => Err(format!("Unknown saga status: {other}")),
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-step outcome status
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet run, or an attempt is in flight
    Pending,
    /// Forward action returned a result
    Succeeded,
    /// Forward action failed (permanent or retries exhausted)
    Failed,
    /// Compensation was invoked after a prior success
    Compensated,
    /// Skipped (forward never eligible, e.g. after an upstream failure)
    Skipped,
}

/// Whether a step's failure rolls back the saga
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCriticality {
    /// Failure triggers compensation of the whole saga
    Authoritative,
    /// Failure is reported but does not fail the saga
    Derived,
}

/// Persisted outcome of a single step.
///
/// This is the single canonical schema for step results; stores normalize
/// any legacy shape into it once at load time, never per-read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 0-based position in the definition's step list
    pub index: usize,
    /// Stable step name used for persistence and metrics
    pub name: String,
    /// Outcome status
    pub status: StepStatus,
    /// Forward output, persisted for later steps and compensations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Failure description, if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the first attempt started (unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    /// When the final attempt finished (unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
    /// Number of forward attempts made
    #[serde(default)]
    pub attempts: u32,
}

impl StepRecord {
    /// New pending record for a step about to run
    pub fn new(index: usize, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
            attempts: 0,
        }
    }
}

/// A persisted saga instance.
///
/// The instance is the authoritative record of a logical operation's
/// progress. After a crash the persisted `status` and `current_step` decide
/// whether the saga is resumed forward or compensated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    /// Unique saga ID
    pub saga_id: Uuid,
    /// Definition name, e.g. `publish_draft`
    pub saga_type: String,
    /// Definition version the saga started under; recovery uses this exact
    /// version
    pub saga_version: u32,
    /// Lifecycle status
    pub status: SagaStatus,
    /// 0-based index of the next or in-progress step
    pub current_step: usize,
    /// Ordered per-step outcomes
    pub step_results: Vec<StepRecord>,
    /// Opaque serialized caller payload
    pub context: serde_json::Value,
    /// Caller trace token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Caller idempotency key, if supplied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Creation timestamp (unix seconds)
    pub started_at: u64,
    /// Last progress timestamp (unix seconds); the recovery sweep treats a
    /// stale value as abandonment
    pub updated_at: u64,
    /// Terminal timestamp (unix seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
    /// Terminal error description, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Version number for optimistic locking.
    ///
    /// Incremented on each update. Used to detect concurrent modifications:
    /// an executor whose update fails on version mismatch knows another
    /// executor owns the saga and must not advance it.
    #[serde(default)]
    pub version: u64,
}

impl SagaInstance {
    /// Create a new pending saga instance with `version = 0`.
    pub fn new(
        saga_type: impl Into<String>,
        saga_version: u32,
        context: serde_json::Value,
        correlation_id: Option<String>,
        idempotency_key: Option<String>,
    ) -> Self {
        let now = unix_time();

        Self {
            saga_id: Uuid::new_v4(),
            saga_type: saga_type.into(),
            saga_version,
            status: SagaStatus::Pending,
            current_step: 0,
            step_results: Vec::new(),
            context,
            correlation_id,
            idempotency_key,
            started_at: now,
            updated_at: now,
            finished_at: None,
            error: None,
            version: 0,
        }
    }

    /// Highest step index whose forward action succeeded, if any.
    ///
    /// During compensation exactly the prefix of succeeded steps is
    /// eligible, in strict reverse order starting here.
    pub fn highest_succeeded_step(&self) -> Option<usize> {
        self.step_results
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Succeeded)
            .map(|s| s.index)
    }
}

/// A derived step failure carried in the result envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFailure {
    /// Step name
    pub step: String,
    /// Failure description
    pub error: String,
}

/// Result envelope returned by the executor and stored as the idempotency
/// outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaResult {
    /// Saga ID
    pub saga_id: Uuid,
    /// Terminal status
    pub status: SagaStatus,
    /// Saga-type-specific result payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_value: Option<serde_json::Value>,
    /// Whether rollback ran to completion
    pub compensated: bool,
    /// Terminal error description for non-completed sagas
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failures of derived steps; present even when `status` is `completed`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_failures: Vec<DerivedFailure>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            SagaStatus::Pending,
            SagaStatus::Executing,
            SagaStatus::Compensating,
            SagaStatus::Completed,
            SagaStatus::Failed,
            SagaStatus::Compensated,
        ] {
            let parsed: SagaStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<SagaStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(SagaStatus::Completed.is_terminal());
        assert!(SagaStatus::Failed.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(!SagaStatus::Executing.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(!SagaStatus::Pending.is_terminal());
    }

    #[test]
    fn highest_succeeded_step_scans_in_reverse() {
        let mut saga = SagaInstance::new("create_record", 1, serde_json::Value::Null, None, None);
        assert_eq!(saga.highest_succeeded_step(), None);

        let mut s0 = StepRecord::new(0, "reserve_id");
        s0.status = StepStatus::Succeeded;
        let mut s1 = StepRecord::new(1, "insert_row");
        s1.status = StepStatus::Succeeded;
        let mut s2 = StepRecord::new(2, "write_file");
        s2.status = StepStatus::Failed;
        saga.step_results = vec![s0, s1, s2];

        assert_eq!(saga.highest_succeeded_step(), Some(1));
    }
}
