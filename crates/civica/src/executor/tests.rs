#![cfg(test)]
//! Unit tests for the executor, driven by scripted step definitions
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use civica_common::context::{CreateRecordContext, SagaContext};
use civica_common::database::SagaStateStore;
use civica_common::saga::{SagaInstance, SagaStatus, StepRecord, StepStatus};
use civica_common::Error;
use tokio_util::sync::CancellationToken;

use crate::registry::SagaDefinition;
use crate::test_helpers::{HarnessBuilder, Probe, ScriptedStep};
use crate::ExecuteOptions;

fn scripted(steps: Vec<ScriptedStep>) -> SagaDefinition {
    let mut def = SagaDefinition::new("create_record", 1);
    for step in steps {
        def = def.step(Arc::new(step));
    }
    def
}

fn create_ctx() -> SagaContext {
    SagaContext::CreateRecord(CreateRecordContext {
        title: "Test Record".to_string(),
        record_type: "bylaw".to_string(),
        body: "# Test".to_string(),
        record_id: None,
    })
}

#[tokio::test]
async fn happy_path_runs_every_step_in_order() {
    let harness = HarnessBuilder::default().without_builtin_sagas().build();
    let probe = Arc::new(Probe::default());
    harness
        .registry
        .register(scripted(vec![
            ScriptedStep::ok("a", probe.clone()),
            ScriptedStep::ok("b", probe.clone()),
            ScriptedStep::ok("c", probe.clone()),
        ]))
        .unwrap();

    let result = harness
        .executor
        .execute(create_ctx(), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, SagaStatus::Completed);
    assert!(!result.compensated);
    assert!(result.derived_failures.is_empty());
    assert_eq!(
        probe.events(),
        vec!["forward:a:1", "forward:b:1", "forward:c:1"]
    );

    let saga = harness.db.load_saga(&result.saga_id).await.unwrap();
    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(saga.current_step, 3);
    assert!(saga
        .step_results
        .iter()
        .all(|r| r.status == StepStatus::Succeeded));
    assert!(saga.finished_at.is_some());

    // Terminal sagas hold no locks
    assert!(harness
        .db
        .locks_held_by(&result.saga_id)
        .await
        .unwrap()
        .is_empty());

    let metrics = harness.executor.metrics().snapshot();
    assert_eq!(metrics.sagas_started, 1);
    assert_eq!(metrics.sagas_completed, 1);
    assert_eq!(metrics.steps_executed, 3);
}

#[tokio::test]
async fn authoritative_failure_compensates_in_reverse_order() {
    let harness = HarnessBuilder::default().without_builtin_sagas().build();
    let probe = Arc::new(Probe::default());
    harness
        .registry
        .register(scripted(vec![
            ScriptedStep::ok("a", probe.clone()),
            ScriptedStep::ok("b", probe.clone()),
            ScriptedStep::failing("c", probe.clone()),
        ]))
        .unwrap();

    let result = harness
        .executor
        .execute(create_ctx(), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, SagaStatus::Compensated);
    assert!(result.compensated);
    assert!(result.error.as_deref().unwrap_or_default().contains("`c`"));

    // Strict reverse of the succeeded prefix
    assert_eq!(
        probe.events(),
        vec![
            "forward:a:1",
            "forward:b:1",
            "forward:c:1",
            "compensate:b",
            "compensate:a",
        ]
    );

    let saga = harness.db.load_saga(&result.saga_id).await.unwrap();
    assert_eq!(saga.status, SagaStatus::Compensated);
    assert_eq!(saga.step_results[0].status, StepStatus::Compensated);
    assert_eq!(saga.step_results[1].status, StepStatus::Compensated);
    assert_eq!(saga.step_results[2].status, StepStatus::Failed);
    assert!(harness
        .db
        .locks_held_by(&result.saga_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn transient_failures_are_retried_in_step() {
    let harness = HarnessBuilder::default().without_builtin_sagas().build();
    let probe = Arc::new(Probe::default());
    harness
        .registry
        .register(scripted(vec![ScriptedStep::flaky("a", 2, probe.clone())]))
        .unwrap();

    let result = harness
        .executor
        .execute(create_ctx(), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, SagaStatus::Completed);
    assert_eq!(
        probe.events(),
        vec!["forward:a:1", "forward:a:2", "forward:a:3"]
    );

    let saga = harness.db.load_saga(&result.saga_id).await.unwrap();
    assert_eq!(saga.step_results[0].attempts, 3);
    assert_eq!(harness.executor.metrics().snapshot().step_retries, 2);
}

#[tokio::test]
async fn exhausted_retries_trigger_compensation() {
    let harness = HarnessBuilder::default().without_builtin_sagas().build();
    let probe = Arc::new(Probe::default());
    let mut flaky = ScriptedStep::flaky("b", 10, probe.clone());
    flaky.max_attempts = 2;
    harness
        .registry
        .register(scripted(vec![ScriptedStep::ok("a", probe.clone()), flaky]))
        .unwrap();

    let result = harness
        .executor
        .execute(create_ctx(), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, SagaStatus::Compensated);
    assert_eq!(
        probe.events(),
        vec!["forward:a:1", "forward:b:1", "forward:b:2", "compensate:a"]
    );

    let saga = harness.db.load_saga(&result.saga_id).await.unwrap();
    assert_eq!(saga.step_results[1].attempts, 2);
    assert_eq!(saga.step_results[1].status, StepStatus::Failed);
}

#[tokio::test]
async fn derived_failure_never_changes_terminal_status() {
    let harness = HarnessBuilder::default().without_builtin_sagas().build();
    let probe = Arc::new(Probe::default());
    harness
        .registry
        .register(scripted(vec![
            ScriptedStep::ok("a", probe.clone()),
            ScriptedStep::derived("d", true, probe.clone()),
            ScriptedStep::ok("b", probe.clone()),
        ]))
        .unwrap();

    let result = harness
        .executor
        .execute(create_ctx(), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, SagaStatus::Completed);
    assert_eq!(result.derived_failures.len(), 1);
    assert_eq!(result.derived_failures[0].step, "d");

    let saga = harness.db.load_saga(&result.saga_id).await.unwrap();
    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(saga.step_results[1].status, StepStatus::Failed);
    assert_eq!(saga.step_results[2].status, StepStatus::Succeeded);
}

#[tokio::test]
async fn compensation_failure_is_terminal_failed() {
    let harness = HarnessBuilder::default().without_builtin_sagas().build();
    let probe = Arc::new(Probe::default());
    let mut poisoned = ScriptedStep::ok("a", probe.clone());
    poisoned.fail_compensation = true;
    harness
        .registry
        .register(scripted(vec![
            poisoned,
            ScriptedStep::ok("b", probe.clone()),
            ScriptedStep::failing("c", probe.clone()),
        ]))
        .unwrap();

    let err = harness
        .executor
        .execute(create_ctx(), ExecuteOptions::default())
        .await
        .unwrap_err();
    let saga_id = match err {
        Error::CompensationFailed { ref step, .. } => {
            assert_eq!(step, "a");
            // b compensated before a failed
            assert!(probe.events().contains(&"compensate:b".to_string()));
            harness
                .db
                .list_sagas(&[SagaStatus::Failed], None, 10)
                .await
                .unwrap()[0]
                .saga_id
        }
        other => panic!("expected CompensationFailed, got {other}"),
    };

    let saga = harness.db.load_saga(&saga_id).await.unwrap();
    assert_eq!(saga.status, SagaStatus::Failed);
    // The un-compensated step is preserved for operator reconciliation
    assert_eq!(saga.step_results[0].status, StepStatus::Succeeded);
    assert_eq!(saga.step_results[1].status, StepStatus::Compensated);
    assert!(harness
        .db
        .locks_held_by(&saga_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn cancellation_observed_between_steps() {
    let harness = HarnessBuilder::default().without_builtin_sagas().build();
    let probe = Arc::new(Probe::default());
    let token = CancellationToken::new();

    let mut first = ScriptedStep::ok("a", probe.clone());
    first.cancel_on_success = Some(token.clone());
    harness
        .registry
        .register(scripted(vec![first, ScriptedStep::ok("b", probe.clone())]))
        .unwrap();

    let result = harness
        .executor
        .execute(
            create_ctx(),
            ExecuteOptions {
                cancel: Some(token),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.status, SagaStatus::Compensated);
    assert!(result
        .error
        .as_deref()
        .unwrap_or_default()
        .to_lowercase()
        .contains("cancel"));
    // Step b never started; step a was rolled back
    assert_eq!(probe.events(), vec!["forward:a:1", "compensate:a"]);
}

#[tokio::test]
async fn saga_timeout_between_steps_compensates_cleanly() {
    let harness = HarnessBuilder::default().without_builtin_sagas().build();
    let probe = Arc::new(Probe::default());
    harness
        .registry
        .register(scripted(vec![ScriptedStep::ok("a", probe.clone())]))
        .unwrap();

    let result = harness
        .executor
        .execute(
            create_ctx(),
            ExecuteOptions {
                saga_timeout: Some(Duration::ZERO),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // The deadline fired before any step ran; nothing is in limbo
    assert_eq!(result.status, SagaStatus::Compensated);
    assert!(probe.events().is_empty());
}

#[tokio::test]
async fn in_flight_idempotency_key_returns_in_progress() {
    let harness = HarnessBuilder::default().without_builtin_sagas().build();
    let probe = Arc::new(Probe::default());
    harness
        .registry
        .register(scripted(vec![ScriptedStep::ok("a", probe)]))
        .unwrap();

    let parked = SagaInstance::new(
        "create_record",
        1,
        serde_json::to_value(create_ctx()).unwrap(),
        None,
        Some("k-race".to_string()),
    );
    harness.db.create_saga(&parked).await.unwrap();

    let err = harness
        .executor
        .execute(
            create_ctx(),
            ExecuteOptions {
                idempotency_key: Some("k-race".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    match err {
        Error::InProgress(saga_id) => assert_eq!(saga_id, parked.saga_id),
        other => panic!("expected InProgress, got {other}"),
    }
}

#[tokio::test]
async fn resume_reenters_at_persisted_cursor() {
    let harness = HarnessBuilder::default().without_builtin_sagas().build();
    let probe = Arc::new(Probe::default());
    harness
        .registry
        .register(scripted(vec![
            ScriptedStep::ok("a", probe.clone()),
            ScriptedStep::ok("b", probe.clone()),
            ScriptedStep::ok("c", probe.clone()),
        ]))
        .unwrap();

    // A crashed executor left the saga mid-flight after step a
    let mut crashed = SagaInstance::new(
        "create_record",
        1,
        serde_json::to_value(create_ctx()).unwrap(),
        None,
        None,
    );
    crashed.current_step = 1;
    let mut done = StepRecord::new(0, "a");
    done.status = StepStatus::Succeeded;
    done.output = Some(serde_json::json!({ "step": "a" }));
    done.attempts = 1;
    crashed.step_results.push(done);
    crashed.status = SagaStatus::Executing;
    harness.db.create_saga(&crashed).await.unwrap();

    let result = harness.executor.resume(crashed.saga_id).await.unwrap();

    assert_eq!(result.status, SagaStatus::Completed);
    // Step a is not re-run
    assert_eq!(probe.events(), vec!["forward:b:1", "forward:c:1"]);
}

#[tokio::test]
async fn unknown_definition_is_rejected() {
    let harness = HarnessBuilder::default().without_builtin_sagas().build();

    let err = harness
        .executor
        .execute(create_ctx(), ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownDefinition(_, _)));
}

#[tokio::test]
async fn invalid_context_is_rejected() {
    let harness = HarnessBuilder::default().without_builtin_sagas().build();

    let err = harness
        .executor
        .execute(
            SagaContext::CreateRecord(CreateRecordContext {
                title: "  ".to_string(),
                record_type: "bylaw".to_string(),
                body: String::new(),
                record_id: None,
            }),
            ExecuteOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidContext(_)));
}
