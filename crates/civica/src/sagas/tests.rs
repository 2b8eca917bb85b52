#![cfg(test)]
//! End-to-end scenarios for the record lifecycle sagas, running against an
//! in-memory state store, a temp records tree and a temp git repository.
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use civica_common::context::{
    ArchiveRecordContext, CreateRecordContext, PublishDraftContext, SagaContext,
    UpdateRecordContext,
};
use civica_common::database::{RecordStore, SagaStateStore};
use civica_common::record::RecordStatus;
use civica_common::saga::{SagaInstance, SagaStatus, StepRecord, StepStatus};

use crate::config::OrchestratorConfig;
use crate::recovery::RecoveryCoordinator;
use crate::test_helpers::{harness, seed_draft, FailingIndex, HarnessBuilder};
use crate::ExecuteOptions;

fn publish(draft_id: &str) -> SagaContext {
    SagaContext::PublishDraft(PublishDraftContext {
        draft_id: draft_id.to_string(),
    })
}

#[tokio::test]
async fn happy_publish() {
    let harness = harness();
    seed_draft(&harness.db, "d1", "T", "# T").await;

    let result = harness
        .executor
        .execute(publish("d1"), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, SagaStatus::Completed);
    assert_eq!(result.result_value.unwrap()["record_id"], "d1");

    // Draft row gone, record row present and published
    assert!(harness.db.get_draft("d1").await.unwrap().is_none());
    let record = harness.db.get_record("d1").await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Published);

    // The on-disk form exists with the body and the published status
    let content =
        std::fs::read_to_string(harness.dir.path().join("records/bylaw/d1.md")).unwrap();
    assert!(content.contains("# T"));
    assert!(content.contains("status: published"));

    // Top of history is the publishing commit
    let history = harness.env.vcs.history(5).await.unwrap();
    assert!(history[0].message.contains("Create record"));

    // The derived event went out
    assert!(harness
        .events
        .emitted()
        .iter()
        .any(|(event_type, payload)| event_type == "record.published"
            && payload["record_id"] == "d1"));
}

#[tokio::test]
async fn filesystem_failure_rolls_back_row_and_leaves_draft() {
    let harness = HarnessBuilder::default().missing_records_root().build();
    seed_draft(&harness.db, "d2", "T", "# T").await;

    let result = harness
        .executor
        .execute(publish("d2"), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, SagaStatus::Compensated);
    assert!(result.compensated);

    // Row rolled back, draft untouched, no commit added
    assert!(harness.db.get_record("d2").await.unwrap().is_none());
    assert!(harness.db.get_draft("d2").await.unwrap().is_some());
    assert!(harness.env.vcs.history(5).await.unwrap().is_empty());
}

#[tokio::test]
async fn idempotent_create() {
    let harness = harness();
    let ctx = || {
        SagaContext::CreateRecord(CreateRecordContext {
            title: "X".to_string(),
            record_type: "bylaw".to_string(),
            body: "# X".to_string(),
            record_id: None,
        })
    };
    let opts = ExecuteOptions {
        idempotency_key: Some("k1".to_string()),
        ..Default::default()
    };

    let first = harness.executor.execute(ctx(), opts.clone()).await.unwrap();
    let second = harness.executor.execute(ctx(), opts).await.unwrap();

    // Same id, no re-run
    assert_eq!(first.status, SagaStatus::Completed);
    assert_eq!(first.saga_id, second.saga_id);
    assert_eq!(first.result_value, second.result_value);
    assert_eq!(first.result_value.as_ref().unwrap()["record_id"], "x");

    // Exactly one row, one file, one commit
    assert_eq!(harness.db.list_records(10).await.unwrap().len(), 1);
    assert!(harness.dir.path().join("records/bylaw/x.md").is_file());
    assert_eq!(harness.env.vcs.history(10).await.unwrap().len(), 1);
    assert_eq!(harness.executor.metrics().snapshot().idempotency_hits, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_publish_of_same_draft() {
    let harness = harness();
    seed_draft(&harness.db, "d3", "T", "# T").await;

    let first = harness.executor.execute(
        publish("d3"),
        ExecuteOptions {
            correlation_id: Some("caller-one".to_string()),
            ..Default::default()
        },
    );
    let second = harness.executor.execute(
        publish("d3"),
        ExecuteOptions {
            correlation_id: Some("caller-two".to_string()),
            ..Default::default()
        },
    );

    let (first, second) = tokio::join!(first, second);

    let completed = [&first, &second]
        .iter()
        .filter(|r| matches!(r, Ok(result) if result.status == SagaStatus::Completed))
        .count();
    assert_eq!(completed, 1, "exactly one publisher may win");

    // The loser saw the lock or a step failure, never a second row
    let record = harness.db.get_record("d3").await.unwrap();
    assert!(record.is_some());
    assert_eq!(harness.db.list_records(10).await.unwrap().len(), 1);
    assert!(harness.db.get_draft("d3").await.unwrap().is_none());
}

#[tokio::test]
async fn derived_only_failure_still_completes() {
    let harness = HarnessBuilder::default()
        .index(Arc::new(FailingIndex))
        .build();
    seed_draft(&harness.db, "d4", "T", "# T").await;

    let result = harness
        .executor
        .execute(publish("d4"), ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, SagaStatus::Completed);
    assert_eq!(result.derived_failures.len(), 1);
    assert_eq!(result.derived_failures[0].step, "update_index");

    // Record, file and commit are all in place
    assert!(harness.db.get_record("d4").await.unwrap().is_some());
    assert!(harness.dir.path().join("records/bylaw/d4.md").is_file());
    assert_eq!(harness.env.vcs.history(5).await.unwrap().len(), 1);
}

#[tokio::test]
async fn stuck_saga_recovery_compensates_and_fails() {
    let harness = harness();
    let draft = seed_draft(&harness.db, "d6", "T", "# T").await;

    // Simulate a crash after load_draft and move_to_records succeeded
    let record = civica_common::record::Record::from_draft(&draft);
    harness.db.insert_record(&record).await.unwrap();

    let mut context = publish("d6");
    context.validate().unwrap();
    let mut saga = SagaInstance::new(
        "publish_draft",
        1,
        serde_json::to_value(&context).unwrap(),
        None,
        None,
    );
    saga.status = SagaStatus::Executing;
    saga.current_step = 2;
    let mut load = StepRecord::new(0, "load_draft");
    load.status = StepStatus::Succeeded;
    load.output = Some(serde_json::to_value(&draft).unwrap());
    load.attempts = 1;
    let mut moved = StepRecord::new(1, "move_to_records");
    moved.status = StepStatus::Succeeded;
    moved.output = Some(serde_json::to_value(&record).unwrap());
    moved.attempts = 1;
    saga.step_results = vec![load, moved];
    harness.db.create_saga(&saga).await.unwrap();

    // Let updated_at age past the (zero) threshold; no heartbeat arrives
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let recovery = RecoveryCoordinator::new(
        harness.db.clone(),
        harness.env.clone(),
        harness.registry.clone(),
        OrchestratorConfig {
            stuck_threshold: Duration::ZERO,
            ..harness.config.clone()
        },
        harness.executor.metrics(),
    );
    let report = recovery.sweep_once().await.unwrap();

    assert_eq!(report.scanned, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.compensated_steps, 2);

    let recovered = harness.db.load_saga(&saga.saga_id).await.unwrap();
    assert_eq!(recovered.status, SagaStatus::Failed);
    assert!(recovered.error.as_deref().unwrap().contains("stuck/abandoned"));
    assert_eq!(recovered.step_results[1].status, StepStatus::Compensated);

    // The half-applied publish was rolled back and the locks are gone
    assert!(harness.db.get_record("d6").await.unwrap().is_none());
    assert!(harness.db.get_draft("d6").await.unwrap().is_some());
    assert!(harness
        .db
        .locks_held_by(&saga.saga_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn create_update_archive_lifecycle() {
    let harness = harness();

    let created = harness
        .executor
        .execute(
            SagaContext::CreateRecord(CreateRecordContext {
                title: "Noise Ordinance".to_string(),
                record_type: "bylaw".to_string(),
                body: "# Noise".to_string(),
                record_id: None,
            }),
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(created.status, SagaStatus::Completed);
    let id = "noise-ordinance";

    let row = harness.db.get_record(id).await.unwrap().unwrap();
    assert_eq!(row.status, RecordStatus::Draft);
    let file = harness.dir.path().join("records/bylaw/noise-ordinance.md");
    assert!(file.is_file());

    let updated = harness
        .executor
        .execute(
            SagaContext::UpdateRecord(UpdateRecordContext {
                record_id: id.to_string(),
                title: None,
                body: Some("# Noise, revised".to_string()),
            }),
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(updated.status, SagaStatus::Completed);

    let row = harness.db.get_record(id).await.unwrap().unwrap();
    assert_eq!(row.body, "# Noise, revised");
    assert!(std::fs::read_to_string(&file)
        .unwrap()
        .contains("# Noise, revised"));

    let archived = harness
        .executor
        .execute(
            SagaContext::ArchiveRecord(ArchiveRecordContext {
                record_id: id.to_string(),
            }),
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(archived.status, SagaStatus::Completed);

    let row = harness.db.get_record(id).await.unwrap().unwrap();
    assert_eq!(row.status, RecordStatus::Archived);
    assert!(!file.exists());
    assert!(harness
        .dir
        .path()
        .join("archive/bylaw/noise-ordinance.md")
        .is_file());

    let history = harness.env.vcs.history(10).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history[0].message.contains("Archive record"));
    assert!(history[1].message.contains("Update record"));
    assert!(history[2].message.contains("Create record"));
}

#[tokio::test]
async fn publish_missing_draft_is_a_clean_failure() {
    let harness = harness();

    let result = harness
        .executor
        .execute(publish("ghost"), ExecuteOptions::default())
        .await
        .unwrap();

    // Nothing succeeded, so there is nothing to roll back
    assert_eq!(result.status, SagaStatus::Compensated);
    assert!(result.error.as_deref().unwrap().contains("ghost"));
    assert!(harness.env.vcs.history(5).await.unwrap().is_empty());
}
