//! Recovery coordinator
//!
//! A long-running sweep over the state store that finds sagas stuck in
//! `executing` or `compensating` past the configured threshold, marks them
//! failed, releases their locks, and runs compensations for the succeeded
//! prefix. Forward progress is never resumed here; that stays an operator
//! decision because the operator must confirm step idempotency first.

use std::sync::Arc;

use civica_common::context::SagaContext;
use civica_common::database::{self, DynStateStore, SagaUpdate};
use civica_common::saga::{SagaInstance, SagaResult, SagaStatus, StepStatus};
use civica_common::util::unix_time;
use civica_common::Error;
use tokio::sync::Notify;
use tracing::instrument;

use crate::config::OrchestratorConfig;
use crate::idempotency::IdempotencyManager;
use crate::metrics::SagaMetrics;
use crate::registry::SagaRegistry;
use crate::step::{SagaEnvironment, StepContext};

/// Page size for one sweep
const SWEEP_PAGE: usize = 100;

/// What one sweep did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stuck candidates inspected
    pub scanned: usize,
    /// Sagas skipped because their lease is still live
    pub skipped: usize,
    /// Sagas moved to `failed`
    pub failed: usize,
    /// Compensations invoked across all recovered sagas
    pub compensated_steps: usize,
}

/// Periodic stuck-saga sweeper
#[derive(Debug, Clone)]
pub struct RecoveryCoordinator {
    store: DynStateStore,
    env: SagaEnvironment,
    registry: Arc<SagaRegistry>,
    config: OrchestratorConfig,
    idempotency: IdempotencyManager,
    metrics: Arc<SagaMetrics>,
}

impl RecoveryCoordinator {
    /// Coordinator over the same store, environment and registry the
    /// executor uses
    pub fn new(
        store: DynStateStore,
        env: SagaEnvironment,
        registry: Arc<SagaRegistry>,
        config: OrchestratorConfig,
        metrics: Arc<SagaMetrics>,
    ) -> Self {
        let idempotency = IdempotencyManager::new(store.clone());
        Self {
            store,
            env,
            registry,
            config,
            idempotency,
            metrics,
        }
    }

    /// Sweep until shut down, at half the stuck threshold
    pub async fn run(self, shutdown: Arc<Notify>) {
        let period = self.config.stuck_threshold / 2;
        let mut interval = tokio::time::interval(period.max(std::time::Duration::from_secs(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        tracing::error!("Recovery sweep failed: {err}");
                    }
                }
                _ = shutdown.notified() => {
                    tracing::info!("Recovery coordinator shutting down");
                    break;
                }
            }
        }
    }

    /// One bounded sweep over stuck sagas
    #[instrument(skip_all)]
    pub async fn sweep_once(&self) -> Result<RecoveryReport, Error> {
        self.metrics.recovery_sweep();

        let cutoff = unix_time().saturating_sub(self.config.stuck_threshold.as_secs());
        let stuck = self
            .store
            .list_sagas(
                &[SagaStatus::Executing, SagaStatus::Compensating],
                Some(cutoff),
                SWEEP_PAGE,
            )
            .await?;

        let mut report = RecoveryReport::default();

        for saga in stuck {
            report.scanned += 1;

            // A live executor renews its leases; a still-valid lease means
            // the saga may just be inside a long step
            let locks = self.store.locks_held_by(&saga.saga_id).await?;
            if locks.iter().any(|lock| !lock.is_expired()) {
                tracing::debug!(saga_id = %saga.saga_id, "Lease still live, skipping");
                report.skipped += 1;
                continue;
            }

            match self.fail_abandoned(saga).await {
                Ok(compensated) => {
                    report.failed += 1;
                    report.compensated_steps += compensated;
                    self.metrics.saga_recovered();
                }
                Err(Error::Conflict(_)) | Err(Error::Database(database::Error::VersionConflict)) => {
                    // Another executor or sweeper took it; leave it alone
                    report.skipped += 1;
                }
                Err(err) => {
                    tracing::error!("Failed to recover stuck saga: {err}");
                }
            }
        }

        if report.failed > 0 {
            tracing::warn!(
                "Recovery sweep failed {} abandoned sagas ({} compensations)",
                report.failed,
                report.compensated_steps
            );
        }

        Ok(report)
    }

    /// Take an abandoned saga over, compensate what succeeded, and mark it
    /// failed with its locks released. Returns how many compensations ran.
    async fn fail_abandoned(&self, mut saga: SagaInstance) -> Result<usize, Error> {
        tracing::warn!(
            saga_id = %saga.saga_id,
            saga_type = %saga.saga_type,
            "Marking stuck saga as failed"
        );

        // Take ownership: a racing executor now loses its next update
        let mut version = self
            .store
            .update_saga(
                &saga.saga_id,
                saga.version,
                SagaUpdate::status(SagaStatus::Compensating),
            )
            .await?;

        let definition = self.registry.get(&saga.saga_type, saga.saga_version)?;
        let context: SagaContext = serde_json::from_value(saga.context.clone())?;
        let cancel = tokio_util::sync::CancellationToken::new();

        let succeeded: Vec<usize> = saga
            .step_results
            .iter()
            .filter(|r| r.status == StepStatus::Succeeded)
            .map(|r| r.index)
            .rev()
            .collect();

        let mut compensated = 0;
        let mut compensation_error = None;

        for j in succeeded {
            let step = match self.definition_step(&definition, j) {
                Some(step) => step,
                None => {
                    compensation_error = Some(format!("definition has no step {j}"));
                    break;
                }
            };

            let ctx = StepContext {
                saga_id: saga.saga_id,
                correlation_id: saga.correlation_id.clone(),
                context: context.clone(),
                outputs: StepContext::outputs_from(&saga.step_results),
                cancel: cancel.clone(),
            };
            let output = saga.step_results[j].output.clone();
            let timeout = step
                .timeout()
                .unwrap_or(self.config.default_step_timeout);

            self.metrics.compensation_run();
            let result =
                tokio::time::timeout(timeout, step.compensate(&self.env, &ctx, output.as_ref()))
                    .await;

            match result {
                Ok(Ok(())) => {
                    saga.step_results[j].status = StepStatus::Compensated;
                    compensated += 1;
                    version = self
                        .store
                        .update_saga(
                            &saga.saga_id,
                            version,
                            SagaUpdate {
                                step_results: Some(saga.step_results.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                Ok(Err(err)) => {
                    compensation_error = Some(format!(
                        "compensation `{}` failed: {err}",
                        step.name()
                    ));
                    break;
                }
                Err(_) => {
                    compensation_error = Some(format!(
                        "compensation `{}` timed out",
                        step.name()
                    ));
                    break;
                }
            }
        }

        let error = match compensation_error {
            Some(detail) => format!("stuck/abandoned; {detail}"),
            None => "stuck/abandoned".to_string(),
        };

        // Terminal write releases the saga's locks atomically
        self.store
            .update_saga(
                &saga.saga_id,
                version,
                SagaUpdate {
                    status: Some(SagaStatus::Failed),
                    step_results: Some(saga.step_results.clone()),
                    error: Some(error.clone()),
                    finished_at: Some(unix_time()),
                    ..Default::default()
                },
            )
            .await?;

        // Finalize the key so a retry with it observes a terminal outcome
        if let Some(key) = &saga.idempotency_key {
            let outcome = SagaResult {
                saga_id: saga.saga_id,
                status: SagaStatus::Failed,
                result_value: None,
                compensated: false,
                error: Some(error),
                derived_failures: Vec::new(),
            };
            if let Err(err) = self.idempotency.finalize(key, &saga.saga_id, &outcome).await {
                tracing::warn!("Failed to record idempotency outcome: {err}");
            }
        }

        Ok(compensated)
    }

    fn definition_step(
        &self,
        definition: &crate::registry::SagaDefinition,
        index: usize,
    ) -> Option<Arc<dyn crate::step::SagaStep>> {
        definition.steps().get(index).cloned()
    }
}
