//! Saga executor
//!
//! Drives a saga instance through its steps: idempotency short-circuit,
//! sorted lock acquisition, the forward step loop with per-step timeouts
//! and retries, and the strict-reverse compensation loop on authoritative
//! failure. Every transition is persisted before the next step runs, so a
//! crashed executor leaves a resumable instance behind.
//!
//! # Failure handling
//!
//! If any authoritative step fails, compensations for the succeeded prefix
//! are executed in reverse order to restore the backends to their pre-saga
//! state. Derived step failures are recorded in the result envelope and do
//! not fail the saga.
//!
//! # Return shape
//!
//! `execute` returns `Ok(SagaResult)` for any saga the pipeline drove to a
//! terminal state — `completed` and rolled-back (`compensated`) alike; the
//! envelope's `status`, `compensated` and `error` fields tell them apart.
//! `Err(..)` is reserved for invocation-level failures (invalid context,
//! unknown definition, `InProgress`, `Locked`, `Conflict`) and for
//! compensation failures, which need an operator.

use std::sync::Arc;
use std::time::Duration;

use civica_common::common::Lease;
use civica_common::context::SagaContext;
use civica_common::database::{self, DynStateStore, SagaUpdate};
use civica_common::saga::{
    DerivedFailure, SagaInstance, SagaResult, SagaStatus, StepCriticality, StepRecord, StepStatus,
};
use civica_common::util::unix_time;
use civica_common::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::idempotency::{IdempotencyCheck, IdempotencyManager};
use crate::locks::LockManager;
use crate::metrics::SagaMetrics;
use crate::registry::{SagaDefinition, SagaRegistry};
use crate::step::{SagaEnvironment, SagaStep, StepContext, StepOutcome};

/// Per-invocation options
#[derive(Debug, Default, Clone)]
pub struct ExecuteOptions {
    /// Caller trace token, carried through logs and saga state
    pub correlation_id: Option<String>,
    /// Binds the invocation to a prior outcome; omitted means every
    /// invocation is a new saga
    pub idempotency_key: Option<String>,
    /// Overall saga deadline override
    pub saga_timeout: Option<Duration>,
    /// Cooperative cancellation signal
    pub cancel: Option<CancellationToken>,
}

/// How the forward loop ended
enum ForwardEnd {
    Completed,
    Abort { step: String, cause: Error },
}

/// The saga executor
#[derive(Debug, Clone)]
pub struct Executor {
    store: DynStateStore,
    env: SagaEnvironment,
    registry: Arc<SagaRegistry>,
    config: OrchestratorConfig,
    locks: LockManager,
    idempotency: IdempotencyManager,
    metrics: Arc<SagaMetrics>,
    semaphore: Option<Arc<Semaphore>>,
}

impl Executor {
    /// Executor over the given store, environment and registry
    pub fn new(
        store: DynStateStore,
        env: SagaEnvironment,
        registry: Arc<SagaRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        let locks = LockManager::new(store.clone(), config.default_lock_ttl);
        let idempotency = IdempotencyManager::new(store.clone());
        let semaphore = config
            .max_concurrent_sagas
            .map(|n| Arc::new(Semaphore::new(n)));

        Self {
            store,
            env,
            registry,
            config,
            locks,
            idempotency,
            metrics: Arc::new(SagaMetrics::default()),
            semaphore,
        }
    }

    /// Counters shared with the recovery coordinator
    pub fn metrics(&self) -> Arc<SagaMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Execute one logical operation under the latest registered definition
    /// for its saga type.
    #[instrument(skip_all, fields(saga_type = context.saga_type(), correlation_id = opts.correlation_id.as_deref()))]
    pub async fn execute(
        &self,
        mut context: SagaContext,
        opts: ExecuteOptions,
    ) -> Result<SagaResult, Error> {
        context.validate()?;

        if let Some(key) = &opts.idempotency_key {
            match self.idempotency.check(key).await? {
                IdempotencyCheck::Finalized(outcome) => {
                    self.metrics.idempotency_hit();
                    tracing::info!("Idempotency hit, returning stored outcome");
                    return Ok(outcome);
                }
                IdempotencyCheck::InFlight(saga_id) => {
                    return Err(Error::InProgress(saga_id));
                }
                IdempotencyCheck::Vacant => {}
            }
        }

        let definition = self.registry.latest(context.saga_type())?;

        let saga = SagaInstance::new(
            definition.name(),
            definition.version(),
            serde_json::to_value(&context)?,
            opts.correlation_id.clone(),
            opts.idempotency_key.clone(),
        );

        match self.store.create_saga(&saga).await {
            Ok(()) => {}
            Err(database::Error::IdempotencyFinalized { outcome, .. }) => {
                self.metrics.idempotency_hit();
                return Ok(serde_json::from_value(outcome)?);
            }
            Err(database::Error::Duplicate) => {
                // A simultaneous caller with the same key won the race
                if let Some(key) = &opts.idempotency_key {
                    match self.idempotency.check(key).await? {
                        IdempotencyCheck::Finalized(outcome) => return Ok(outcome),
                        IdempotencyCheck::InFlight(saga_id) => {
                            return Err(Error::InProgress(saga_id))
                        }
                        IdempotencyCheck::Vacant => {}
                    }
                }
                return Err(Error::Conflict("saga already exists".to_string()));
            }
            Err(err) => return Err(err.into()),
        }

        let _permit = match &self.semaphore {
            Some(semaphore) => Some(
                Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Internal("executor shut down".to_string()))?,
            ),
            None => None,
        };

        self.metrics.saga_started();
        self.drive(definition, saga, context, opts).await
    }

    /// Operator-initiated resume of a persisted, non-terminal saga.
    ///
    /// Re-enters the step loop at `current_step` for an `executing` saga, or
    /// the compensation loop for a `compensating` one. Takes ownership via
    /// the saga's version, so a still-live executor loses its next update
    /// with `Conflict`.
    #[instrument(skip(self))]
    pub async fn resume(&self, saga_id: Uuid) -> Result<SagaResult, Error> {
        let saga = self.store.load_saga(&saga_id).await?;

        if saga.status.is_terminal() {
            return Ok(SagaResult {
                saga_id: saga.saga_id,
                status: saga.status,
                result_value: None,
                compensated: saga.status == SagaStatus::Compensated,
                error: saga.error.clone(),
                derived_failures: Vec::new(),
            });
        }

        let definition = self.registry.get(&saga.saga_type, saga.saga_version)?;
        let context: SagaContext = serde_json::from_value(saga.context.clone())?;

        self.drive(definition, saga, context, ExecuteOptions::default())
            .await
    }

    /// Drive a persisted saga to a terminal state.
    async fn drive(
        &self,
        definition: Arc<SagaDefinition>,
        saga: SagaInstance,
        context: SagaContext,
        opts: ExecuteOptions,
    ) -> Result<SagaResult, Error> {
        let saga_timeout = opts.saga_timeout.unwrap_or(self.config.default_saga_timeout);

        let mut run = SagaRun {
            exec: self,
            definition,
            version: saga.version,
            compensating: saga.status == SagaStatus::Compensating,
            saga,
            context,
            cancel: opts.cancel.unwrap_or_default(),
            deadline: Instant::now() + saga_timeout,
            leases: Vec::new(),
            last_renew: Instant::now(),
            derived_failures: Vec::new(),
        };

        run.persist(SagaUpdate::status(if run.compensating {
            SagaStatus::Compensating
        } else {
            SagaStatus::Executing
        }))
        .await?;

        // All declared resources, sorted, before the first step
        let resources = run.context.resources();
        match self
            .locks
            .acquire_all(&resources, &run.saga.saga_id, self.config.lock_wait)
            .await
        {
            Ok(leases) => run.leases = leases,
            Err(err) => {
                run.finalize(SagaStatus::Failed, None, Some(err.to_string()))
                    .await?;
                return Err(err);
            }
        }

        if run.compensating {
            return run.compensate_and_finalize("resumed compensation".to_string()).await;
        }

        match run.forward().await? {
            ForwardEnd::Completed => {
                let value = result_value(&run.context);
                run.finalize(SagaStatus::Completed, Some(value), None).await
            }
            ForwardEnd::Abort { step, cause } => {
                tracing::warn!("Step `{step}` failed, compensating: {cause}");
                let failure = Error::StepFailed {
                    step,
                    cause: cause.to_string(),
                };
                run.compensate_and_finalize(failure.to_string()).await
            }
        }
    }
}

/// Saga-type-specific payload of the result envelope
fn result_value(context: &SagaContext) -> serde_json::Value {
    match context {
        SagaContext::CreateRecord(ctx) => {
            serde_json::json!({ "record_id": ctx.record_id })
        }
        SagaContext::UpdateRecord(ctx) => {
            serde_json::json!({ "record_id": ctx.record_id })
        }
        SagaContext::PublishDraft(ctx) => {
            serde_json::json!({ "record_id": ctx.draft_id })
        }
        SagaContext::ArchiveRecord(ctx) => {
            serde_json::json!({ "record_id": ctx.record_id })
        }
    }
}

/// One in-flight execution: the executor's view of a single saga instance.
struct SagaRun<'a> {
    exec: &'a Executor,
    definition: Arc<SagaDefinition>,
    saga: SagaInstance,
    version: u64,
    compensating: bool,
    context: SagaContext,
    cancel: CancellationToken,
    deadline: Instant,
    leases: Vec<Lease>,
    last_renew: Instant,
    derived_failures: Vec<DerivedFailure>,
}

impl SagaRun<'_> {
    /// Persist a mutation under this run's version. A version conflict
    /// means another executor took the saga over; this run must stop.
    async fn persist(&mut self, update: SagaUpdate) -> Result<(), Error> {
        match self
            .exec
            .store
            .update_saga(&self.saga.saga_id, self.version, update)
            .await
        {
            Ok(version) => {
                self.version = version;
                Ok(())
            }
            Err(database::Error::VersionConflict) => Err(Error::Conflict(
                "saga advanced by another executor".to_string(),
            )),
            Err(err) => Err(err.into()),
        }
    }

    /// Persist the current step results and cursor
    async fn persist_progress(&mut self, status: Option<SagaStatus>) -> Result<(), Error> {
        if let Some(status) = status {
            self.saga.status = status;
        }
        self.persist(SagaUpdate {
            status,
            current_step: Some(self.saga.current_step),
            step_results: Some(self.saga.step_results.clone()),
            ..Default::default()
        })
        .await
    }

    fn step_ctx(&self) -> StepContext {
        StepContext {
            saga_id: self.saga.saga_id,
            correlation_id: self.saga.correlation_id.clone(),
            context: self.context.clone(),
            outputs: StepContext::outputs_from(&self.saga.step_results),
            cancel: self.cancel.clone(),
        }
    }

    /// Renew held leases at the configured cadence; a lost lease aborts.
    async fn maybe_renew(&mut self) -> Result<(), Error> {
        if self.leases.is_empty()
            || self.last_renew.elapsed() < self.exec.config.lease_renew_interval
        {
            return Ok(());
        }

        self.exec.locks.renew_all(&mut self.leases).await?;
        // Long step loops renew far more often than they persist; keep the
        // abandonment clock fresh alongside the leases
        self.exec.store.heartbeat(&self.saga.saga_id).await?;
        self.last_renew = Instant::now();
        Ok(())
    }

    /// The forward step loop, from the persisted cursor upward.
    async fn forward(&mut self) -> Result<ForwardEnd, Error> {
        let steps: Vec<Arc<dyn SagaStep>> = self.definition.steps().to_vec();

        while self.saga.current_step < steps.len() {
            let i = self.saga.current_step;
            let step = Arc::clone(&steps[i]);

            // Suspension boundary: cancellation, overall deadline, leases
            if self.cancel.is_cancelled() {
                return Ok(ForwardEnd::Abort {
                    step: step.name().to_string(),
                    cause: Error::Cancelled,
                });
            }
            if Instant::now() >= self.deadline {
                return Ok(ForwardEnd::Abort {
                    step: step.name().to_string(),
                    cause: Error::Timeout,
                });
            }
            if let Err(err) = self.maybe_renew().await {
                return Ok(ForwardEnd::Abort {
                    step: step.name().to_string(),
                    cause: err,
                });
            }

            if self.saga.step_results.len() <= i {
                self.saga.step_results.push(StepRecord::new(i, step.name()));
            }

            match self.run_step(i, &step).await? {
                None => {
                    // Succeeded or derived-failed; either way the cursor moved
                }
                Some(cause) => {
                    return Ok(ForwardEnd::Abort {
                        step: step.name().to_string(),
                        cause,
                    });
                }
            }
        }

        Ok(ForwardEnd::Completed)
    }

    /// Run one step to its final status. Returns the aborting cause for an
    /// authoritative failure, `None` when the saga may advance.
    async fn run_step(
        &mut self,
        i: usize,
        step: &Arc<dyn SagaStep>,
    ) -> Result<Option<Error>, Error> {
        let policy = step.retry_policy();
        let step_timeout = step
            .timeout()
            .unwrap_or(self.exec.config.default_step_timeout);

        let final_err = loop {
            let attempt = {
                let record = &mut self.saga.step_results[i];
                record.attempts += 1;
                record.status = StepStatus::Pending;
                if record.started_at.is_none() {
                    record.started_at = Some(unix_time());
                }
                record.attempts
            };
            // Persisting the attempt doubles as the heartbeat the recovery
            // sweep watches
            self.persist_progress(None).await?;
            self.exec.metrics.step_executed();

            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Error::Timeout;
            }

            let ctx = self.step_ctx();
            let outcome = match tokio::time::timeout(
                step_timeout.min(remaining),
                step.forward(&self.exec.env, &ctx),
            )
            .await
            {
                Ok(outcome) => outcome,
                // Permanent for this attempt; the policy may retry
                Err(_) => StepOutcome::Transient(Error::Timeout),
            };

            match outcome {
                StepOutcome::Complete(output) => {
                    let record = &mut self.saga.step_results[i];
                    record.status = StepStatus::Succeeded;
                    record.output = Some(output);
                    record.error = None;
                    record.finished_at = Some(unix_time());
                    self.saga.current_step = i + 1;
                    self.persist_progress(None).await?;
                    return Ok(None);
                }
                StepOutcome::Transient(err) if attempt < policy.max_attempts => {
                    tracing::debug!(
                        "Step `{}` attempt {attempt} failed transiently: {err}",
                        step.name()
                    );
                    self.exec.metrics.step_retried();
                    tokio::time::sleep(policy.backoff(attempt + 1)).await;
                }
                StepOutcome::Transient(err) | StepOutcome::Permanent(err) => break err,
            }
        };

        {
            let record = &mut self.saga.step_results[i];
            record.status = StepStatus::Failed;
            record.error = Some(final_err.to_string());
            record.finished_at = Some(unix_time());
        }

        match step.criticality() {
            StepCriticality::Derived => {
                tracing::warn!(
                    "Derived step `{}` failed, continuing: {final_err}",
                    step.name()
                );
                self.exec.metrics.derived_failure();
                self.derived_failures.push(DerivedFailure {
                    step: step.name().to_string(),
                    error: final_err.to_string(),
                });
                self.saga.current_step = i + 1;
                self.persist_progress(None).await?;
                Ok(None)
            }
            StepCriticality::Authoritative => {
                self.persist_progress(None).await?;
                Ok(Some(final_err))
            }
        }
    }

    /// Compensate the succeeded prefix in strict reverse order, then
    /// finalize. A failed compensation leaves the saga `failed` with full
    /// diagnostics and surfaces `CompensationFailed` to the caller.
    async fn compensate_and_finalize(
        &mut self,
        trigger: String,
    ) -> Result<SagaResult, Error> {
        self.persist_progress(Some(SagaStatus::Compensating)).await?;

        let succeeded: Vec<usize> = self
            .saga
            .step_results
            .iter()
            .filter(|r| r.status == StepStatus::Succeeded)
            .map(|r| r.index)
            .rev()
            .collect();

        if !succeeded.is_empty() {
            tracing::warn!("Running {} compensating actions", succeeded.len());
        }

        for j in succeeded {
            let step = self.definition.steps().get(j).cloned();
            let step = match step {
                Some(step) => step,
                None => {
                    return self
                        .fail_compensation(
                            format!("step {j}"),
                            "definition has no such step".to_string(),
                            trigger,
                        )
                        .await;
                }
            };

            tracing::debug!("Running compensation: {}", step.name());
            self.exec.metrics.compensation_run();

            let ctx = self.step_ctx();
            let output = self.saga.step_results[j].output.clone();
            let step_timeout = step
                .timeout()
                .unwrap_or(self.exec.config.default_step_timeout);

            let result = tokio::time::timeout(
                step_timeout,
                step.compensate(&self.exec.env, &ctx, output.as_ref()),
            )
            .await;

            match result {
                Ok(Ok(())) => {
                    self.saga.step_results[j].status = StepStatus::Compensated;
                    self.persist_progress(None).await?;
                }
                Ok(Err(err)) => {
                    return self
                        .fail_compensation(step.name().to_string(), err.to_string(), trigger)
                        .await;
                }
                Err(_) => {
                    return self
                        .fail_compensation(
                            step.name().to_string(),
                            Error::Timeout.to_string(),
                            trigger,
                        )
                        .await;
                }
            }
        }

        self.finalize(SagaStatus::Compensated, None, Some(trigger))
            .await
    }

    /// Terminal `failed` after a compensation error. Remaining succeeded
    /// steps are left as-is for an operator or recovery tool to reconcile.
    async fn fail_compensation(
        &mut self,
        step: String,
        cause: String,
        trigger: String,
    ) -> Result<SagaResult, Error> {
        tracing::error!("Compensation {step} failed: {cause}");
        let error = format!("{trigger}; compensation `{step}` failed: {cause}");
        self.finalize(SagaStatus::Failed, None, Some(error)).await?;
        Err(Error::CompensationFailed { step, cause })
    }

    /// Write the terminal state. The store releases this saga's locks in
    /// the same transaction; the idempotency outcome is bound afterwards.
    async fn finalize(
        &mut self,
        status: SagaStatus,
        result_value: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<SagaResult, Error> {
        self.saga.status = status;
        self.persist(SagaUpdate {
            status: Some(status),
            current_step: Some(self.saga.current_step),
            step_results: Some(self.saga.step_results.clone()),
            error: error.clone(),
            finished_at: Some(unix_time()),
        })
        .await?;
        self.leases.clear();

        let result = SagaResult {
            saga_id: self.saga.saga_id,
            status,
            result_value,
            compensated: status == SagaStatus::Compensated,
            error,
            derived_failures: self.derived_failures.clone(),
        };

        if let Some(key) = &self.saga.idempotency_key {
            if let Err(err) = self
                .exec
                .idempotency
                .finalize(key, &self.saga.saga_id, &result)
                .await
            {
                // The key check reconstructs the outcome from the saga row,
                // so a failed write here is recoverable
                tracing::warn!("Failed to record idempotency outcome: {err}");
            }
        }

        match status {
            SagaStatus::Completed => self.exec.metrics.saga_completed(),
            SagaStatus::Compensated => self.exec.metrics.saga_compensated(),
            _ => self.exec.metrics.saga_failed(),
        }

        tracing::info!(
            saga_id = %self.saga.saga_id,
            status = %status,
            "Saga finished"
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests;
