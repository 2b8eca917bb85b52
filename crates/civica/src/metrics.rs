//! In-process saga counters
//!
//! An explicit value owned by the executor and recovery coordinator rather
//! than a process-global registry, so tests can assert on a fresh set per
//! scenario.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by the executor and recovery coordinator
#[derive(Debug, Default)]
pub struct SagaMetrics {
    sagas_started: AtomicU64,
    sagas_completed: AtomicU64,
    sagas_compensated: AtomicU64,
    sagas_failed: AtomicU64,
    steps_executed: AtomicU64,
    step_retries: AtomicU64,
    compensations_run: AtomicU64,
    derived_failures: AtomicU64,
    idempotency_hits: AtomicU64,
    recovery_sweeps: AtomicU64,
    recovered_sagas: AtomicU64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub sagas_started: u64,
    pub sagas_completed: u64,
    pub sagas_compensated: u64,
    pub sagas_failed: u64,
    pub steps_executed: u64,
    pub step_retries: u64,
    pub compensations_run: u64,
    pub derived_failures: u64,
    pub idempotency_hits: u64,
    pub recovery_sweeps: u64,
    pub recovered_sagas: u64,
}

impl SagaMetrics {
    pub(crate) fn saga_started(&self) {
        self.sagas_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn saga_completed(&self) {
        self.sagas_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn saga_compensated(&self) {
        self.sagas_compensated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn saga_failed(&self) {
        self.sagas_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn step_executed(&self) {
        self.steps_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn step_retried(&self) {
        self.step_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn compensation_run(&self) {
        self.compensations_run.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn derived_failure(&self) {
        self.derived_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn idempotency_hit(&self) {
        self.idempotency_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn recovery_sweep(&self) {
        self.recovery_sweeps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn saga_recovered(&self) {
        self.recovered_sagas.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sagas_started: self.sagas_started.load(Ordering::Relaxed),
            sagas_completed: self.sagas_completed.load(Ordering::Relaxed),
            sagas_compensated: self.sagas_compensated.load(Ordering::Relaxed),
            sagas_failed: self.sagas_failed.load(Ordering::Relaxed),
            steps_executed: self.steps_executed.load(Ordering::Relaxed),
            step_retries: self.step_retries.load(Ordering::Relaxed),
            compensations_run: self.compensations_run.load(Ordering::Relaxed),
            derived_failures: self.derived_failures.load(Ordering::Relaxed),
            idempotency_hits: self.idempotency_hits.load(Ordering::Relaxed),
            recovery_sweeps: self.recovery_sweeps.load(Ordering::Relaxed),
            recovered_sagas: self.recovered_sagas.load(Ordering::Relaxed),
        }
    }
}
