//! Shared fixtures for orchestrator tests
#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use civica_common::database::DynStateStore;
use civica_common::record::Draft;
use civica_common::saga::StepCriticality;
use civica_common::util::unix_time;
use civica_common::Error;
use civica_sqlite::CivicaSqliteDatabase;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::adapters::events::EventSink;
use crate::adapters::fs::RecordsTree;
use crate::adapters::index::IndexingService;
use crate::adapters::vcs::GitVcs;
use crate::config::OrchestratorConfig;
use crate::registry::SagaRegistry;
use crate::retry::RetryPolicy;
use crate::step::{SagaEnvironment, SagaStep, StepContext, StepOutcome};
use crate::Executor;

/// Event sink double that records every emitted event
#[derive(Debug, Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingEvents {
    pub fn emitted(&self) -> Vec<(String, serde_json::Value)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl EventSink for RecordingEvents {
    async fn emit(&self, event_type: &str, payload: serde_json::Value) -> Result<(), Error> {
        self.events
            .lock()
            .unwrap()
            .push((event_type.to_string(), payload));
        Ok(())
    }
}

/// Indexing double that always errors
#[derive(Debug, Default)]
pub struct FailingIndex;

#[async_trait::async_trait]
impl IndexingService for FailingIndex {
    async fn reindex(&self, record_id: &str) -> Result<(), Error> {
        Err(Error::Unavailable(format!(
            "index refused record `{record_id}`"
        )))
    }
}

/// Records the global order of forward and compensation invocations
#[derive(Debug, Default)]
pub struct Probe {
    events: Mutex<Vec<String>>,
}

impl Probe {
    pub fn log(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

/// A step whose behavior is scripted by the test
#[derive(Debug)]
pub struct ScriptedStep {
    pub name: &'static str,
    pub criticality: StepCriticality,
    /// First N forward attempts fail transiently
    pub transient_failures: u32,
    /// Every attempt fails permanently
    pub fail_permanent: bool,
    /// Compensation fails
    pub fail_compensation: bool,
    /// Cancelled once the forward action succeeds
    pub cancel_on_success: Option<CancellationToken>,
    pub max_attempts: u32,
    pub attempts: AtomicU32,
    pub probe: Arc<Probe>,
}

impl ScriptedStep {
    pub fn ok(name: &'static str, probe: Arc<Probe>) -> Self {
        Self {
            name,
            criticality: StepCriticality::Authoritative,
            transient_failures: 0,
            fail_permanent: false,
            fail_compensation: false,
            cancel_on_success: None,
            max_attempts: 3,
            attempts: AtomicU32::new(0),
            probe,
        }
    }

    pub fn failing(name: &'static str, probe: Arc<Probe>) -> Self {
        Self {
            fail_permanent: true,
            ..Self::ok(name, probe)
        }
    }

    pub fn flaky(name: &'static str, transient_failures: u32, probe: Arc<Probe>) -> Self {
        Self {
            transient_failures,
            ..Self::ok(name, probe)
        }
    }

    pub fn derived(name: &'static str, fail: bool, probe: Arc<Probe>) -> Self {
        Self {
            criticality: StepCriticality::Derived,
            fail_permanent: fail,
            ..Self::ok(name, probe)
        }
    }
}

#[async_trait::async_trait]
impl SagaStep for ScriptedStep {
    fn name(&self) -> &'static str {
        self.name
    }

    fn criticality(&self) -> StepCriticality {
        self.criticality
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(5),
        }
    }

    async fn forward(&self, _env: &SagaEnvironment, _ctx: &StepContext) -> StepOutcome {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.log(format!("forward:{}:{attempt}", self.name));

        if attempt <= self.transient_failures {
            return StepOutcome::Transient(Error::Unavailable("scripted outage".to_string()));
        }
        if self.fail_permanent {
            return StepOutcome::Permanent(Error::Internal("scripted failure".to_string()));
        }

        if let Some(token) = &self.cancel_on_success {
            token.cancel();
        }

        StepOutcome::Complete(serde_json::json!({ "step": self.name }))
    }

    async fn compensate(
        &self,
        _env: &SagaEnvironment,
        _ctx: &StepContext,
        _output: Option<&serde_json::Value>,
    ) -> Result<(), Error> {
        self.probe.log(format!("compensate:{}", self.name));
        if self.fail_compensation {
            return Err(Error::Internal("scripted compensation failure".to_string()));
        }
        Ok(())
    }
}

/// A full orchestrator wired to an in-memory store, a temp records tree and
/// a temp git repository
pub struct Harness {
    pub db: Arc<CivicaSqliteDatabase>,
    pub env: SagaEnvironment,
    pub registry: Arc<SagaRegistry>,
    pub executor: Executor,
    pub config: OrchestratorConfig,
    pub events: Arc<RecordingEvents>,
    /// Keeps the temp directory alive for the test's duration
    pub dir: TempDir,
}

pub struct HarnessBuilder {
    config: OrchestratorConfig,
    index: Arc<dyn IndexingService>,
    missing_records_root: bool,
    register_builtin: bool,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            config: fast_config(),
            index: Arc::new(crate::adapters::index::NoopIndex),
            missing_records_root: false,
            register_builtin: true,
        }
    }
}

/// Tight timeouts so failure-path tests stay fast
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        default_step_timeout: std::time::Duration::from_secs(5),
        default_saga_timeout: std::time::Duration::from_secs(30),
        lock_wait: std::time::Duration::from_millis(200),
        ..OrchestratorConfig::default()
    }
}

impl HarnessBuilder {
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn index(mut self, index: Arc<dyn IndexingService>) -> Self {
        self.index = index;
        self
    }

    /// Point the working tree at a directory that does not exist, so every
    /// file write fails
    pub fn missing_records_root(mut self) -> Self {
        self.missing_records_root = true;
        self
    }

    /// Leave the registry empty for scripted definitions
    pub fn without_builtin_sagas(mut self) -> Self {
        self.register_builtin = false;
        self
    }

    pub fn build(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(CivicaSqliteDatabase::memory().unwrap());
        let events = Arc::new(RecordingEvents::default());

        let tree_root = if self.missing_records_root {
            dir.path().join("missing")
        } else {
            dir.path().to_path_buf()
        };

        let env = SagaEnvironment {
            records: db.clone(),
            vcs: Arc::new(GitVcs::open_or_init(dir.path()).unwrap()),
            tree: Arc::new(RecordsTree::new(tree_root)),
            events: events.clone(),
            index: self.index,
        };

        let registry = Arc::new(SagaRegistry::new());
        if self.register_builtin {
            crate::sagas::register_all(&registry).unwrap();
        }

        let store: DynStateStore = db.clone();
        let executor = Executor::new(store, env.clone(), registry.clone(), self.config.clone());

        Harness {
            db,
            env,
            registry,
            executor,
            config: self.config,
            events,
            dir,
        }
    }
}

/// Default harness with the built-in saga definitions
pub fn harness() -> Harness {
    HarnessBuilder::default().build()
}

/// A draft row ready to publish
pub async fn seed_draft(db: &CivicaSqliteDatabase, id: &str, title: &str, body: &str) -> Draft {
    use civica_common::database::RecordStore;

    let now = unix_time();
    let draft = Draft {
        id: id.to_string(),
        title: title.to_string(),
        record_type: "bylaw".to_string(),
        body: body.to_string(),
        created_at: now,
        updated_at: now,
    };
    db.insert_draft(&draft).await.unwrap();
    draft
}
