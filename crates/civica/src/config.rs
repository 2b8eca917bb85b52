//! Orchestrator configuration
//!
//! A plain value constructed at startup and threaded through the executor,
//! recovery coordinator and lock manager. No hidden global state; tests
//! build a fresh configuration per scenario.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_step_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_saga_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(600)
}

fn default_stuck_threshold() -> Duration {
    Duration::from_secs(600)
}

fn default_lease_renew_interval() -> Duration {
    // No slower than a third of the lock TTL
    Duration::from_secs(120)
}

fn default_lock_wait() -> Duration {
    Duration::from_secs(5)
}

/// Executor and recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Per-attempt ceiling for steps that do not declare their own timeout
    #[serde(default = "default_step_timeout")]
    pub default_step_timeout: Duration,
    /// Wall-clock ceiling for a whole saga, unless the caller overrides it
    #[serde(default = "default_saga_timeout")]
    pub default_saga_timeout: Duration,
    /// Resource lease TTL; must exceed the worst-case saga duration
    #[serde(default = "default_lock_ttl")]
    pub default_lock_ttl: Duration,
    /// Age of `updated_at` beyond which a non-terminal saga counts as stuck
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold: Duration,
    /// Cadence at which the executor renews held leases between steps
    #[serde(default = "default_lease_renew_interval")]
    pub lease_renew_interval: Duration,
    /// Bounded wait for lock acquisition before failing `Locked`
    #[serde(default = "default_lock_wait")]
    pub lock_wait: Duration,
    /// Cap on concurrently executing sagas; `None` means unbounded
    #[serde(default)]
    pub max_concurrent_sagas: Option<usize>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: default_step_timeout(),
            default_saga_timeout: default_saga_timeout(),
            default_lock_ttl: default_lock_ttl(),
            stuck_threshold: default_stuck_threshold(),
            lease_renew_interval: default_lease_renew_interval(),
            lock_wait: default_lock_wait(),
            max_concurrent_sagas: None,
        }
    }
}
