use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Scheduling defaults
pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 60_000; // one heartbeat slot
pub const DEFAULT_STALE_SLOT_COUNT: u32 = 2; // missed slots before a job is reaped
pub const DEFAULT_DISPATCH_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_TRIGGER_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_CANCEL_GRACE_PERIOD_MS: u64 = 60_000;

/// Top-level config (conveyor.toml + CONVEYOR_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConveyorConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Job engine tuning knobs.
///
/// All intervals are expressed in milliseconds so they can be overridden from
/// the environment, e.g. `CONVEYOR_JOBS__HEARTBEAT_INTERVAL_MS=5000`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Concurrent execution slots per tenant.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Per-tenant overrides of `pool_size`.
    #[serde(default)]
    pub tenant_pool_sizes: HashMap<String, usize>,
    /// Heartbeat sweep cadence `T`.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// A running job is dead once `now - last_heartbeat > N * T`.
    #[serde(default = "default_stale_slot_count")]
    pub stale_slot_count: u32,
    #[serde(default = "default_dispatch_interval_ms")]
    pub dispatch_interval_ms: u64,
    #[serde(default = "default_trigger_interval_ms")]
    pub trigger_interval_ms: u64,
    /// How long a running job gets to honour a stop request before its task
    /// is aborted.
    #[serde(default = "default_cancel_grace_period_ms")]
    pub cancel_grace_period_ms: u64,
    /// Tenants always visited by the periodic loops, even with no live jobs.
    #[serde(default)]
    pub tenants: Vec<String>,
    /// Tenants whose queues are not dispatched (maintenance mode).
    #[serde(default)]
    pub maintenance_tenants: Vec<String>,
    /// Parent of the private directories handed to jobs that ask for one.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            tenant_pool_sizes: HashMap::new(),
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            stale_slot_count: DEFAULT_STALE_SLOT_COUNT,
            dispatch_interval_ms: DEFAULT_DISPATCH_INTERVAL_MS,
            trigger_interval_ms: DEFAULT_TRIGGER_INTERVAL_MS,
            cancel_grace_period_ms: DEFAULT_CANCEL_GRACE_PERIOD_MS,
            tenants: Vec::new(),
            maintenance_tenants: Vec::new(),
            workspace_root: default_workspace_root(),
        }
    }
}

impl JobsConfig {
    /// Slot count for `tenant`, falling back to the deployment-wide size.
    pub fn pool_size_for(&self, tenant: &str) -> usize {
        self.tenant_pool_sizes
            .get(tenant)
            .copied()
            .unwrap_or(self.pool_size)
    }

    /// Private directory of job `job_id`.
    pub fn workspace_for(&self, job_id: &str) -> PathBuf {
        PathBuf::from(&self.workspace_root).join(job_id)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Age after which a running job's heartbeat is considered stale (`N * T`).
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval() * self.stale_slot_count
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    pub fn trigger_interval(&self) -> Duration {
        Duration::from_millis(self.trigger_interval_ms)
    }

    pub fn cancel_grace_period(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_period_ms)
    }

    /// Reject values that would make the loops spin or never dispatch.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.pool_size == 0 {
            return Err(crate::error::CoreError::Config(
                "jobs.pool_size must be at least 1".to_string(),
            ));
        }
        if let Some((tenant, _)) = self.tenant_pool_sizes.iter().find(|(_, n)| **n == 0) {
            return Err(crate::error::CoreError::Config(format!(
                "jobs.tenant_pool_sizes.{tenant} must be at least 1"
            )));
        }
        if self.stale_slot_count == 0 {
            return Err(crate::error::CoreError::Config(
                "jobs.stale_slot_count must be at least 1".to_string(),
            ));
        }
        for (name, ms) in [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("dispatch_interval_ms", self.dispatch_interval_ms),
            ("trigger_interval_ms", self.trigger_interval_ms),
        ] {
            if ms == 0 {
                return Err(crate::error::CoreError::Config(format!(
                    "jobs.{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}
fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}
fn default_stale_slot_count() -> u32 {
    DEFAULT_STALE_SLOT_COUNT
}
fn default_dispatch_interval_ms() -> u64 {
    DEFAULT_DISPATCH_INTERVAL_MS
}
fn default_trigger_interval_ms() -> u64 {
    DEFAULT_TRIGGER_INTERVAL_MS
}
fn default_cancel_grace_period_ms() -> u64 {
    DEFAULT_CANCEL_GRACE_PERIOD_MS
}
fn default_workspace_root() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.conveyor/workspaces", home)
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.conveyor/conveyor.db", home)
}

impl ConveyorConfig {
    /// Load config from a TOML file with CONVEYOR_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.conveyor/conveyor.toml
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ConveyorConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CONVEYOR_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        config.jobs.validate()?;
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.conveyor/conveyor.toml", home)
}
