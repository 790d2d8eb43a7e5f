use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Orchestrator configuration with all tuning parameters.
///
/// Lease duration, heartbeat interval, staleness thresholds and the renewal
/// cap are operator-tuned per deployment; the components never hardcode them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    // Worker pool
    /// Number of concurrent worker loops
    pub pool_size: usize,
    /// Delay between ready-set polls when no work is available
    pub poll_interval: Duration,

    // Claim protocol
    /// Lease duration granted on claim, in minutes
    pub lease_minutes: i64,
    /// Maximum number of lease renewals per claim
    pub max_renewals: u32,

    // Liveness
    /// Interval between worker heartbeats
    pub heartbeat_interval: Duration,
    /// A worker with no heartbeat for this long is considered dead
    pub worker_stale_after: Duration,
    /// A running run older than this is swept even if its process is alive
    pub run_stale_after: Duration,
    /// Interval between reconciliation sweeps (zero disables the ticker)
    pub sweep_interval: Duration,

    // Shutdown
    /// Abandon in-flight work on termination signal instead of finishing it
    pub abandon_inflight_on_shutdown: bool,

    // Storage
    /// Database path for persistence
    pub db_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pool_size: num_cpus::get().max(2),
            poll_interval: Duration::from_millis(500),
            lease_minutes: 30,
            max_renewals: 12,
            heartbeat_interval: Duration::from_secs(30),
            worker_stale_after: Duration::from_secs(120),
            run_stale_after: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            abandon_inflight_on_shutdown: false,
            db_path: None,
        }
    }
}

impl OrchestratorConfig {
    /// Create a new builder
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.pool_size == 0 {
            return Err("pool_size must be greater than 0".to_string());
        }
        if self.lease_minutes <= 0 {
            return Err("lease_minutes must be greater than 0".to_string());
        }
        if self.worker_stale_after <= self.heartbeat_interval {
            return Err("worker_stale_after must be greater than heartbeat_interval".to_string());
        }
        if self.run_stale_after.is_zero() {
            return Err("run_stale_after must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Configuration tuned for tests and local development: short leases,
    /// fast polls, aggressive sweeps.
    pub fn development() -> Self {
        Self {
            pool_size: 2,
            poll_interval: Duration::from_millis(20),
            lease_minutes: 1,
            max_renewals: 3,
            heartbeat_interval: Duration::from_millis(100),
            worker_stale_after: Duration::from_millis(500),
            run_stale_after: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(200),
            ..Default::default()
        }
    }
}

/// Builder for OrchestratorConfig
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
        }
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.config.pool_size = pool_size;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn lease_minutes(mut self, minutes: i64) -> Self {
        self.config.lease_minutes = minutes;
        self
    }

    pub fn max_renewals(mut self, cap: u32) -> Self {
        self.config.max_renewals = cap;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn worker_stale_after(mut self, threshold: Duration) -> Self {
        self.config.worker_stale_after = threshold;
        self
    }

    pub fn run_stale_after(mut self, threshold: Duration) -> Self {
        self.config.run_stale_after = threshold;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn abandon_inflight_on_shutdown(mut self, abandon: bool) -> Self {
        self.config.abandon_inflight_on_shutdown = abandon;
        self
    }

    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.db_path = Some(path.into());
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<OrchestratorConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for OrchestratorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
