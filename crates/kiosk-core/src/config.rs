//! Orchestrator configuration types.

use crate::error::CoreError;
use std::time::Duration;

/// Configuration for the [`Orchestrator`](crate::Orchestrator).
///
/// All limits are fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of instances tracked at once, counting queued,
    /// provisioning and ready instances (default: 10).
    pub capacity: usize,
    /// Maximum number of instances provisioning at the same time (default: 2).
    pub max_concurrent_provisioning: usize,
    /// First local port handed out to sandboxes (default: 6080).
    pub base_port: u16,
    /// Inactivity window after which a ready instance is evicted
    /// (default: 10 minutes).
    pub idle_timeout: Duration,
    /// Interval of the sandbox liveness sweep (default: 60 seconds).
    pub liveness_interval: Duration,
    /// Number of health probes before giving up (default: 30).
    pub health_check_attempts: u32,
    /// Delay between health probes (default: 2 seconds).
    pub health_check_interval: Duration,
    /// Upper bound for any single provisioning call (default: 120 seconds).
    pub step_timeout: Duration,
    /// Upper bound for each teardown call during cleanup (default: 15 seconds).
    pub teardown_grace: Duration,
    /// Per-slot wait estimate reported to queued requests (default: 60 seconds).
    pub estimated_seconds_per_slot: u64,
    /// How long the outcome of a finished instance stays visible to its
    /// owner (default: 5 minutes).
    pub tombstone_ttl: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            max_concurrent_provisioning: 2,
            base_port: 6080,
            idle_timeout: Duration::from_secs(10 * 60),
            liveness_interval: Duration::from_secs(60),
            health_check_attempts: 30,
            health_check_interval: Duration::from_secs(2),
            step_timeout: Duration::from_secs(120),
            teardown_grace: Duration::from_secs(15),
            estimated_seconds_per_slot: 60,
            tombstone_ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl OrchestratorConfig {
    /// Create a new config builder.
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.capacity == 0 {
            return Err(CoreError::InvalidConfig("capacity must be > 0".into()));
        }
        if self.max_concurrent_provisioning == 0 {
            return Err(CoreError::InvalidConfig(
                "max_concurrent_provisioning must be > 0".into(),
            ));
        }
        if self.base_port == 0 {
            return Err(CoreError::InvalidConfig("base_port must be > 0".into()));
        }
        // Every tracked instance needs its own port above the base.
        if usize::from(u16::MAX - self.base_port) < self.capacity {
            return Err(CoreError::InvalidConfig(format!(
                "base_port {} leaves fewer than {} ports",
                self.base_port, self.capacity
            )));
        }
        if self.idle_timeout.is_zero() {
            return Err(CoreError::InvalidConfig("idle_timeout must be > 0".into()));
        }
        if self.liveness_interval.is_zero() {
            return Err(CoreError::InvalidConfig(
                "liveness_interval must be > 0".into(),
            ));
        }
        if self.health_check_attempts == 0 {
            return Err(CoreError::InvalidConfig(
                "health_check_attempts must be > 0".into(),
            ));
        }
        if self.step_timeout.is_zero() {
            return Err(CoreError::InvalidConfig("step_timeout must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for OrchestratorConfig.
#[derive(Debug, Default)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    /// Set the capacity limit.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Set the concurrency ceiling for provisioning.
    pub fn max_concurrent_provisioning(mut self, max: usize) -> Self {
        self.config.max_concurrent_provisioning = max;
        self
    }

    /// Set the first port handed out.
    pub fn base_port(mut self, port: u16) -> Self {
        self.config.base_port = port;
        self
    }

    /// Set the idle eviction window.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the liveness sweep interval.
    pub fn liveness_interval(mut self, interval: Duration) -> Self {
        self.config.liveness_interval = interval;
        self
    }

    /// Set the number of health probes and the delay between them.
    pub fn health_check(mut self, attempts: u32, interval: Duration) -> Self {
        self.config.health_check_attempts = attempts;
        self.config.health_check_interval = interval;
        self
    }

    /// Set the per-step provisioning timeout.
    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.config.step_timeout = timeout;
        self
    }

    /// Set the per-call teardown bound.
    pub fn teardown_grace(mut self, grace: Duration) -> Self {
        self.config.teardown_grace = grace;
        self
    }

    /// Set the per-slot wait estimate in seconds.
    pub fn estimated_seconds_per_slot(mut self, secs: u64) -> Self {
        self.config.estimated_seconds_per_slot = secs;
        self
    }

    /// Set how long finished instances stay visible.
    pub fn tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.config.tombstone_ttl = ttl;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<OrchestratorConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
