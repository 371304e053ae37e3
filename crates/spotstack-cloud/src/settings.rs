//! Engine settings
//!
//! Every field has a default so a settings file only needs to name what it
//! overrides.

use crate::error::{CloudError, Result};
use crate::retry::RetryPolicy;
use crate::state::RollbackTrigger;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Directory holding one record per stack
    pub state_dir: PathBuf,
    /// Wait bound for short read-modify-write locks (monitor updates)
    pub lock_timeout_secs: u64,
    /// Wait bound for locks held by deploy/destroy/rollback
    pub operation_lock_timeout_secs: u64,
    /// A lock whose holder stopped refreshing it this long ago may be broken
    pub stale_lock_secs: u64,
    pub monitor: MonitorSettings,
    pub pricing: PricingSettings,
    pub retry: RetryPolicy,
    pub gateway: GatewaySettings,
    pub pipeline: PipelineSettings,
    pub recovery: RecoveryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".spotstack/state"),
            lock_timeout_secs: 30,
            operation_lock_timeout_secs: 1_800,
            stale_lock_secs: 600,
            monitor: MonitorSettings::default(),
            pricing: PricingSettings::default(),
            retry: RetryPolicy::default(),
            gateway: GatewaySettings::default(),
            pipeline: PipelineSettings::default(),
            recovery: RecoveryPolicy::default(),
        }
    }
}

impl EngineSettings {
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn operation_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_lock_timeout_secs)
    }

    pub fn stale_lock_after(&self) -> Duration {
        Duration::from_secs(self.stale_lock_secs)
    }

    /// Wall-clock bound for re-provisioning `stages` compute-tier stages
    /// during a restore, covering each stage's create and ready waits plus
    /// the service startup wait.
    pub fn restore_budget(&self, stages: u32) -> Duration {
        let per_stage = self.pipeline.ready_timeout()
            + self.gateway.call_timeout() * (self.retry.max_attempts + 1);
        per_stage * stages + self.pipeline.service_startup_timeout()
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(CloudError::Validation(msg.to_string()));

        if self.lock_timeout_secs == 0 || self.operation_lock_timeout_secs == 0 {
            return invalid("lock timeouts must be greater than zero");
        }
        if self.stale_lock_secs == 0 {
            return invalid("stale_lock_secs must be greater than zero");
        }
        if self.monitor.poll_interval_secs == 0 {
            return invalid("monitor.poll_interval_secs must be greater than zero");
        }
        if self.monitor.failure_threshold == 0 {
            return invalid("monitor.failure_threshold must be at least 1");
        }
        if !(0.0..1.0).contains(&self.pricing.spot_discount) {
            return invalid("pricing.spot_discount must be within [0, 1)");
        }
        if !(self.pricing.fallback_spot_price > 0.0) {
            return invalid("pricing.fallback_spot_price must be positive");
        }
        if self.retry.max_attempts == 0 || self.retry.backoff_multiplier < 1.0 {
            return invalid("retry.max_attempts must be >= 1 and backoff_multiplier >= 1.0");
        }
        if self.gateway.max_in_flight == 0 || self.gateway.call_timeout_secs == 0 {
            return invalid("gateway.max_in_flight and gateway.call_timeout_secs must be > 0");
        }
        if self.pipeline.startup_poll_interval_secs == 0 {
            return invalid("pipeline.startup_poll_interval_secs must be greater than zero");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub poll_interval_secs: u64,
    pub failure_threshold: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            failure_threshold: 3,
        }
    }
}

impl MonitorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingSettings {
    pub cache_ttl_secs: u64,
    /// Fraction taken off the on-demand price to estimate a spot price
    pub spot_discount: f64,
    /// Last-resort spot price (USD/h) when no on-demand price is known
    pub fallback_spot_price: f64,
    /// Durable storage price (USD per GiB-month)
    pub storage_price_gb_month: f64,
}

impl Default for PricingSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 15 * 60,
            spot_discount: 0.70,
            fallback_spot_price: 0.05,
            storage_price_gb_month: 0.08,
        }
    }
}

impl PricingSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Timeout of a single create/describe/delete call
    pub call_timeout_secs: u64,
    /// Calls in flight per resource kind
    pub max_in_flight: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            call_timeout_secs: 60,
            max_in_flight: 4,
        }
    }
}

impl GatewaySettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Wait bound for a resource to become ready
    pub ready_timeout_secs: u64,
    /// Wait bound for all services to answer after boot
    pub service_startup_timeout_secs: u64,
    pub startup_poll_interval_secs: u64,
    /// Wall-clock bound for a whole provisioning run
    pub deployment_timeout_secs: u64,
    pub network_cidr: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            ready_timeout_secs: 600,
            service_startup_timeout_secs: 900,
            startup_poll_interval_secs: 15,
            deployment_timeout_secs: 3_600,
            network_cidr: "10.0.0.0/16".to_string(),
        }
    }
}

impl PipelineSettings {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn service_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.service_startup_timeout_secs)
    }

    pub fn startup_poll_interval(&self) -> Duration {
        Duration::from_secs(self.startup_poll_interval_secs)
    }

    pub fn deployment_timeout(&self) -> Duration {
        Duration::from_secs(self.deployment_timeout_secs)
    }
}

/// Which triggers prefer a restore from the last healthy snapshot over a
/// clean rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryPolicy {
    pub restore_on: Vec<RollbackTrigger>,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            restore_on: vec![
                RollbackTrigger::Manual,
                RollbackTrigger::HealthCheckFailed,
                RollbackTrigger::Interruption,
            ],
        }
    }
}

impl RecoveryPolicy {
    pub fn never_restore() -> Self {
        Self {
            restore_on: Vec::new(),
        }
    }

    pub fn prefers_restore(&self, trigger: RollbackTrigger) -> bool {
        self.restore_on.contains(&trigger)
    }
}
