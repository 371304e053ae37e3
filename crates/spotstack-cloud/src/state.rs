//! Deployment state records
//!
//! [`DeploymentState`] is the unit of durability: one record per stack id,
//! written through the [`StateStore`](crate::store::StateStore) after every
//! pipeline stage, monitor cycle and rollback.

use crate::config::{DeploymentConfig, ServiceSpec};
use crate::error::{CloudError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Tag key carrying the stack id on every engine-created resource
pub const STACK_TAG: &str = "spotstack:stack";
/// Tag key marking the creator of a resource
pub const MANAGED_BY_TAG: &str = "spotstack:managed-by";
pub const MANAGED_BY_VALUE: &str = "spotstack";

/// Lifecycle status of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Initializing,
    Validating,
    NetworkReady,
    StorageReady,
    SecurityReady,
    ComputeReady,
    LoadBalancerReady,
    CdnReady,
    ServiceStartup,
    HealthVerified,
    Running,
    RollingBack,
    Failed,
    Destroyed,
}

impl DeploymentStatus {
    /// True while the provisioning pipeline owns the record.
    pub fn is_in_progress(&self) -> bool {
        !matches!(
            self,
            DeploymentStatus::Running
                | DeploymentStatus::RollingBack
                | DeploymentStatus::Failed
                | DeploymentStatus::Destroyed
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Initializing => "initializing",
            DeploymentStatus::Validating => "validating",
            DeploymentStatus::NetworkReady => "network_ready",
            DeploymentStatus::StorageReady => "storage_ready",
            DeploymentStatus::SecurityReady => "security_ready",
            DeploymentStatus::ComputeReady => "compute_ready",
            DeploymentStatus::LoadBalancerReady => "load_balancer_ready",
            DeploymentStatus::CdnReady => "cdn_ready",
            DeploymentStatus::ServiceStartup => "service_startup",
            DeploymentStatus::HealthVerified => "health_verified",
            DeploymentStatus::Running => "running",
            DeploymentStatus::RollingBack => "rolling_back",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Destroyed => "destroyed",
        };
        write!(f, "{}", s)
    }
}

/// Kind of cloud resource managed by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Network,
    Storage,
    Security,
    Compute,
    LoadBalancer,
    Cdn,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Network,
        ResourceKind::Storage,
        ResourceKind::Security,
        ResourceKind::Compute,
        ResourceKind::LoadBalancer,
        ResourceKind::Cdn,
    ];

    /// Position in the dependency chain; teardown runs from the highest rank down.
    pub fn dependency_rank(&self) -> u8 {
        match self {
            ResourceKind::Network => 0,
            ResourceKind::Storage => 1,
            ResourceKind::Security => 2,
            ResourceKind::Compute => 3,
            ResourceKind::LoadBalancer => 4,
            ResourceKind::Cdn => 5,
        }
    }

    /// Resources that only exist to serve the compute node.
    pub fn is_compute_tier(&self) -> bool {
        matches!(
            self,
            ResourceKind::Compute | ResourceKind::LoadBalancer | ResourceKind::Cdn
        )
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Network => write!(f, "network"),
            ResourceKind::Storage => write!(f, "storage"),
            ResourceKind::Security => write!(f, "security"),
            ResourceKind::Compute => write!(f, "compute"),
            ResourceKind::LoadBalancer => write!(f, "load_balancer"),
            ResourceKind::Cdn => write!(f, "cdn"),
        }
    }
}

/// Whether the engine created a resource or adopted an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Created,
    Reused,
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provenance::Created => write!(f, "created"),
            Provenance::Reused => write!(f, "reused"),
        }
    }
}

/// A resource owned by one deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    pub id: String,
    pub provenance: Provenance,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl ResourceHandle {
    pub fn new(kind: ResourceKind, id: impl Into<String>, provenance: Provenance) -> Self {
        Self {
            kind,
            id: id.into(),
            provenance,
            tags: BTreeMap::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn created(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self::new(kind, id, Provenance::Created)
    }

    pub fn reused(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self::new(kind, id, Provenance::Reused)
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn is_created(&self) -> bool {
        self.provenance == Provenance::Created
    }
}

/// What caused a rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTrigger {
    Manual,
    HealthCheckFailed,
    Timeout,
    Interruption,
    DeploymentFailed,
    Destroy,
}

impl std::fmt::Display for RollbackTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackTrigger::Manual => write!(f, "manual"),
            RollbackTrigger::HealthCheckFailed => write!(f, "health_check_failed"),
            RollbackTrigger::Timeout => write!(f, "timeout"),
            RollbackTrigger::Interruption => write!(f, "interruption"),
            RollbackTrigger::DeploymentFailed => write!(f, "deployment_failed"),
            RollbackTrigger::Destroy => write!(f, "destroy"),
        }
    }
}

/// How the coordinator unwound the deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// Compute torn down and re-provisioned from the last healthy snapshot
    Restore,
    /// Created resources torn down, storage kept for a future deploy
    Clean,
    /// Explicit destruction requested by the user
    Destroy,
}

impl std::fmt::Display for RecoveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryMode::Restore => write!(f, "restore"),
            RecoveryMode::Clean => write!(f, "clean"),
            RecoveryMode::Destroy => write!(f, "destroy"),
        }
    }
}

/// One entry of the append-only rollback log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub trigger: RollbackTrigger,
    pub mode: RecoveryMode,
    pub deleted: Vec<String>,
    #[serde(default)]
    pub preserved: Vec<String>,
    pub success: bool,
    pub error: Option<String>,
}

/// Health of a monitored service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Starting,
    Healthy,
    Unhealthy,
    Stopped,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Starting => write!(f, "starting"),
            ServiceStatus::Healthy => write!(f, "healthy"),
            ServiceStatus::Unhealthy => write!(f, "unhealthy"),
            ServiceStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Latest probe result for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealthRecord {
    pub name: String,
    pub port: u16,
    pub status: ServiceStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl ServiceHealthRecord {
    pub fn starting(spec: &ServiceSpec) -> Self {
        Self {
            name: spec.name.clone(),
            port: spec.port,
            status: ServiceStatus::Starting,
            last_check: None,
            latency_ms: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    pub fn record_success(&mut self, latency_ms: u64, at: DateTime<Utc>) {
        self.status = ServiceStatus::Healthy;
        self.consecutive_failures = 0;
        self.latency_ms = Some(latency_ms);
        self.last_check = Some(at);
        self.last_error = None;
    }

    pub fn record_failure(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.status = ServiceStatus::Unhealthy;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.latency_ms = None;
        self.last_check = Some(at);
        self.last_error = Some(error.into());
    }
}

/// Where a price came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Live,
    Cached,
    /// Derived from the on-demand price and the configured discount
    Estimated,
    /// Fixed last-resort value
    Default,
}

impl PriceSource {
    pub fn is_degraded(&self) -> bool {
        matches!(self, PriceSource::Estimated | PriceSource::Default)
    }
}

impl std::fmt::Display for PriceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PriceSource::Live => write!(f, "live"),
            PriceSource::Cached => write!(f, "cached"),
            PriceSource::Estimated => write!(f, "estimated"),
            PriceSource::Default => write!(f, "default"),
        }
    }
}

/// Estimated running cost of a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub instance_type: String,
    pub use_spot: bool,
    pub spot_price: f64,
    pub on_demand_price: f64,
    pub storage_price_gb_month: f64,
    pub volume_size_gb: u32,
    pub price_source: PriceSource,
    pub hourly: f64,
    pub monthly: f64,
    pub runtime_hours: f64,
    pub accrued: f64,
    pub computed_at: DateTime<Utc>,
}

impl CostSnapshot {
    pub const HOURS_PER_MONTH: f64 = 730.0;

    /// Recompute runtime and accrued cost without re-quoting prices.
    pub fn refresh_runtime(&mut self, running_since: DateTime<Utc>, now: DateTime<Utc>) {
        let seconds = now.signed_duration_since(running_since).num_seconds().max(0);
        self.runtime_hours = seconds as f64 / 3600.0;
        self.accrued = self.runtime_hours * self.hourly;
        self.computed_at = now;
    }
}

/// Last configuration known to serve traffic, used by restore-style rollback.
///
/// Deliberately flat: it never embeds a [`DeploymentState`], so repeated
/// rollbacks cannot nest snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthySnapshot {
    pub captured_at: DateTime<Utc>,
    pub config: DeploymentConfig,
    pub instance_type: String,
    pub use_spot: bool,
    pub compute_id: String,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub resources: Vec<ResourceHandle>,
}

/// Persisted record of one deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub stack_id: String,
    pub config: DeploymentConfig,
    pub status: DeploymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub resources: Vec<ResourceHandle>,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceHealthRecord>,
    #[serde(default)]
    pub cost: Option<CostSnapshot>,
    #[serde(default)]
    pub rollback_history: Vec<RollbackRecord>,
    #[serde(default)]
    pub last_known_healthy: Option<HealthySnapshot>,
    #[serde(default)]
    pub failed_stage: Option<DeploymentStatus>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub running_since: Option<DateTime<Utc>>,
}

impl DeploymentState {
    pub fn new(config: DeploymentConfig) -> Self {
        let now = Utc::now();
        Self {
            stack_id: config.stack_id.clone(),
            config,
            status: DeploymentStatus::Initializing,
            created_at: now,
            updated_at: now,
            resources: Vec::new(),
            public_ip: None,
            private_ip: None,
            endpoint: None,
            services: Vec::new(),
            cost: None,
            rollback_history: Vec::new(),
            last_known_healthy: None,
            failed_stage: None,
            last_error: None,
            running_since: None,
        }
    }

    pub fn set_status(&mut self, status: DeploymentStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn handle(&self, kind: ResourceKind) -> Option<&ResourceHandle> {
        self.resources.iter().find(|h| h.kind == kind)
    }

    pub fn resource_id(&self, kind: ResourceKind) -> Option<&str> {
        self.handle(kind).map(|h| h.id.as_str())
    }

    /// Record a handle, replacing any previous handle of the same kind.
    pub fn upsert_handle(&mut self, handle: ResourceHandle) {
        self.resources.retain(|h| h.kind != handle.kind);
        self.resources.push(handle);
        self.updated_at = Utc::now();
    }

    pub fn remove_handle(&mut self, id: &str) -> Option<ResourceHandle> {
        let index = self.resources.iter().position(|h| h.id == id)?;
        self.updated_at = Utc::now();
        Some(self.resources.remove(index))
    }

    pub fn push_rollback(&mut self, record: RollbackRecord) {
        self.rollback_history.push(record);
        self.updated_at = Utc::now();
    }

    /// Capture the current addressing and handles as the last healthy snapshot.
    pub fn capture_healthy_snapshot(&mut self) -> Result<()> {
        let compute_id = self
            .resource_id(ResourceKind::Compute)
            .ok_or_else(|| CloudError::State("cannot snapshot without compute".to_string()))?
            .to_string();
        self.last_known_healthy = Some(HealthySnapshot {
            captured_at: Utc::now(),
            config: self.config.clone(),
            instance_type: self.config.instance_type.clone(),
            use_spot: self.config.use_spot,
            compute_id,
            public_ip: self.public_ip.clone(),
            private_ip: self.private_ip.clone(),
            resources: self.resources.clone(),
        });
        Ok(())
    }

    /// Verify the record is internally consistent.
    pub fn check_invariants(&self) -> Result<()> {
        if self.stack_id != self.config.stack_id {
            return Err(CloudError::State(format!(
                "record {} embeds config for {}",
                self.stack_id, self.config.stack_id
            )));
        }

        if self.status == DeploymentStatus::Running {
            for kind in [ResourceKind::Compute, ResourceKind::Storage] {
                if self.resource_id(kind).is_none_or(|id| id.is_empty()) {
                    return Err(CloudError::State(format!(
                        "stack {} is running without a {} resource",
                        self.stack_id, kind
                    )));
                }
            }
        }

        let mut ids = HashSet::new();
        let mut kinds = HashSet::new();
        for handle in &self.resources {
            if handle.id.is_empty() {
                return Err(CloudError::State(format!(
                    "stack {} has a {} handle with an empty id",
                    self.stack_id, handle.kind
                )));
            }
            if !ids.insert(handle.id.as_str()) {
                return Err(CloudError::State(format!(
                    "stack {} records resource {} twice",
                    self.stack_id, handle.id
                )));
            }
            if !kinds.insert(handle.kind) {
                return Err(CloudError::State(format!(
                    "stack {} records more than one {} resource",
                    self.stack_id, handle.kind
                )));
            }
        }

        Ok(())
    }
}

/// Tags written on every resource the engine creates for `stack_id`.
pub fn stack_tags(stack_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (STACK_TAG.to_string(), stack_id.to_string()),
        (MANAGED_BY_TAG.to_string(), MANAGED_BY_VALUE.to_string()),
    ])
}
