//! Spotstack deployment engine
//!
//! Provisions, monitors and tears down a single-node application stack
//! (network, durable storage, security rules, a spot or on-demand compute
//! node, optionally a load balancer and CDN) for one logical deployment.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                DeploymentEngine                  │
//! │   deploy / destroy / rollback / status / list    │
//! └───────┬──────────────┬──────────────┬───────────┘
//!         │              │              │
//! ┌───────▼──────┐ ┌─────▼──────┐ ┌─────▼─────────┐
//! │ Provisioning │ │  Rollback  │ │ HealthMonitor │
//! │   Pipeline   │ │ Coordinator│ │ (per stack)   │
//! └───┬──────┬───┘ └─────┬──────┘ └─────┬─────────┘
//!     │      │           │              │
//! ┌───▼───┐ ┌▼───────────▼──┐   ┌───────▼───────┐
//! │Pricing│ │ResourceGateway│   │  HealthProbe  │
//! │Advisor│ │ (retry, rate) │   └───────────────┘
//! └───────┘ └──────┬────────┘
//!                  │            ┌───────────────┐
//!          ResourceService x6   │  StateStore   │ <- every stage
//!                               └───────────────┘
//! ```
//!
//! Cloud APIs are reached only through the [`ResourceService`] trait; the
//! engine records whether it created or reused each resource and never
//! deletes anything it did not create.

mod bootstrap;
pub mod config;
mod engine;
pub mod error;
mod gateway;
mod monitor;
mod pipeline;
pub mod pricing;
pub mod probe;
pub mod provenance;
pub mod provider;
pub mod report;
pub mod retry;
mod rollback;
pub mod settings;
pub mod state;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-exports
pub use bootstrap::EnvironmentBootstrap;
pub use config::{DeploymentConfig, ProbeKind, ServiceSpec, TierKind};
pub use engine::{DeploymentEngine, EngineBuilder};
pub use error::{CloudError, PricingError, ResourceError, Result};
pub use gateway::ResourceGateway;
pub use monitor::{InterruptionNotice, MonitorExit};
pub use pricing::{PricingAdvisor, PurchaseDecision, SpotQuote};
pub use probe::NetworkProbe;
pub use provider::{
    BootstrapContext, BootstrapGenerator, CreateRequest, HealthProbe, PricingSource,
    ProbeOutcome, RemoteState, ResourceDescription, ResourceService, ResourceSpec,
};
pub use report::{PreserveReason, PreservedResource, ResourceRef, RollbackReport};
pub use retry::RetryPolicy;
pub use rollback::RollbackOptions;
pub use settings::{
    EngineSettings, GatewaySettings, MonitorSettings, PipelineSettings, PricingSettings,
    RecoveryPolicy,
};
pub use state::{
    CostSnapshot, DeploymentState, DeploymentStatus, HealthySnapshot, PriceSource, Provenance,
    RecoveryMode, ResourceHandle, ResourceKind, RollbackRecord, RollbackTrigger,
    ServiceHealthRecord, ServiceStatus,
};
pub use store::{StateLock, StateStore};
