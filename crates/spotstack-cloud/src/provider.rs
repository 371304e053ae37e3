//! External collaborator traits
//!
//! The engine never talks to a cloud API directly. Each resource kind is
//! served by a [`ResourceService`]; probes, bootstrap payloads and prices come
//! from [`HealthProbe`], [`BootstrapGenerator`] and [`PricingSource`].

use crate::config::{DeploymentConfig, ServiceSpec};
use crate::error::{PricingError, ResourceError};
use crate::state::ResourceKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Attribute keys reported by resource services
pub mod attr {
    pub const PUBLIC_IP: &str = "public_ip";
    pub const PRIVATE_IP: &str = "private_ip";
    pub const DNS_NAME: &str = "dns_name";
    pub const AVAILABILITY_ZONE: &str = "availability_zone";
}

/// Per-kind parameters of a create call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ResourceSpec {
    Network {
        region: String,
        cidr_block: String,
    },
    Storage {
        region: String,
        size_gb: u32,
        availability_zone: Option<String>,
    },
    Security {
        network_id: String,
        ingress_ports: Vec<u16>,
        allowed_cidr: String,
    },
    Compute {
        instance_type: String,
        spot: bool,
        /// Maximum hourly spot bid; `None` for on-demand
        max_price: Option<f64>,
        network_id: String,
        security_id: String,
        storage_id: String,
        /// Opaque payload from the [`BootstrapGenerator`]
        bootstrap: String,
    },
    LoadBalancer {
        network_id: String,
        security_id: String,
        target_id: String,
        ports: Vec<u16>,
    },
    Cdn {
        origin: String,
    },
}

impl ResourceSpec {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Network { .. } => ResourceKind::Network,
            ResourceSpec::Storage { .. } => ResourceKind::Storage,
            ResourceSpec::Security { .. } => ResourceKind::Security,
            ResourceSpec::Compute { .. } => ResourceKind::Compute,
            ResourceSpec::LoadBalancer { .. } => ResourceKind::LoadBalancer,
            ResourceSpec::Cdn { .. } => ResourceKind::Cdn,
        }
    }
}

/// A create call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub stack_id: String,
    pub tags: BTreeMap<String, String>,
    pub spec: ResourceSpec,
}

/// Lifecycle of a remote resource as reported by its service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    Pending,
    Ready,
    Deleting,
    Failed,
}

/// Result of a describe call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescription {
    pub id: String,
    pub kind: ResourceKind,
    pub state: RemoteState,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ResourceDescription {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn is_usable(&self) -> bool {
        matches!(self.state, RemoteState::Pending | RemoteState::Ready)
    }
}

/// Cloud API wrapper for one resource kind
#[async_trait]
pub trait ResourceService: Send + Sync {
    /// The kind served by this implementation
    fn kind(&self) -> ResourceKind;

    /// Find a resource tagged with `stack_id` (read-only)
    async fn discover(&self, stack_id: &str) -> Result<Option<ResourceDescription>, ResourceError>;

    /// Describe a resource by id; `Ok(None)` when it no longer exists
    async fn describe(&self, id: &str) -> Result<Option<ResourceDescription>, ResourceError>;

    /// Create a resource and return its id
    async fn create(&self, request: &CreateRequest) -> Result<String, ResourceError>;

    /// Block until the resource is ready
    async fn wait_until_ready(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<ResourceDescription, ResourceError>;

    /// Delete a resource
    async fn delete(&self, id: &str) -> Result<(), ResourceError>;
}

/// Result of probing one service
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub healthy: bool,
    pub latency: Duration,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            healthy: true,
            latency,
            error: None,
        }
    }

    pub fn unhealthy(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency,
            error: Some(error.into()),
        }
    }
}

/// Checks one service on the compute node
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, address: &str, service: &ServiceSpec) -> ProbeOutcome;
}

/// Values resolved by earlier stages and made available to the bootstrap payload
#[derive(Debug, Clone, Default)]
pub struct BootstrapContext {
    pub storage_id: String,
    pub network_id: String,
    pub security_id: String,
    pub services: Vec<ServiceSpec>,
}

/// Produces the opaque payload handed to compute creation
pub trait BootstrapGenerator: Send + Sync {
    fn generate(&self, config: &DeploymentConfig, context: &BootstrapContext) -> String;
}

/// Source of live unit prices
#[async_trait]
pub trait PricingSource: Send + Sync {
    /// Current spot price in USD per hour
    async fn spot_price(&self, instance_type: &str, region: &str) -> Result<f64, PricingError>;

    /// On-demand price in USD per hour
    async fn on_demand_price(&self, instance_type: &str, region: &str) -> Result<f64, PricingError> {
        Err(PricingError::NoPrice {
            instance_type: instance_type.to_string(),
            region: region.to_string(),
        })
    }
}
