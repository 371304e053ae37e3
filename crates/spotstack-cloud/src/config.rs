//! Deployment configuration and tier definitions

use crate::error::{CloudError, Result};
use crate::state::DeploymentStatus;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

const MIN_VOLUME_GB: u32 = 8;
const MAX_VOLUME_GB: u32 = 16_384;
const MAX_ROLLBACK_TIMEOUT_SECS: u64 = 3_600;
const MAX_STACK_ID_LEN: usize = 63;

/// Deployment tier
///
/// Tiers share a single pipeline; they only differ in the stages that apply,
/// the default instance size and the set of services monitored on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    Dev,
    Automation,
    Gpu,
}

impl TierKind {
    pub fn default_instance_type(&self) -> &'static str {
        match self {
            TierKind::Dev => "t3.medium",
            TierKind::Automation => "t3.xlarge",
            TierKind::Gpu => "g4dn.xlarge",
        }
    }

    /// Stages the pipeline walks for this tier, in execution order.
    pub fn stages(&self, config: &DeploymentConfig) -> Vec<DeploymentStatus> {
        let mut stages = vec![
            DeploymentStatus::Validating,
            DeploymentStatus::NetworkReady,
            DeploymentStatus::StorageReady,
            DeploymentStatus::SecurityReady,
            DeploymentStatus::ComputeReady,
        ];
        if config.enable_load_balancer {
            stages.push(DeploymentStatus::LoadBalancerReady);
            if config.enable_cdn {
                stages.push(DeploymentStatus::CdnReady);
            }
        }
        stages.push(DeploymentStatus::ServiceStartup);
        stages.push(DeploymentStatus::HealthVerified);
        stages
    }

    /// Services monitored on the compute node.
    pub fn services(&self) -> Vec<ServiceSpec> {
        let mut services = vec![
            ServiceSpec::http("n8n", 5678, "/healthz"),
            ServiceSpec::tcp("postgres", 5432),
        ];
        if matches!(self, TierKind::Automation | TierKind::Gpu) {
            services.push(ServiceSpec::http("qdrant", 6333, "/healthz"));
            services.push(ServiceSpec::http("crawl4ai", 11235, "/health"));
        }
        if matches!(self, TierKind::Gpu) {
            services.push(ServiceSpec::http("ollama", 11434, "/api/tags"));
        }
        services
    }

    /// Ports opened by the security stage.
    pub fn ingress_ports(&self) -> Vec<u16> {
        let mut ports = vec![22];
        ports.extend(self.services().iter().map(|s| s.port));
        ports
    }
}

impl std::fmt::Display for TierKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierKind::Dev => write!(f, "dev"),
            TierKind::Automation => write!(f, "automation"),
            TierKind::Gpu => write!(f, "gpu"),
        }
    }
}

impl std::str::FromStr for TierKind {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dev" => Ok(TierKind::Dev),
            "automation" => Ok(TierKind::Automation),
            "gpu" => Ok(TierKind::Gpu),
            other => Err(CloudError::Validation(format!("unknown tier: {}", other))),
        }
    }
}

/// How a service is probed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ProbeKind {
    /// HTTP GET against a health path; any 2xx is healthy
    Http { path: String },
    /// Plain TCP connect
    Tcp,
}

/// A service running on the compute node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub port: u16,
    pub probe: ProbeKind,
    pub timeout_ms: u64,
}

impl ServiceSpec {
    const DEFAULT_TIMEOUT_MS: u64 = 5_000;

    pub fn http(name: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port,
            probe: ProbeKind::Http { path: path.into() },
            timeout_ms: Self::DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn tcp(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            probe: ProbeKind::Tcp,
            timeout_ms: Self::DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Validated, immutable input of a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub stack_id: String,
    pub tier: TierKind,
    pub region: String,
    pub instance_type: String,
    pub volume_size_gb: u32,
    pub use_spot: bool,
    #[serde(default)]
    pub max_spot_price: Option<f64>,
    #[serde(default)]
    pub existing_network_id: Option<String>,
    #[serde(default)]
    pub existing_instance_id: Option<String>,
    pub allowed_cidr: String,
    #[serde(default)]
    pub enable_load_balancer: bool,
    #[serde(default)]
    pub enable_cdn: bool,
    pub auto_rollback: bool,
    pub rollback_timeout_secs: u64,
}

impl DeploymentConfig {
    pub fn new(stack_id: impl Into<String>, tier: TierKind, region: impl Into<String>) -> Self {
        Self {
            stack_id: stack_id.into(),
            tier,
            region: region.into(),
            instance_type: tier.default_instance_type().to_string(),
            volume_size_gb: 30,
            use_spot: true,
            max_spot_price: None,
            existing_network_id: None,
            existing_instance_id: None,
            allowed_cidr: "0.0.0.0/0".to_string(),
            enable_load_balancer: false,
            enable_cdn: false,
            auto_rollback: true,
            rollback_timeout_secs: 300,
        }
    }

    pub fn with_instance_type(mut self, instance_type: impl Into<String>) -> Self {
        self.instance_type = instance_type.into();
        self
    }

    pub fn with_volume_size(mut self, gb: u32) -> Self {
        self.volume_size_gb = gb;
        self
    }

    pub fn with_spot(mut self, use_spot: bool) -> Self {
        self.use_spot = use_spot;
        self
    }

    pub fn with_max_spot_price(mut self, price: f64) -> Self {
        self.max_spot_price = Some(price);
        self
    }

    pub fn with_existing_network(mut self, id: impl Into<String>) -> Self {
        self.existing_network_id = Some(id.into());
        self
    }

    pub fn with_existing_instance(mut self, id: impl Into<String>) -> Self {
        self.existing_instance_id = Some(id.into());
        self
    }

    pub fn with_allowed_cidr(mut self, cidr: impl Into<String>) -> Self {
        self.allowed_cidr = cidr.into();
        self
    }

    pub fn with_load_balancer(mut self, enabled: bool) -> Self {
        self.enable_load_balancer = enabled;
        self
    }

    pub fn with_cdn(mut self, enabled: bool) -> Self {
        self.enable_cdn = enabled;
        self
    }

    pub fn with_auto_rollback(mut self, enabled: bool) -> Self {
        self.auto_rollback = enabled;
        self
    }

    pub fn with_rollback_timeout(mut self, timeout: Duration) -> Self {
        self.rollback_timeout_secs = timeout.as_secs();
        self
    }

    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_secs(self.rollback_timeout_secs)
    }

    pub fn services(&self) -> Vec<ServiceSpec> {
        self.tier.services()
    }

    pub fn stages(&self) -> Vec<DeploymentStatus> {
        self.tier.stages(self)
    }

    /// Check every input constraint.
    ///
    /// Consumes and returns the config so callers cannot accidentally keep
    /// using an unvalidated copy.
    pub fn validate(self) -> Result<Self> {
        validate_stack_id(&self.stack_id)?;
        validate_region(&self.region)?;
        validate_instance_type(&self.instance_type)?;

        if !(MIN_VOLUME_GB..=MAX_VOLUME_GB).contains(&self.volume_size_gb) {
            return Err(CloudError::Validation(format!(
                "volume size {} GiB is outside {}..={}",
                self.volume_size_gb, MIN_VOLUME_GB, MAX_VOLUME_GB
            )));
        }

        if self.tier == TierKind::Gpu && !is_gpu_family(&self.instance_type) {
            return Err(CloudError::Validation(format!(
                "tier gpu requires a GPU instance family, got {}",
                self.instance_type
            )));
        }

        if self.enable_cdn && !self.enable_load_balancer {
            return Err(CloudError::Validation(
                "CDN requires the load balancer to be enabled".to_string(),
            ));
        }

        if self.rollback_timeout_secs == 0 || self.rollback_timeout_secs > MAX_ROLLBACK_TIMEOUT_SECS
        {
            return Err(CloudError::Validation(format!(
                "rollback timeout must be within 1..={} seconds",
                MAX_ROLLBACK_TIMEOUT_SECS
            )));
        }

        if let Some(price) = self.max_spot_price
            && !(price.is_finite() && price > 0.0)
        {
            return Err(CloudError::Validation(format!(
                "max spot price must be positive, got {}",
                price
            )));
        }

        validate_cidr(&self.allowed_cidr)?;

        for (label, id) in [
            ("network", &self.existing_network_id),
            ("instance", &self.existing_instance_id),
        ] {
            if let Some(id) = id
                && id.trim().is_empty()
            {
                return Err(CloudError::Validation(format!(
                    "existing {} id must not be empty",
                    label
                )));
            }
        }

        Ok(self)
    }
}

fn validate_stack_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_STACK_ID_LEN
        && id.starts_with(|c: char| c.is_ascii_lowercase())
        && !id.ends_with('-')
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');

    if valid {
        Ok(())
    } else {
        Err(CloudError::Validation(format!(
            "stack id '{}' must be 1-{} lowercase letters, digits or '-', starting with a letter",
            id, MAX_STACK_ID_LEN
        )))
    }
}

// e.g. us-east-1, ap-northeast-1
/// `<geo>-<name>[-<name>...]-<number>`, e.g. `us-east-1` or `us-gov-west-1`.
fn validate_region(region: &str) -> Result<()> {
    let parts: Vec<&str> = region.split('-').collect();
    let valid = match parts.split_last() {
        Some((number, names)) if names.len() >= 2 => {
            !number.is_empty()
                && number.chars().all(|c| c.is_ascii_digit())
                && names[0].len() == 2
                && names
                    .iter()
                    .all(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_lowercase()))
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(CloudError::Validation(format!("invalid region: {}", region)))
    }
}

fn validate_instance_type(instance_type: &str) -> Result<()> {
    let valid = matches!(
        instance_type.split_once('.'),
        Some((family, size)) if !family.is_empty()
            && !size.is_empty()
            && family.chars().all(|c| c.is_ascii_alphanumeric())
            && size.chars().all(|c| c.is_ascii_alphanumeric())
    );

    if valid {
        Ok(())
    } else {
        Err(CloudError::Validation(format!(
            "invalid instance type: {}",
            instance_type
        )))
    }
}

fn is_gpu_family(instance_type: &str) -> bool {
    instance_type.starts_with('g') || instance_type.starts_with('p')
}

fn validate_cidr(cidr: &str) -> Result<()> {
    let invalid = || CloudError::Validation(format!("invalid CIDR: {}", cidr));
    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    addr.parse::<Ipv4Addr>().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> DeploymentConfig {
        DeploymentConfig::new("demo-1", TierKind::Dev, "us-east-1")
    }

    #[test]
    fn test_defaults_validate() {
        let config = base().validate().unwrap();
        assert_eq!(config.instance_type, "t3.medium");
        assert!(config.use_spot);
        assert!(config.auto_rollback);
        assert_eq!(config.rollback_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_invalid_stack_ids() {
        let too_long = "a".repeat(64);
        for id in ["", "Demo", "1demo", "demo-", "demo_1", too_long.as_str()] {
            let config = DeploymentConfig::new(id, TierKind::Dev, "us-east-1");
            assert!(
                matches!(config.validate(), Err(CloudError::Validation(_))),
                "{} should be rejected",
                id
            );
        }
    }

    #[test]
    fn test_multi_segment_regions_accepted() {
        for region in ["us-east-1", "us-gov-west-1", "ap-southeast-2", "cn-northwest-1"] {
            let config = DeploymentConfig::new("demo", TierKind::Dev, region);
            assert!(config.validate().is_ok(), "{} should be accepted", region);
        }
    }

    #[test]
    fn test_invalid_region() {
        for region in ["us-east", "useast1", "US-EAST-1", "us-east-x", "us--east-1", "usa-east-1", "us-east-"] {
            let config = DeploymentConfig::new("demo", TierKind::Dev, region);
            assert!(config.validate().is_err(), "{} should be rejected", region);
        }
    }

    #[test]
    fn test_gpu_tier_requires_gpu_family() {
        let config = DeploymentConfig::new("gpu-1", TierKind::Gpu, "us-west-2");
        assert!(config.clone().validate().is_ok());
        assert!(config.with_instance_type("t3.xlarge").validate().is_err());
    }

    #[test]
    fn test_cdn_requires_load_balancer() {
        assert!(base().with_cdn(true).validate().is_err());
        assert!(
            base()
                .with_load_balancer(true)
                .with_cdn(true)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_volume_and_timeouts() {
        assert!(base().with_volume_size(4).validate().is_err());
        assert!(base().with_volume_size(20_000).validate().is_err());
        assert!(
            base()
                .with_rollback_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(base().with_max_spot_price(0.0).validate().is_err());
        assert!(base().with_allowed_cidr("10.0.0.0/33").validate().is_err());
        assert!(base().with_allowed_cidr("10.0.0.0/8").validate().is_ok());
    }

    #[test]
    fn test_stage_lists_per_tier() {
        let plain = base().stages();
        assert_eq!(plain.first(), Some(&DeploymentStatus::Validating));
        assert_eq!(plain.last(), Some(&DeploymentStatus::HealthVerified));
        assert!(!plain.contains(&DeploymentStatus::LoadBalancerReady));

        let fronted = base().with_load_balancer(true).with_cdn(true).stages();
        let lb = fronted
            .iter()
            .position(|s| *s == DeploymentStatus::LoadBalancerReady)
            .unwrap();
        let compute = fronted
            .iter()
            .position(|s| *s == DeploymentStatus::ComputeReady)
            .unwrap();
        let cdn = fronted
            .iter()
            .position(|s| *s == DeploymentStatus::CdnReady)
            .unwrap();
        assert!(compute < lb && lb < cdn);
    }

    #[test]
    fn test_tier_services() {
        assert_eq!(TierKind::Dev.services().len(), 2);
        assert_eq!(TierKind::Automation.services().len(), 4);
        let gpu = TierKind::Gpu.services();
        assert!(gpu.iter().any(|s| s.name == "ollama" && s.port == 11434));
        assert!(TierKind::Dev.ingress_ports().contains(&22));
    }
}
