//! Default bootstrap payload
//!
//! Hosts normally supply their own [`BootstrapGenerator`]. This one only
//! exports the values resolved by earlier stages so a node image can pick
//! them up from `/etc/spotstack.env`.

use crate::config::DeploymentConfig;
use crate::provider::{BootstrapContext, BootstrapGenerator};
use std::fmt::Write;

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvironmentBootstrap;

impl BootstrapGenerator for EnvironmentBootstrap {
    fn generate(&self, config: &DeploymentConfig, context: &BootstrapContext) -> String {
        let services = context
            .services
            .iter()
            .map(|s| format!("{}:{}", s.name, s.port))
            .collect::<Vec<_>>()
            .join(",");

        let tier = config.tier.to_string();

        let mut script = String::from("#!/bin/bash\nset -e\ncat > /etc/spotstack.env <<'EOF'\n");
        for (key, value) in [
            ("SPOTSTACK_STACK", config.stack_id.as_str()),
            ("SPOTSTACK_TIER", tier.as_str()),
            ("SPOTSTACK_REGION", config.region.as_str()),
            ("SPOTSTACK_NETWORK_ID", context.network_id.as_str()),
            ("SPOTSTACK_SECURITY_ID", context.security_id.as_str()),
            ("SPOTSTACK_STORAGE_ID", context.storage_id.as_str()),
            ("SPOTSTACK_SERVICES", services.as_str()),
        ] {
            let _ = writeln!(script, "{}={}", key, value);
        }
        script.push_str("EOF\n");
        script
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierKind;

    #[test]
    fn test_exports_resolved_ids() {
        let config = DeploymentConfig::new("demo-1", TierKind::Dev, "us-east-1");
        let context = BootstrapContext {
            storage_id: "vol-1".into(),
            network_id: "vpc-1".into(),
            security_id: "sg-1".into(),
            services: config.services(),
        };
        let script = EnvironmentBootstrap.generate(&config, &context);
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("SPOTSTACK_STORAGE_ID=vol-1\n"));
        assert!(script.contains("SPOTSTACK_SERVICES=n8n:5678,postgres:5432\n"));
    }
}
