pub mod history;
pub mod list;
pub mod settings;
pub mod status;

use chrono::{DateTime, Utc};
use colored::{ColoredString, Colorize};
use spotstack_cloud::{DeploymentState, DeploymentStatus, ServiceStatus, StateStore};

/// Load a record or fail with a readable message.
pub(crate) async fn load_stack(store: &StateStore, stack_id: &str) -> anyhow::Result<DeploymentState> {
    store
        .get(stack_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("stack '{}' not found in {}", stack_id, store.root().display()))
}

pub(crate) fn status_colored(status: DeploymentStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        DeploymentStatus::Running => text.green(),
        DeploymentStatus::Failed => text.red(),
        DeploymentStatus::RollingBack => text.yellow(),
        DeploymentStatus::Destroyed => text.dimmed(),
        _ => text.cyan(),
    }
}

pub(crate) fn service_colored(status: ServiceStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        ServiceStatus::Healthy => text.green(),
        ServiceStatus::Unhealthy => text.red(),
        ServiceStatus::Starting => text.yellow(),
        ServiceStatus::Stopped => text.dimmed(),
    }
}

pub(crate) fn format_time(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
