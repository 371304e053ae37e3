//! Rollback and destroy reports

use crate::state::{RecoveryMode, ResourceKind, RollbackTrigger};
use serde::{Deserialize, Serialize};

/// A resource named in a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

/// Why a resource was left in place
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum PreserveReason {
    /// Pre-existing resource adopted by the deployment
    Reused,
    /// Durable storage kept because destruction was not unconditional
    ProtectedStorage,
    /// Deletion was attempted and failed
    ProviderError(String),
    /// Out of scope for the recovery mode (e.g. network during a restore)
    NotTargeted,
}

impl std::fmt::Display for PreserveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreserveReason::Reused => write!(f, "reused"),
            PreserveReason::ProtectedStorage => write!(f, "protected storage"),
            PreserveReason::ProviderError(e) => write!(f, "provider error: {}", e),
            PreserveReason::NotTargeted => write!(f, "not targeted"),
        }
    }
}

/// A resource that survived the unwind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreservedResource {
    pub kind: ResourceKind,
    pub id: String,
    pub reason: PreserveReason,
}

/// Outcome of a rollback, restore or destroy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub stack_id: String,
    pub trigger: RollbackTrigger,
    pub mode: RecoveryMode,
    pub deleted: Vec<ResourceRef>,
    pub preserved: Vec<PreservedResource>,
    /// Compute re-provisioned by a restore
    #[serde(default)]
    pub restored: Vec<ResourceRef>,
    pub success: bool,
    pub error: Option<String>,
    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

impl RollbackReport {
    pub fn new(stack_id: impl Into<String>, trigger: RollbackTrigger, mode: RecoveryMode) -> Self {
        Self {
            stack_id: stack_id.into(),
            trigger,
            mode,
            deleted: Vec::new(),
            preserved: Vec::new(),
            restored: Vec::new(),
            success: true,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn add_deleted(&mut self, kind: ResourceKind, id: impl Into<String>) {
        self.deleted.push(ResourceRef::new(kind, id));
    }

    pub fn add_preserved(&mut self, kind: ResourceKind, id: impl Into<String>, reason: PreserveReason) {
        if matches!(reason, PreserveReason::ProviderError(_)) {
            self.success = false;
        }
        self.preserved.push(PreservedResource {
            kind,
            id: id.into(),
            reason,
        });
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.success = false;
        let error = error.into();
        self.error = Some(match self.error.take() {
            Some(previous) => format!("{}; {}", previous, error),
            None => error,
        });
    }

    pub fn was_deleted(&self, id: &str) -> bool {
        self.deleted.iter().any(|r| r.id == id)
    }

    pub fn was_preserved(&self, id: &str) -> bool {
        self.preserved.iter().any(|r| r.id == id)
    }

    pub fn left_behind(&self) -> impl Iterator<Item = &PreservedResource> {
        self.preserved
            .iter()
            .filter(|p| p.reason != PreserveReason::NotTargeted)
    }
}

impl std::fmt::Display for RollbackReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) for {}: {} deleted, {} preserved, {}",
            self.mode,
            self.trigger,
            self.stack_id,
            self.deleted.len(),
            self.preserved.len(),
            if self.success { "succeeded" } else { "failed" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_marks_failure() {
        let mut report =
            RollbackReport::new("demo", RollbackTrigger::Manual, RecoveryMode::Clean);
        report.add_preserved(ResourceKind::Storage, "vol-1", PreserveReason::ProtectedStorage);
        assert!(report.success);

        report.add_preserved(
            ResourceKind::Security,
            "sg-1",
            PreserveReason::ProviderError("DependencyViolation".into()),
        );
        assert!(!report.success);
    }

    #[test]
    fn test_fail_accumulates_errors() {
        let mut report =
            RollbackReport::new("demo", RollbackTrigger::Manual, RecoveryMode::Clean);
        report.fail("first");
        report.fail("second");
        assert_eq!(report.error.as_deref(), Some("first; second"));
    }

    #[test]
    fn test_display_summary() {
        let mut report =
            RollbackReport::new("demo", RollbackTrigger::HealthCheckFailed, RecoveryMode::Restore);
        report.add_deleted(ResourceKind::Compute, "i-1");
        assert_eq!(
            report.to_string(),
            "restore (health_check_failed) for demo: 1 deleted, 0 preserved, succeeded"
        );
    }
}
