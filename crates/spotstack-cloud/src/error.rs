//! Engine error types

use crate::report::RollbackReport;
use crate::state::{DeploymentStatus, ResourceKind};
use thiserror::Error;

/// Engine errors
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("{kind} {operation} failed: {source}")]
    Resource {
        kind: ResourceKind,
        operation: &'static str,
        #[source]
        source: ResourceError,
    },

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("State store error: {0}")]
    State(String),

    #[error("Lock acquisition failed: {0}")]
    Lock(String),

    #[error("Rollback failed: {0}")]
    Rollback(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Interruption notice received: {0}")]
    Interrupted(String),

    #[error("Stack not found: {0}")]
    StackNotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Pricing error: {0}")]
    Pricing(#[from] PricingError),

    #[error("Deployment failed at stage {stage}: {source}")]
    DeploymentFailed {
        stage: DeploymentStatus,
        #[source]
        source: Box<CloudError>,
        report: Box<RollbackReport>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CloudError {
    pub fn resource(kind: ResourceKind, operation: &'static str, source: ResourceError) -> Self {
        Self::Resource {
            kind,
            operation,
            source,
        }
    }

    /// Whether retrying the failed call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            CloudError::Resource { source, .. } => source.is_transient(),
            CloudError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Rollback report attached to a failed deployment, if any.
    pub fn rollback_report(&self) -> Option<&RollbackReport> {
        match self {
            CloudError::DeploymentFailed { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// Provider codes that indicate a retryable condition.
const TRANSIENT_CODES: &[&str] = &[
    "RequestLimitExceeded",
    "Throttling",
    "ThrottlingException",
    "TooManyRequests",
    "ServiceUnavailable",
    "Unavailable",
    "InternalError",
    "InternalFailure",
    "RequestTimeout",
    "NetworkError",
    "InsufficientInstanceCapacity",
];

/// Failure reported by an external resource service.
///
/// `code` is the provider-specific error code (e.g. `UnauthorizedOperation`,
/// `RequestLimitExceeded`). Whether the error is retried is decided by
/// [`ResourceError::is_transient`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("[{code}] {message}")]
pub struct ResourceError {
    pub code: String,
    pub message: String,
}

impl ResourceError {
    pub const NOT_FOUND: &'static str = "NotFound";
    pub const TIMEOUT: &'static str = "RequestTimeout";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::new(Self::NOT_FOUND, format!("resource {} does not exist", id.into()))
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(Self::TIMEOUT, message)
    }

    pub fn is_transient(&self) -> bool {
        TRANSIENT_CODES.contains(&self.code.as_str())
    }

    pub fn is_not_found(&self) -> bool {
        self.code == Self::NOT_FOUND || self.code.ends_with(".NotFound")
    }
}

/// Pricing source errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PricingError {
    #[error("pricing source unavailable: {0}")]
    Unavailable(String),

    #[error("no price published for {instance_type} in {region}")]
    NoPrice {
        instance_type: String,
        region: String,
    },
}

pub type Result<T> = std::result::Result<T, CloudError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ResourceError::new("RequestLimitExceeded", "slow down").is_transient());
        assert!(ResourceError::timeout("took too long").is_transient());
        assert!(!ResourceError::new("UnauthorizedOperation", "denied").is_transient());
        assert!(!ResourceError::new("InvalidParameterValue", "bad").is_transient());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(ResourceError::not_found("vol-1").is_not_found());
        assert!(ResourceError::new("InvalidVolume.NotFound", "gone").is_not_found());
        assert!(!ResourceError::new("AuthFailure", "nope").is_not_found());
    }

    #[test]
    fn test_cloud_error_transient_passthrough() {
        let err = CloudError::resource(
            ResourceKind::Compute,
            "create",
            ResourceError::new("Throttling", "rate exceeded"),
        );
        assert!(err.is_transient());
        assert!(!CloudError::Validation("bad".into()).is_transient());
    }
}
