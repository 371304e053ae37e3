//! Resource provenance
//!
//! Decides which handles of a deployment may be deleted and in which order.
//! Only `created` handles are ever deletable; durable storage additionally
//! requires unconditional destruction.

use crate::report::{PreserveReason, PreservedResource};
use crate::state::{ResourceHandle, ResourceKind};

/// Which part of the stack a teardown targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownScope {
    /// Compute and what fronts it (load balancer, CDN)
    ComputeTier,
    /// Everything the deployment owns
    Stack,
}

/// Gate for destructive cleanup
#[derive(Debug, Clone, Copy)]
pub struct DeletionPolicy {
    pub scope: TeardownScope,
    pub preserve_storage: bool,
}

impl DeletionPolicy {
    pub fn compute_tier() -> Self {
        Self {
            scope: TeardownScope::ComputeTier,
            preserve_storage: true,
        }
    }

    pub fn stack(preserve_storage: bool) -> Self {
        Self {
            scope: TeardownScope::Stack,
            preserve_storage,
        }
    }

    /// `Ok` when the handle may be deleted, otherwise the reason it is kept.
    pub fn check(&self, handle: &ResourceHandle) -> Result<(), PreserveReason> {
        if !handle.is_created() {
            return Err(PreserveReason::Reused);
        }
        if self.scope == TeardownScope::ComputeTier && !handle.kind.is_compute_tier() {
            return Err(PreserveReason::NotTargeted);
        }
        if handle.kind == ResourceKind::Storage && self.preserve_storage {
            return Err(PreserveReason::ProtectedStorage);
        }
        Ok(())
    }
}

/// Ordered deletion plan
#[derive(Debug, Clone, Default)]
pub struct TeardownPlan {
    /// Handles to delete, dependents first
    pub delete: Vec<ResourceHandle>,
    /// Handles left in place
    pub keep: Vec<PreservedResource>,
}

impl TeardownPlan {
    pub fn build(resources: &[ResourceHandle], policy: DeletionPolicy) -> Self {
        let mut plan = TeardownPlan::default();
        for handle in resources {
            match policy.check(handle) {
                Ok(()) => plan.delete.push(handle.clone()),
                Err(reason) => plan.keep.push(PreservedResource {
                    kind: handle.kind,
                    id: handle.id.clone(),
                    reason,
                }),
            }
        }
        // Stable sort keeps creation order within a kind; reversing the rank
        // tears down CDN -> LB -> compute -> security -> storage -> network.
        plan.delete
            .sort_by_key(|h| std::cmp::Reverse(h.kind.dependency_rank()));
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.delete.is_empty()
    }
}
