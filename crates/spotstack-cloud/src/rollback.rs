//! Rollback and recovery coordinator
//!
//! Unwinds a deployment in reverse dependency order, deleting only resources
//! the engine created. Depending on the trigger and the recovery policy the
//! unwind either restores the compute tier from the last healthy snapshot,
//! cleans the stack down to its durable storage, or destroys it.

use crate::engine::EngineContext;
use crate::error::{CloudError, Result};
use crate::pipeline::ProvisioningPipeline;
use crate::provenance::{DeletionPolicy, TeardownPlan};
use crate::report::{PreserveReason, ResourceRef, RollbackReport};
use crate::state::{
    DeploymentState, DeploymentStatus, RecoveryMode, ResourceKind, RollbackRecord, RollbackTrigger,
};
use crate::store::StateLock;
use chrono::Utc;
use std::time::Instant;

/// Options of a single unwind
#[derive(Debug, Clone, Copy)]
pub struct RollbackOptions {
    /// Keep durable storage; only an explicit destroy may clear this
    pub preserve_storage: bool,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            preserve_storage: true,
        }
    }
}

pub(crate) struct RollbackCoordinator<'a> {
    ctx: &'a EngineContext,
}

impl<'a> RollbackCoordinator<'a> {
    pub(crate) fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Pick the recovery mode for a trigger.
    pub(crate) fn select_mode(&self, state: &DeploymentState, trigger: RollbackTrigger) -> RecoveryMode {
        if trigger == RollbackTrigger::Destroy {
            return RecoveryMode::Destroy;
        }
        let compute_created = state
            .handle(ResourceKind::Compute)
            .is_some_and(|h| h.is_created());
        if state.last_known_healthy.is_some()
            && compute_created
            && self.ctx.settings.recovery.prefers_restore(trigger)
        {
            RecoveryMode::Restore
        } else {
            RecoveryMode::Clean
        }
    }

    /// Unwind `state` and append exactly one rollback record.
    ///
    /// Never fails: errors end up in the returned report and the record.
    pub(crate) async fn execute(
        &self,
        lock: &StateLock,
        state: &mut DeploymentState,
        trigger: RollbackTrigger,
        options: RollbackOptions,
    ) -> RollbackReport {
        let started = Instant::now();
        let mode = self.select_mode(state, trigger);
        let mut report = RollbackReport::new(&state.stack_id, trigger, mode);

        tracing::info!(stack_id = %state.stack_id, %trigger, %mode, "Starting rollback");

        state.set_status(DeploymentStatus::RollingBack);
        if let Err(e) = self.ctx.store.put(lock, state).await {
            tracing::warn!(stack_id = %state.stack_id, "Failed to checkpoint rollback start: {}", e);
        }

        let limit = state.config.rollback_timeout();
        let torn_down =
            match tokio::time::timeout(limit, self.teardown(lock, state, mode, options, &mut report)).await {
                Ok(()) => true,
                Err(_) => {
                    tracing::error!(stack_id = %state.stack_id, "Rollback timed out after {:?}", limit);
                    report.fail("rollback timed out");
                    false
                }
            };

        if mode == RecoveryMode::Restore && torn_down {
            if report.success {
                self.restore_within_budget(lock, state, &mut report).await;
            } else {
                report.fail("compute teardown incomplete, cannot restore");
            }
        }

        self.finish(state, mode, trigger, &mut report);

        state.push_rollback(RollbackRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            trigger,
            mode,
            deleted: report.deleted.iter().map(|r| r.id.clone()).collect(),
            preserved: report.preserved.iter().map(|r| r.id.clone()).collect(),
            success: report.success,
            error: report.error.clone(),
        });
        report.duration_ms = started.elapsed().as_millis() as u64;

        if let Err(e) = self.ctx.store.put(lock, state).await {
            tracing::error!(stack_id = %state.stack_id, "Failed to persist rollback record: {}", e);
            report.fail(format!("state not persisted: {}", e));
        }

        if report.success {
            tracing::info!("{}", report);
        } else {
            tracing::warn!("{}", report);
        }
        report
    }

    /// Restore the compute tier; on any failure nothing it brought up stays.
    async fn restore_within_budget(
        &self,
        lock: &StateLock,
        state: &mut DeploymentState,
        report: &mut RollbackReport,
    ) {
        let budget = self.ctx.settings.restore_budget(restore_stages(state));
        match tokio::time::timeout(budget, self.restore(lock, state, report)).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => {
                tracing::error!(stack_id = %state.stack_id, "Rollback error: {}", e);
                report.fail(e.to_string());
            }
            Err(_) => {
                tracing::error!(stack_id = %state.stack_id, "Restore timed out after {:?}", budget);
                report.fail("restore failed: timed out");
            }
        }
        self.discard_restore(lock, state, report).await;
    }

    async fn teardown(
        &self,
        lock: &StateLock,
        state: &mut DeploymentState,
        mode: RecoveryMode,
        options: RollbackOptions,
        report: &mut RollbackReport,
    ) {
        let policy = match mode {
            RecoveryMode::Restore => DeletionPolicy::compute_tier(),
            RecoveryMode::Clean => DeletionPolicy::stack(true),
            RecoveryMode::Destroy => DeletionPolicy::stack(options.preserve_storage),
        };
        let plan = TeardownPlan::build(&state.resources, policy);

        for kept in plan.keep {
            tracing::debug!(
                stack_id = %state.stack_id,
                kind = %kept.kind,
                resource_id = %kept.id,
                "Preserving resource ({})",
                kept.reason
            );
            report.add_preserved(kept.kind, kept.id, kept.reason);
        }

        for handle in plan.delete {
            self.delete_handle(lock, state, handle.kind, &handle.id, report).await;
        }
    }

    /// Delete one resource, recording the outcome; failures are preserved.
    async fn delete_handle(
        &self,
        lock: &StateLock,
        state: &mut DeploymentState,
        kind: ResourceKind,
        id: &str,
        report: &mut RollbackReport,
    ) {
        match self.ctx.gateway.delete(kind, id).await {
            Ok(()) => {
                report.add_deleted(kind, id);
                state.remove_handle(id);
                clear_addressing(state, kind);
                if let Err(e) = self.ctx.store.put(lock, state).await {
                    tracing::warn!(stack_id = %state.stack_id, "Failed to checkpoint deletion: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!(
                    stack_id = %state.stack_id,
                    %kind,
                    resource_id = id,
                    "Deletion failed, continuing: {}",
                    e
                );
                report.add_preserved(kind, id, PreserveReason::ProviderError(e.to_string()));
            }
        }
    }

    /// Tear down whatever a failed restore brought up, leaving the stack at
    /// its durable tier.
    ///
    /// Creates cut off by a timeout may have landed without a handle, so the
    /// stack's tagged compute-tier resources are looked up as well.
    async fn discard_restore(&self, lock: &StateLock, state: &mut DeploymentState, report: &mut RollbackReport) {
        let limit = state.config.rollback_timeout();
        let cleanup = async {
            let plan = TeardownPlan::build(&state.resources, DeletionPolicy::compute_tier());
            for handle in plan.delete {
                self.delete_handle(lock, state, handle.kind, &handle.id, report).await;
            }

            for kind in ResourceKind::ALL.iter().copied().filter(|k| k.is_compute_tier()) {
                if !self.ctx.gateway.has(kind) {
                    continue;
                }
                match self.ctx.gateway.discover(kind, &state.stack_id).await {
                    Ok(Some(found)) if !state.resources.iter().any(|h| h.id == found.id) => {
                        tracing::warn!(
                            stack_id = %state.stack_id,
                            %kind,
                            resource_id = %found.id,
                            "Deleting unrecorded resource left by the restore"
                        );
                        self.delete_handle(lock, state, kind, &found.id, report).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(stack_id = %state.stack_id, %kind, "Lookup after failed restore failed: {}", e);
                    }
                }
            }
        };
        if tokio::time::timeout(limit, cleanup).await.is_err() {
            tracing::error!(stack_id = %state.stack_id, "Cleanup after failed restore timed out");
            report.fail("cleanup after failed restore timed out");
        }
        report.restored.clear();
    }

    async fn restore(
        &self,
        lock: &StateLock,
        state: &mut DeploymentState,
        report: &mut RollbackReport,
    ) -> Result<()> {
        if state.handle(ResourceKind::Compute).is_some() {
            return Err(CloudError::Rollback(
                "compute teardown incomplete, cannot restore".to_string(),
            ));
        }
        let snapshot = state
            .last_known_healthy
            .clone()
            .ok_or_else(|| CloudError::Rollback("no healthy snapshot to restore".to_string()))?;

        tracing::info!(
            stack_id = %state.stack_id,
            captured_at = %snapshot.captured_at,
            "Restoring compute from healthy snapshot"
        );
        state.config = snapshot.config;
        state.services.clear();

        ProvisioningPipeline::new(self.ctx)
            .restore_compute_tier(lock, state)
            .await
            .map_err(|e| CloudError::Rollback(format!("restore failed: {}", e)))?;

        for handle in state.resources.iter().filter(|h| h.kind.is_compute_tier()) {
            report.restored.push(ResourceRef::new(handle.kind, &handle.id));
        }
        Ok(())
    }

    /// Set the final status for the mode and outcome.
    fn finish(
        &self,
        state: &mut DeploymentState,
        mode: RecoveryMode,
        trigger: RollbackTrigger,
        report: &mut RollbackReport,
    ) {
        match mode {
            RecoveryMode::Restore if report.success => {
                let now = Utc::now();
                state.running_since = Some(now);
                if let (Some(cost), Some(since)) = (state.cost.as_mut(), state.running_since) {
                    cost.refresh_runtime(since, now);
                }
                state.set_status(DeploymentStatus::Running);
                if let Err(e) = state.check_invariants() {
                    report.fail(e.to_string());
                    state.set_status(DeploymentStatus::Failed);
                } else {
                    state.last_error = None;
                    state.failed_stage = None;
                }
            }
            RecoveryMode::Restore | RecoveryMode::Clean => {
                if state.last_error.is_none() {
                    state.last_error = Some(format!("rolled back after {}", trigger));
                }
                state.set_status(DeploymentStatus::Failed);
            }
            RecoveryMode::Destroy => {
                state.services.clear();
                state.running_since = None;
                state.set_status(DeploymentStatus::Destroyed);
            }
        }
    }
}

/// Number of pipeline stages a restore re-runs.
fn restore_stages(state: &DeploymentState) -> u32 {
    state
        .config
        .stages()
        .into_iter()
        .skip_while(|s| *s != DeploymentStatus::ComputeReady)
        .count() as u32
}

fn clear_addressing(state: &mut DeploymentState, kind: ResourceKind) {
    match kind {
        ResourceKind::Compute => {
            state.public_ip = None;
            state.private_ip = None;
            if !state.config.enable_load_balancer {
                state.endpoint = None;
            }
        }
        ResourceKind::LoadBalancer | ResourceKind::Cdn => state.endpoint = None,
        _ => {}
    }
}
