//! Continuous health monitoring of running deployments

use crate::engine::EngineContext;
use crate::error::CloudError;
use crate::probe::{probe_round, unhealthy_names};
use crate::state::{DeploymentState, DeploymentStatus, RollbackTrigger};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Notice that the compute node is about to be reclaimed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptionNotice {
    /// e.g. `terminate`, `stop`, `hibernate`
    pub action: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub effective_at: Option<DateTime<Utc>>,
}

impl InterruptionNotice {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            instance_id: None,
            effective_at: None,
        }
    }
}

impl std::fmt::Display for InterruptionNotice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.action)?;
        if let Some(id) = &self.instance_id {
            write!(f, " of {}", id)?;
        }
        if let Some(at) = &self.effective_at {
            write!(f, " at {}", at.to_rfc3339())?;
        }
        Ok(())
    }
}

/// Why a monitor loop ended
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorExit {
    /// A rollback must run; no further polls happen
    Triggered {
        trigger: RollbackTrigger,
        reason: String,
    },
    /// The cancellation token fired
    Cancelled,
    /// The record is gone or no longer running
    Stopped,
}

pub(crate) struct HealthMonitor {
    ctx: Arc<EngineContext>,
}

impl HealthMonitor {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub(crate) async fn run(
        &self,
        stack_id: &str,
        cancel: CancellationToken,
        mut interruptions: mpsc::Receiver<InterruptionNotice>,
    ) -> MonitorExit {
        let period = self.ctx.settings.monitor.poll_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut notices_open = true;

        tracing::info!(stack_id, "Health monitor started (every {:?})", period);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancelled(stack_id),
                notice = interruptions.recv(), if notices_open => match notice {
                    Some(notice) => return interrupted(stack_id, notice),
                    None => {
                        notices_open = false;
                        continue;
                    }
                },
                _ = ticker.tick() => {}
            }

            // A cycle may wait on slow checks or the record lock; notices
            // and cancellation still cut it short.
            let cycle = self.cycle(stack_id);
            tokio::pin!(cycle);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return cancelled(stack_id),
                    notice = interruptions.recv(), if notices_open => match notice {
                        Some(notice) => return interrupted(stack_id, notice),
                        None => notices_open = false,
                    },
                    exit = &mut cycle => match exit {
                        Some(exit) => return exit,
                        None => break,
                    },
                }
            }
        }
    }

    /// One poll; `Some` ends the loop.
    async fn cycle(&self, stack_id: &str) -> Option<MonitorExit> {
        let state = match self.ctx.store.get(stack_id).await {
            Ok(Some(state)) if state.status == DeploymentStatus::Running => state,
            Ok(_) => {
                tracing::info!(stack_id, "Deployment no longer running; stopping monitor");
                return Some(MonitorExit::Stopped);
            }
            Err(e) => {
                tracing::warn!(stack_id, "Failed to load state, skipping cycle: {}", e);
                return None;
            }
        };
        let Some(address) = state.public_ip.clone().or_else(|| state.private_ip.clone()) else {
            tracing::warn!(stack_id, "Running deployment has no address; stopping monitor");
            return Some(MonitorExit::Stopped);
        };

        let services = state.config.services();
        let mut records = state.services.clone();
        let failed =
            probe_round(self.ctx.probe.as_ref(), &address, &services, &mut records).await;

        let threshold = self.ctx.settings.monitor.failure_threshold;
        let breached: Vec<String> = records
            .iter()
            .filter(|r| r.consecutive_failures >= threshold)
            .map(|r| r.name.clone())
            .collect();

        if failed > 0 {
            tracing::warn!(
                stack_id,
                "{} of {} services failing: {}",
                failed,
                services.len(),
                unhealthy_names(&records).join(", ")
            );
        } else {
            tracing::debug!(stack_id, "All services healthy");
        }

        self.persist(stack_id, records).await;

        if breached.is_empty() {
            return None;
        }
        let reason = format!(
            "{} failed {} consecutive checks",
            breached.join(", "),
            threshold
        );
        if state.config.auto_rollback {
            tracing::error!(stack_id, "{}; triggering rollback", reason);
            Some(MonitorExit::Triggered {
                trigger: RollbackTrigger::HealthCheckFailed,
                reason: CloudError::HealthCheck(reason).to_string(),
            })
        } else {
            tracing::error!(stack_id, "{}; auto-rollback disabled", reason);
            None
        }
    }

    /// Write the cycle's records under the record lock.
    async fn persist(&self, stack_id: &str, records: Vec<crate::state::ServiceHealthRecord>) {
        let lock = match self
            .ctx
            .store
            .lock_with_timeout(stack_id, self.ctx.settings.lock_timeout())
            .await
        {
            Ok(lock) => lock,
            Err(e) => {
                tracing::warn!(stack_id, "Skipping health record write: {}", e);
                return;
            }
        };

        let result = async {
            let Some(mut state) = self.ctx.store.get(stack_id).await? else {
                return Ok(());
            };
            if state.status != DeploymentStatus::Running {
                return Ok(());
            }
            apply_cycle(&mut state, records, Utc::now());
            self.ctx.store.put(&lock, &state).await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(stack_id, "Failed to persist health records: {}", e);
        }
        if let Err(e) = lock.release().await {
            tracing::warn!(stack_id, "Failed to release lock: {}", e);
        }
    }
}

fn cancelled(stack_id: &str) -> MonitorExit {
    tracing::info!(stack_id, "Health monitor cancelled");
    MonitorExit::Cancelled
}

fn interrupted(stack_id: &str, notice: InterruptionNotice) -> MonitorExit {
    tracing::warn!(stack_id, "Interruption notice: {}", notice);
    MonitorExit::Triggered {
        trigger: RollbackTrigger::Interruption,
        reason: CloudError::Interrupted(notice.to_string()).to_string(),
    }
}

fn apply_cycle(
    state: &mut DeploymentState,
    records: Vec<crate::state::ServiceHealthRecord>,
    now: DateTime<Utc>,
) {
    state.services = records;
    if let (Some(cost), Some(since)) = (state.cost.as_mut(), state.running_since) {
        cost.refresh_runtime(since, now);
    }
    state.updated_at = now;
}
