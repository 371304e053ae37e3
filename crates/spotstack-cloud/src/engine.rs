//! Deployment engine facade
//!
//! [`DeploymentEngine`] ties the state store, resource gateway, pricing
//! advisor, pipeline, rollback coordinator and health monitors together.
//! Every mutating operation holds the stack's record lock for its whole
//! duration, so operations on one stack are serialized while different
//! stacks proceed independently.

use crate::bootstrap::EnvironmentBootstrap;
use crate::config::DeploymentConfig;
use crate::error::{CloudError, Result};
use crate::gateway::ResourceGateway;
use crate::monitor::{HealthMonitor, InterruptionNotice, MonitorExit};
use crate::pipeline::ProvisioningPipeline;
use crate::pricing::PricingAdvisor;
use crate::probe::NetworkProbe;
use crate::provider::{BootstrapGenerator, HealthProbe, PricingSource, ResourceService};
use crate::report::RollbackReport;
use crate::rollback::{RollbackCoordinator, RollbackOptions};
use crate::settings::EngineSettings;
use crate::state::{
    CostSnapshot, DeploymentState, DeploymentStatus, RecoveryMode, ResourceKind, RollbackTrigger,
};
use crate::store::{StateLock, StateStore};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const INTERRUPTION_BUFFER: usize = 4;

/// Collaborators shared by the pipeline, coordinator and monitors
pub(crate) struct EngineContext {
    pub(crate) store: Arc<StateStore>,
    pub(crate) gateway: ResourceGateway,
    pub(crate) pricing: PricingAdvisor,
    pub(crate) probe: Arc<dyn HealthProbe>,
    pub(crate) bootstrap: Arc<dyn BootstrapGenerator>,
    pub(crate) settings: EngineSettings,
}

struct MonitorHandle {
    generation: u64,
    cancel: CancellationToken,
    notices: mpsc::Sender<InterruptionNotice>,
    task: JoinHandle<()>,
}

struct EngineInner {
    ctx: Arc<EngineContext>,
    monitors: Mutex<HashMap<String, MonitorHandle>>,
    generation: AtomicU64,
}

/// Builder for [`DeploymentEngine`]
pub struct EngineBuilder {
    settings: EngineSettings,
    services: Vec<Arc<dyn ResourceService>>,
    probe: Option<Arc<dyn HealthProbe>>,
    bootstrap: Option<Arc<dyn BootstrapGenerator>>,
    pricing: Option<Arc<dyn PricingSource>>,
}

impl EngineBuilder {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            services: Vec::new(),
            probe: None,
            bootstrap: None,
            pricing: None,
        }
    }

    pub fn resource_service(mut self, service: Arc<dyn ResourceService>) -> Self {
        self.services.push(service);
        self
    }

    pub fn resource_services(mut self, services: impl IntoIterator<Item = Arc<dyn ResourceService>>) -> Self {
        self.services.extend(services);
        self
    }

    /// Defaults to [`NetworkProbe`].
    pub fn health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Defaults to [`EnvironmentBootstrap`].
    pub fn bootstrap(mut self, bootstrap: Arc<dyn BootstrapGenerator>) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    /// Without a source every quote is estimated.
    pub fn pricing_source(mut self, source: Arc<dyn PricingSource>) -> Self {
        self.pricing = Some(source);
        self
    }

    pub fn build(self) -> Result<DeploymentEngine> {
        self.settings.validate()?;

        let mut gateway = ResourceGateway::new(&self.settings.gateway, self.settings.retry.clone());
        for service in self.services {
            gateway.register(service);
        }

        let store = StateStore::new(&self.settings.state_dir)
            .with_lock_timeout(self.settings.lock_timeout())
            .with_stale_lock_after(self.settings.stale_lock_after());
        let ctx = EngineContext {
            store: Arc::new(store),
            gateway,
            pricing: PricingAdvisor::new(self.pricing, self.settings.pricing.clone()),
            probe: self.probe.unwrap_or_else(|| Arc::new(NetworkProbe::new())),
            bootstrap: self.bootstrap.unwrap_or_else(|| Arc::new(EnvironmentBootstrap)),
            settings: self.settings,
        };

        tracing::debug!(state_dir = %ctx.store.root().display(), "Deployment engine ready");
        Ok(DeploymentEngine {
            inner: Arc::new(EngineInner {
                ctx: Arc::new(ctx),
                monitors: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        })
    }
}

/// Entry point for deploying, monitoring and tearing down stacks
#[derive(Clone)]
pub struct DeploymentEngine {
    inner: Arc<EngineInner>,
}

impl DeploymentEngine {
    pub fn builder(settings: EngineSettings) -> EngineBuilder {
        EngineBuilder::new(settings)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.ctx.settings
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.ctx.store
    }

    fn ctx(&self) -> &EngineContext {
        &self.inner.ctx
    }

    async fn lock_stack(&self, stack_id: &str) -> Result<StateLock> {
        self.ctx()
            .store
            .lock_with_timeout(stack_id, self.settings().operation_lock_timeout())
            .await
    }

    /// Provision a stack and start monitoring it.
    pub async fn deploy(&self, config: DeploymentConfig) -> Result<DeploymentState> {
        self.deploy_with_cancel(config, CancellationToken::new()).await
    }

    /// [`deploy`](Self::deploy) that stops, and unwinds, when `cancel` fires.
    pub async fn deploy_with_cancel(
        &self,
        config: DeploymentConfig,
        cancel: CancellationToken,
    ) -> Result<DeploymentState> {
        let config = config.validate()?;
        self.ctx().gateway.require(required_kinds(&config))?;

        let stack_id = config.stack_id.clone();
        let lock = self.lock_stack(&stack_id).await?;

        let mut state = match self.ctx().store.get(&stack_id).await? {
            Some(existing) if existing.status == DeploymentStatus::Running => {
                if existing.config == config {
                    tracing::info!(stack_id = %stack_id, "Stack already running with this configuration");
                    lock.release().await?;
                    self.start_monitor(&stack_id);
                    return Ok(existing);
                }
                return Err(CloudError::Validation(format!(
                    "stack {} is running with a different configuration; destroy or roll it back first",
                    stack_id
                )));
            }
            Some(mut existing) => {
                tracing::info!(
                    stack_id = %stack_id,
                    previous = %existing.status,
                    "Resuming deployment over existing record"
                );
                existing.config = config;
                existing.failed_stage = None;
                existing.last_error = None;
                existing.services.clear();
                existing.set_status(DeploymentStatus::Initializing);
                existing
            }
            None => DeploymentState::new(config),
        };
        self.ctx().store.put(&lock, &state).await?;

        ProvisioningPipeline::new(self.ctx())
            .execute(&lock, &mut state, &cancel)
            .await?;

        lock.release().await?;
        self.start_monitor(&stack_id);
        Ok(state)
    }

    /// Tear down a stack. Unknown stacks yield an empty successful report.
    pub async fn destroy(&self, stack_id: &str, preserve_storage: bool) -> Result<RollbackReport> {
        self.stop_monitor(stack_id).await;
        let lock = self.lock_stack(stack_id).await?;

        let Some(mut state) = self.ctx().store.get(stack_id).await? else {
            tracing::info!(stack_id, "Nothing recorded for stack; nothing to destroy");
            lock.release().await?;
            return Ok(RollbackReport::new(stack_id, RollbackTrigger::Destroy, RecoveryMode::Destroy));
        };

        let report = RollbackCoordinator::new(self.ctx())
            .execute(&lock, &mut state, RollbackTrigger::Destroy, RollbackOptions { preserve_storage })
            .await;

        let nothing_left = state.resources.iter().all(|h| !h.is_created());
        if !preserve_storage && report.success && nothing_left {
            self.ctx().store.delete(lock).await?;
        } else {
            lock.release().await?;
        }
        Ok(report)
    }

    /// Roll a stack back on request.
    pub async fn rollback(&self, stack_id: &str) -> Result<RollbackReport> {
        self.stop_monitor(stack_id).await;
        self.run_rollback(stack_id, RollbackTrigger::Manual, None).await
    }

    async fn run_rollback(
        &self,
        stack_id: &str,
        trigger: RollbackTrigger,
        reason: Option<String>,
    ) -> Result<RollbackReport> {
        let lock = self.lock_stack(stack_id).await?;
        let mut state = self
            .ctx()
            .store
            .get(stack_id)
            .await?
            .ok_or_else(|| CloudError::StackNotFound(stack_id.to_string()))?;

        if reason.is_some() {
            state.last_error = reason;
        }
        let report = RollbackCoordinator::new(self.ctx())
            .execute(&lock, &mut state, trigger, RollbackOptions::default())
            .await;
        lock.release().await?;

        if state.status == DeploymentStatus::Running {
            self.start_monitor(stack_id);
        }
        Ok(report)
    }

    pub async fn status(&self, stack_id: &str) -> Result<DeploymentState> {
        self.ctx()
            .store
            .get(stack_id)
            .await?
            .ok_or_else(|| CloudError::StackNotFound(stack_id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<DeploymentState>> {
        self.ctx().store.list().await
    }

    /// Current cost estimate of a recorded stack.
    pub async fn estimate_cost(&self, stack_id: &str) -> Result<CostSnapshot> {
        let state = self.status(stack_id).await?;
        Ok(self
            .ctx()
            .pricing
            .estimate_cost(&state.config, state.running_since, Utc::now())
            .await)
    }

    /// Mark records left mid-pipeline by a dead process as failed.
    ///
    /// Returns the stack ids that were marked.
    pub async fn reconcile(&self) -> Result<Vec<String>> {
        let mut marked = Vec::new();
        for state in self.ctx().store.list().await? {
            if !(state.status.is_in_progress() || state.status == DeploymentStatus::RollingBack) {
                continue;
            }
            let lock = match self.ctx().store.lock(&state.stack_id).await {
                Ok(lock) => lock,
                Err(e) => {
                    tracing::warn!(stack_id = %state.stack_id, "Skipping reconcile: {}", e);
                    continue;
                }
            };
            // Re-read under the lock; a live operation may have finished meanwhile.
            if let Some(mut current) = self.ctx().store.get(&state.stack_id).await?
                && (current.status.is_in_progress() || current.status == DeploymentStatus::RollingBack)
            {
                tracing::warn!(
                    stack_id = %current.stack_id,
                    status = %current.status,
                    "Marking interrupted deployment as failed"
                );
                if current.status.is_in_progress() {
                    current.failed_stage = Some(current.status);
                }
                current.last_error = Some("interrupted".to_string());
                current.set_status(DeploymentStatus::Failed);
                self.ctx().store.put(&lock, &current).await?;
                marked.push(current.stack_id);
            }
            lock.release().await?;
        }
        Ok(marked)
    }

    fn monitors(&self) -> MutexGuard<'_, HashMap<String, MonitorHandle>> {
        self.inner
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the health monitor of a stack unless one is already running.
    pub fn start_monitor(&self, stack_id: &str) -> bool {
        let mut monitors = self.monitors();
        if let Some(existing) = monitors.get(stack_id)
            && !existing.task.is_finished()
        {
            return false;
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(INTERRUPTION_BUFFER);

        let engine = self.clone();
        let id = stack_id.to_string();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let exit = HealthMonitor::new(engine.inner.ctx.clone())
                .run(&id, token, rx)
                .await;
            engine.on_monitor_exit(&id, generation, exit).await;
        });

        monitors.insert(
            stack_id.to_string(),
            MonitorHandle {
                generation,
                cancel,
                notices: tx,
                task,
            },
        );
        true
    }

    /// Stop the health monitor of a stack and wait for it to finish.
    pub async fn stop_monitor(&self, stack_id: &str) -> bool {
        let Some(handle) = self.monitors().remove(stack_id) else {
            return false;
        };
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            tracing::warn!(stack_id, "Monitor task ended abnormally: {}", e);
        }
        true
    }

    pub fn is_monitoring(&self, stack_id: &str) -> bool {
        self.monitors()
            .get(stack_id)
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Forward an interruption notice to the stack's monitor.
    pub fn signal_interruption(&self, stack_id: &str, notice: InterruptionNotice) -> Result<()> {
        let monitors = self.monitors();
        let handle = monitors.get(stack_id).ok_or_else(|| {
            CloudError::State(format!("no health monitor running for {}", stack_id))
        })?;
        handle
            .notices
            .try_send(notice)
            .map_err(|e| CloudError::State(format!("interruption for {} not delivered: {}", stack_id, e)))
    }

    async fn on_monitor_exit(&self, stack_id: &str, generation: u64, exit: MonitorExit) {
        let owned = {
            let mut monitors = self.monitors();
            let current = monitors.get(stack_id).is_some_and(|h| h.generation == generation);
            if current {
                monitors.remove(stack_id);
            }
            current
        };

        let MonitorExit::Triggered { trigger, reason } = exit else {
            return;
        };
        if !owned {
            // stop_monitor already claimed this stack for another operation
            tracing::info!(stack_id, "Monitor stopped before {} rollback could run", trigger);
            return;
        }
        match self.run_rollback(stack_id, trigger, Some(reason)).await {
            Ok(report) => tracing::info!(stack_id, "Automatic rollback finished: {}", report),
            Err(e) => tracing::error!(stack_id, "Automatic rollback could not run: {}", e),
        }
    }
}

fn required_kinds(config: &DeploymentConfig) -> Vec<ResourceKind> {
    let mut kinds = vec![
        ResourceKind::Network,
        ResourceKind::Storage,
        ResourceKind::Security,
        ResourceKind::Compute,
    ];
    if config.enable_load_balancer {
        kinds.push(ResourceKind::LoadBalancer);
    }
    if config.enable_cdn {
        kinds.push(ResourceKind::Cdn);
    }
    kinds
}
