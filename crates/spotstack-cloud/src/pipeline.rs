//! Staged provisioning pipeline
//!
//! ```text
//! validating -> network_ready -> storage_ready -> security_ready
//!   -> compute_ready -> [load_balancer_ready] -> [cdn_ready]
//!   -> service_startup -> health_verified -> running
//! ```
//!
//! Every stage is checkpointed through the state store. Before creating a
//! resource the pipeline reuses the handle already recorded for the stack,
//! then a resource discovered by the stack tag, and only then creates one, so
//! re-running a failed deployment never duplicates resources.

use crate::engine::EngineContext;
use crate::error::{CloudError, Result};
use crate::probe::{probe_round, unhealthy_names};
use crate::provider::{BootstrapContext, CreateRequest, ResourceDescription, ResourceSpec, attr};
use crate::rollback::{RollbackCoordinator, RollbackOptions};
use crate::state::{
    DeploymentState, DeploymentStatus, ResourceHandle, ResourceKind, RollbackTrigger, stack_tags,
};
use crate::store::StateLock;
use chrono::Utc;
use std::collections::HashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Values carried from one stage to the next within a single run
#[derive(Default)]
struct RunContext {
    discovered: HashMap<ResourceKind, ResourceDescription>,
    availability_zone: Option<String>,
}

/// Why a run stopped before reaching `running`
enum Abort {
    Failed(CloudError),
    Cancelled,
    DeadlineExceeded,
}

pub(crate) struct ProvisioningPipeline<'a> {
    ctx: &'a EngineContext,
}

impl<'a> ProvisioningPipeline<'a> {
    pub(crate) fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Drive `state` to `running`.
    ///
    /// On any failure, cancellation or deadline expiry the accumulated
    /// resources are unwound before the error is returned.
    pub(crate) async fn execute(
        &self,
        lock: &StateLock,
        state: &mut DeploymentState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = self.ctx.settings.pipeline.deployment_timeout();
        tracing::info!(
            stack_id = %state.stack_id,
            tier = %state.config.tier,
            "Starting provisioning pipeline"
        );

        let outcome = tokio::select! {
            result = tokio::time::timeout(deadline, self.run_stages(lock, state)) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(Abort::Failed(e)),
                Err(_) => Err(Abort::DeadlineExceeded),
            },
            _ = cancel.cancelled() => Err(Abort::Cancelled),
        };

        let abort = match outcome {
            Ok(()) => return Ok(()),
            Err(abort) => abort,
        };

        let stage = self.failed_stage(state);
        let (error, trigger) = match abort {
            Abort::Failed(e) => (e, RollbackTrigger::DeploymentFailed),
            Abort::Cancelled => (
                CloudError::Cancelled(format!("deployment of {} cancelled", state.stack_id)),
                RollbackTrigger::DeploymentFailed,
            ),
            Abort::DeadlineExceeded => (
                CloudError::Timeout(format!(
                    "deployment of {} exceeded {:?}",
                    state.stack_id, deadline
                )),
                RollbackTrigger::Timeout,
            ),
        };

        tracing::error!(
            stack_id = %state.stack_id,
            %stage,
            "Deployment failed: {}",
            error
        );

        state.failed_stage = Some(stage);
        state.last_error = Some(error.to_string());
        state.set_status(DeploymentStatus::Failed);
        if let Err(e) = self.ctx.store.put(lock, state).await {
            tracing::warn!(stack_id = %state.stack_id, "Failed to checkpoint failure: {}", e);
        }

        let report = RollbackCoordinator::new(self.ctx)
            .execute(lock, state, trigger, RollbackOptions::default())
            .await;

        Err(CloudError::DeploymentFailed {
            stage,
            source: Box::new(error),
            report: Box::new(report),
        })
    }

    /// The stage following the last completed one.
    fn failed_stage(&self, state: &DeploymentState) -> DeploymentStatus {
        let stages = state.config.stages();
        match stages.iter().position(|s| *s == state.status) {
            Some(i) => stages
                .get(i + 1)
                .copied()
                .unwrap_or(DeploymentStatus::Running),
            None => stages
                .first()
                .copied()
                .unwrap_or(DeploymentStatus::Validating),
        }
    }

    async fn run_stages(&self, lock: &StateLock, state: &mut DeploymentState) -> Result<()> {
        let started = Instant::now();
        let mut run = RunContext::default();

        for stage in state.config.stages() {
            tracing::info!(stack_id = %state.stack_id, %stage, "Running stage");
            self.run_stage(stage, lock, state, &mut run).await?;
            state.set_status(stage);
            self.checkpoint(lock, state).await?;
        }

        let now = Utc::now();
        state.cost = Some(
            self.ctx
                .pricing
                .estimate_cost(&state.config, Some(now), now)
                .await,
        );
        state.running_since = Some(now);
        state.failed_stage = None;
        state.last_error = None;
        state.set_status(DeploymentStatus::Running);
        self.checkpoint(lock, state).await?;

        tracing::info!(
            stack_id = %state.stack_id,
            endpoint = state.endpoint.as_deref().unwrap_or("-"),
            "Deployment running after {:?}",
            started.elapsed()
        );
        Ok(())
    }

    /// Re-provision the compute tier after a restore teardown.
    pub(crate) async fn restore_compute_tier(
        &self,
        lock: &StateLock,
        state: &mut DeploymentState,
    ) -> Result<()> {
        let mut run = RunContext::default();
        let stages = state
            .config
            .stages()
            .into_iter()
            .skip_while(|s| *s != DeploymentStatus::ComputeReady);

        for stage in stages {
            tracing::info!(stack_id = %state.stack_id, %stage, "Restoring stage");
            self.run_stage(stage, lock, state, &mut run).await?;
            self.checkpoint(lock, state).await?;
        }
        Ok(())
    }

    async fn run_stage(
        &self,
        stage: DeploymentStatus,
        lock: &StateLock,
        state: &mut DeploymentState,
        run: &mut RunContext,
    ) -> Result<()> {
        match stage {
            DeploymentStatus::Validating => self.validate(state, run).await,
            DeploymentStatus::NetworkReady => {
                let spec = ResourceSpec::Network {
                    region: state.config.region.clone(),
                    cidr_block: self.ctx.settings.pipeline.network_cidr.clone(),
                };
                let desc = self
                    .ensure_resource(lock, state, run, ResourceKind::Network, spec)
                    .await?;
                run.availability_zone = desc.attribute(attr::AVAILABILITY_ZONE).map(str::to_string);
                Ok(())
            }
            DeploymentStatus::StorageReady => {
                let spec = ResourceSpec::Storage {
                    region: state.config.region.clone(),
                    size_gb: state.config.volume_size_gb,
                    availability_zone: run.availability_zone.clone(),
                };
                self.ensure_resource(lock, state, run, ResourceKind::Storage, spec)
                    .await
                    .map(|_| ())
            }
            DeploymentStatus::SecurityReady => {
                let spec = ResourceSpec::Security {
                    network_id: required(state, ResourceKind::Network)?,
                    ingress_ports: state.config.tier.ingress_ports(),
                    allowed_cidr: state.config.allowed_cidr.clone(),
                };
                self.ensure_resource(lock, state, run, ResourceKind::Security, spec)
                    .await
                    .map(|_| ())
            }
            DeploymentStatus::ComputeReady => self.provision_compute(lock, state, run).await,
            DeploymentStatus::LoadBalancerReady => {
                let spec = ResourceSpec::LoadBalancer {
                    network_id: required(state, ResourceKind::Network)?,
                    security_id: required(state, ResourceKind::Security)?,
                    target_id: required(state, ResourceKind::Compute)?,
                    ports: state.config.services().iter().map(|s| s.port).collect(),
                };
                let desc = self
                    .ensure_resource(lock, state, run, ResourceKind::LoadBalancer, spec)
                    .await?;
                state.endpoint = Some(endpoint_of(&desc));
                Ok(())
            }
            DeploymentStatus::CdnReady => {
                let origin = state
                    .endpoint
                    .clone()
                    .ok_or_else(|| CloudError::State("CDN requires a load balancer endpoint".into()))?;
                let desc = self
                    .ensure_resource(lock, state, run, ResourceKind::Cdn, ResourceSpec::Cdn { origin })
                    .await?;
                state.endpoint = Some(endpoint_of(&desc));
                Ok(())
            }
            DeploymentStatus::ServiceStartup => self.await_services(state).await,
            DeploymentStatus::HealthVerified => self.verify_health(state).await,
            other => Err(CloudError::State(format!("{} is not a pipeline stage", other))),
        }
    }

    /// Read-only discovery plus verification of user-supplied ids.
    async fn validate(&self, state: &mut DeploymentState, run: &mut RunContext) -> Result<()> {
        let gateway = &self.ctx.gateway;
        let stack_id = state.stack_id.as_str();

        let (network, storage, security, compute) = futures_util::future::join4(
            gateway.discover(ResourceKind::Network, stack_id),
            gateway.discover(ResourceKind::Storage, stack_id),
            gateway.discover(ResourceKind::Security, stack_id),
            gateway.discover(ResourceKind::Compute, stack_id),
        )
        .await;

        for (kind, found) in [
            (ResourceKind::Network, network?),
            (ResourceKind::Storage, storage?),
            (ResourceKind::Security, security?),
            (ResourceKind::Compute, compute?),
        ] {
            if let Some(desc) = found.filter(|d| d.is_usable()) {
                tracing::debug!(stack_id, %kind, resource_id = %desc.id, "Discovered tagged resource");
                run.discovered.insert(kind, desc);
            }
        }

        let existing = [
            (ResourceKind::Network, state.config.existing_network_id.clone()),
            (ResourceKind::Compute, state.config.existing_instance_id.clone()),
        ];
        for (kind, id) in existing {
            let Some(id) = id else { continue };
            match gateway.describe(kind, &id).await? {
                Some(desc) if desc.is_usable() => {
                    tracing::info!(stack_id = %state.stack_id, %kind, resource_id = %id, "Reusing existing resource");
                    state.upsert_handle(ResourceHandle::reused(kind, id).with_tags(desc.tags.clone()));
                    run.discovered.remove(&kind);
                }
                _ => {
                    return Err(CloudError::Validation(format!(
                        "existing {} {} does not exist or is not usable",
                        kind, id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Reuse or create the resource of `kind` and wait until it is ready.
    async fn ensure_resource(
        &self,
        lock: &StateLock,
        state: &mut DeploymentState,
        run: &mut RunContext,
        kind: ResourceKind,
        spec: ResourceSpec,
    ) -> Result<ResourceDescription> {
        let gateway = &self.ctx.gateway;
        let ready_timeout = self.ctx.settings.pipeline.ready_timeout();

        if let Some(handle) = state.handle(kind).cloned() {
            match gateway.describe(kind, &handle.id).await? {
                Some(desc) if desc.is_usable() => {
                    tracing::debug!(stack_id = %state.stack_id, %kind, resource_id = %handle.id, "Resource already recorded");
                    return gateway.wait_until_ready(kind, &handle.id, ready_timeout).await;
                }
                _ if !handle.is_created() => {
                    return Err(CloudError::Validation(format!(
                        "reused {} {} no longer exists",
                        kind, handle.id
                    )));
                }
                _ => {
                    tracing::warn!(
                        stack_id = %state.stack_id,
                        %kind,
                        resource_id = %handle.id,
                        "Recorded resource is gone; provisioning a replacement"
                    );
                    state.remove_handle(&handle.id);
                }
            }
        }

        let discovered = match run.discovered.remove(&kind) {
            Some(desc) => Some(desc),
            None if kind == ResourceKind::LoadBalancer || kind == ResourceKind::Cdn => gateway
                .discover(kind, &state.stack_id)
                .await?
                .filter(|d| d.is_usable()),
            None => None,
        };

        let id = match discovered {
            Some(desc) => {
                tracing::info!(stack_id = %state.stack_id, %kind, resource_id = %desc.id, "Adopting tagged resource");
                state.upsert_handle(ResourceHandle::created(kind, &desc.id).with_tags(desc.tags));
                desc.id
            }
            None => {
                let tags = stack_tags(&state.stack_id);
                let request = CreateRequest {
                    stack_id: state.stack_id.clone(),
                    tags: tags.clone(),
                    spec,
                };
                let id = gateway.create(&request).await?;
                state.upsert_handle(ResourceHandle::created(kind, &id).with_tags(tags));
                id
            }
        };
        self.checkpoint(lock, state).await?;

        gateway.wait_until_ready(kind, &id, ready_timeout).await
    }

    async fn provision_compute(
        &self,
        lock: &StateLock,
        state: &mut DeploymentState,
        run: &mut RunContext,
    ) -> Result<()> {
        let decision = self.ctx.pricing.decide(&state.config).await;
        if let Some(quote) = &decision.quote {
            tracing::info!(
                stack_id = %state.stack_id,
                instance_type = %state.config.instance_type,
                spot = decision.use_spot,
                "Spot quote {:.4}/h ({:?})",
                quote.price,
                quote.source
            );
        }

        let context = BootstrapContext {
            storage_id: required(state, ResourceKind::Storage)?,
            network_id: required(state, ResourceKind::Network)?,
            security_id: required(state, ResourceKind::Security)?,
            services: state.config.services(),
        };
        let spec = ResourceSpec::Compute {
            instance_type: state.config.instance_type.clone(),
            spot: decision.use_spot,
            max_price: decision.max_price,
            network_id: context.network_id.clone(),
            security_id: context.security_id.clone(),
            storage_id: context.storage_id.clone(),
            bootstrap: self.ctx.bootstrap.generate(&state.config, &context),
        };

        let desc = self
            .ensure_resource(lock, state, run, ResourceKind::Compute, spec)
            .await?;
        state.public_ip = desc.attribute(attr::PUBLIC_IP).map(str::to_string);
        state.private_ip = desc.attribute(attr::PRIVATE_IP).map(str::to_string);
        if state.public_ip.is_none() && state.private_ip.is_none() {
            return Err(CloudError::State(format!(
                "compute {} reported no address",
                desc.id
            )));
        }
        if !state.config.enable_load_balancer {
            state.endpoint = state.public_ip.clone().or_else(|| state.private_ip.clone());
        }
        Ok(())
    }

    /// Poll until every service answers or the startup window closes.
    async fn await_services(&self, state: &mut DeploymentState) -> Result<()> {
        let address = probe_address(state)?;
        let services = state.config.services();
        let settings = &self.ctx.settings.pipeline;
        let started = Instant::now();

        state.services = services
            .iter()
            .map(crate::state::ServiceHealthRecord::starting)
            .collect();

        loop {
            let failed =
                probe_round(self.ctx.probe.as_ref(), &address, &services, &mut state.services).await;
            if failed == 0 {
                tracing::info!(stack_id = %state.stack_id, "All {} services answered", services.len());
                return Ok(());
            }
            if started.elapsed() >= settings.service_startup_timeout() {
                return Err(CloudError::Timeout(format!(
                    "services not healthy after {:?}: {}",
                    settings.service_startup_timeout(),
                    unhealthy_names(&state.services).join(", ")
                )));
            }
            tracing::debug!(
                stack_id = %state.stack_id,
                "Waiting for services: {}",
                unhealthy_names(&state.services).join(", ")
            );
            tokio::time::sleep(settings.startup_poll_interval()).await;
        }
    }

    /// One more full round; every service must pass.
    async fn verify_health(&self, state: &mut DeploymentState) -> Result<()> {
        let address = probe_address(state)?;
        let services = state.config.services();
        let failed =
            probe_round(self.ctx.probe.as_ref(), &address, &services, &mut state.services).await;
        if failed > 0 {
            return Err(CloudError::HealthCheck(format!(
                "verification failed for {}",
                unhealthy_names(&state.services).join(", ")
            )));
        }
        state.capture_healthy_snapshot()
    }

    async fn checkpoint(&self, lock: &StateLock, state: &DeploymentState) -> Result<()> {
        self.ctx.store.put(lock, state).await
    }
}

fn required(state: &DeploymentState, kind: ResourceKind) -> Result<String> {
    state
        .resource_id(kind)
        .map(str::to_string)
        .ok_or_else(|| CloudError::State(format!("stack {} has no {} resource", state.stack_id, kind)))
}

fn probe_address(state: &DeploymentState) -> Result<String> {
    state
        .public_ip
        .clone()
        .or_else(|| state.private_ip.clone())
        .ok_or_else(|| CloudError::State(format!("stack {} has no compute address", state.stack_id)))
}

fn endpoint_of(desc: &ResourceDescription) -> String {
    desc.attribute(attr::DNS_NAME)
        .map(str::to_string)
        .unwrap_or_else(|| desc.id.clone())
}
