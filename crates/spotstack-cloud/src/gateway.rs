//! Rate-limited access to resource services
//!
//! Every outbound call goes through [`ResourceGateway`], which bounds the
//! number of in-flight calls per resource kind, applies a per-call timeout and
//! retries transient failures with the configured [`RetryPolicy`].

use crate::error::{CloudError, ResourceError, Result};
use crate::provider::{CreateRequest, ResourceDescription, ResourceService};
use crate::retry::RetryPolicy;
use crate::settings::GatewaySettings;
use crate::state::ResourceKind;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

struct Lane {
    service: Arc<dyn ResourceService>,
    permits: Semaphore,
}

pub struct ResourceGateway {
    lanes: HashMap<ResourceKind, Lane>,
    retry: RetryPolicy,
    call_timeout: Duration,
    max_in_flight: usize,
}

impl ResourceGateway {
    pub fn new(settings: &GatewaySettings, retry: RetryPolicy) -> Self {
        Self {
            lanes: HashMap::new(),
            retry,
            call_timeout: settings.call_timeout(),
            max_in_flight: settings.max_in_flight.max(1),
        }
    }

    /// Register the service for its kind, replacing any previous one.
    pub fn register(&mut self, service: Arc<dyn ResourceService>) {
        let kind = service.kind();
        self.lanes.insert(
            kind,
            Lane {
                service,
                permits: Semaphore::new(self.max_in_flight),
            },
        );
    }

    pub fn has(&self, kind: ResourceKind) -> bool {
        self.lanes.contains_key(&kind)
    }

    /// Fail unless a service is registered for every kind.
    pub fn require(&self, kinds: impl IntoIterator<Item = ResourceKind>) -> Result<()> {
        let missing: Vec<String> = kinds
            .into_iter()
            .filter(|k| !self.has(*k))
            .map(|k| k.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CloudError::Validation(format!(
                "no resource service registered for: {}",
                missing.join(", ")
            )))
        }
    }

    fn lane(&self, kind: ResourceKind) -> Result<&Lane> {
        self.lanes.get(&kind).ok_or_else(|| {
            CloudError::Validation(format!("no resource service registered for {}", kind))
        })
    }

    /// One bounded call through the kind's lane, without retries.
    async fn attempt<T, Fut>(
        &self,
        lane: &Lane,
        label: &str,
        timeout: Duration,
        call: Fut,
    ) -> std::result::Result<T, ResourceError>
    where
        Fut: Future<Output = std::result::Result<T, ResourceError>>,
    {
        let _permit = lane
            .permits
            .acquire()
            .await
            .map_err(|_| ResourceError::new("GatewayClosed", "semaphore closed"))?;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ResourceError::timeout(format!(
                "{} did not answer within {:?}",
                label, timeout
            ))),
        }
    }

    async fn call<T, F, Fut>(
        &self,
        kind: ResourceKind,
        operation: &'static str,
        timeout: Duration,
        f: F,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn ResourceService>) -> Fut,
        Fut: Future<Output = std::result::Result<T, ResourceError>>,
    {
        let lane = self.lane(kind)?;
        let label = format!("{} {}", kind, operation);
        self.retry
            .run(
                &label,
                || self.attempt(lane, &label, timeout, f(lane.service.clone())),
                ResourceError::is_transient,
            )
            .await
            .map_err(|e| CloudError::resource(kind, operation, e))
    }

    pub async fn discover(
        &self,
        kind: ResourceKind,
        stack_id: &str,
    ) -> Result<Option<ResourceDescription>> {
        self.call(kind, "discover", self.call_timeout, |svc| async move {
            svc.discover(stack_id).await
        })
        .await
    }

    pub async fn describe(&self, kind: ResourceKind, id: &str) -> Result<Option<ResourceDescription>> {
        self.call(kind, "describe", self.call_timeout, |svc| async move {
            svc.describe(id).await
        })
        .await
    }

    /// Create a resource.
    ///
    /// A create that failed transiently may still have landed, so before
    /// each retry the stack's tagged resource of that kind is looked up and
    /// adopted instead of issuing a second create.
    pub async fn create(&self, request: &CreateRequest) -> Result<String> {
        let kind = request.spec.kind();
        let lane = self.lane(kind)?;
        let label = format!("{} create", kind);
        let attempts = self.retry.max_attempts.max(1);
        tracing::info!(stack_id = %request.stack_id, %kind, "Creating resource");

        let mut attempt = 0;
        loop {
            let error = match self
                .attempt(lane, &label, self.call_timeout, lane.service.create(request))
                .await
            {
                Ok(id) => return Ok(id),
                Err(e) => e,
            };
            if attempt + 1 >= attempts || !error.is_transient() {
                return Err(CloudError::resource(kind, "create", error));
            }

            let delay = self.retry.delay_for_attempt(attempt);
            tracing::warn!(
                "{} failed (attempt {}/{}): {}; checking for a landed resource in {:?}",
                label,
                attempt + 1,
                attempts,
                error,
                delay
            );
            tokio::time::sleep(delay).await;

            if let Some(found) = self.discover(kind, &request.stack_id).await? {
                tracing::info!(
                    stack_id = %request.stack_id,
                    %kind,
                    resource_id = %found.id,
                    "Adopting resource from an unanswered create"
                );
                return Ok(found.id);
            }
            attempt += 1;
        }
    }

    pub async fn wait_until_ready(
        &self,
        kind: ResourceKind,
        id: &str,
        ready_timeout: Duration,
    ) -> Result<ResourceDescription> {
        // The call itself may legitimately take the whole ready window.
        let bound = ready_timeout + self.call_timeout;
        self.call(kind, "wait_until_ready", bound, |svc| async move {
            svc.wait_until_ready(id, ready_timeout).await
        })
        .await
    }

    /// Delete a resource; a resource that is already gone counts as deleted.
    pub async fn delete(&self, kind: ResourceKind, id: &str) -> Result<()> {
        tracing::info!(%kind, resource_id = id, "Deleting resource");
        match self
            .call(kind, "delete", self.call_timeout, |svc| async move {
                svc.delete(id).await
            })
            .await
        {
            Err(CloudError::Resource { source, .. }) if source.is_not_found() => {
                tracing::debug!(%kind, resource_id = id, "Resource already deleted");
                Ok(())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{RemoteState, ResourceSpec};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Service whose delete fails with scripted errors, tracking concurrency
    struct ScriptedService {
        errors: Mutex<Vec<ResourceError>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedService {
        fn new(errors: Vec<ResourceError>) -> Self {
            Self {
                errors: Mutex::new(errors),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ResourceService for ScriptedService {
        fn kind(&self) -> ResourceKind {
            ResourceKind::Network
        }

        async fn discover(&self, _stack_id: &str) -> std::result::Result<Option<ResourceDescription>, ResourceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(None)
        }

        async fn describe(&self, _id: &str) -> std::result::Result<Option<ResourceDescription>, ResourceError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }

        async fn create(&self, _request: &CreateRequest) -> std::result::Result<String, ResourceError> {
            Ok("vpc-1".to_string())
        }

        async fn wait_until_ready(
            &self,
            id: &str,
            _timeout: Duration,
        ) -> std::result::Result<ResourceDescription, ResourceError> {
            Ok(ResourceDescription {
                id: id.to_string(),
                kind: ResourceKind::Network,
                state: RemoteState::Ready,
                attributes: Default::default(),
                tags: Default::default(),
            })
        }

        async fn delete(&self, _id: &str) -> std::result::Result<(), ResourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.errors.lock().unwrap().pop() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    /// Compute service that records every create remotely; the first
    /// `silent` creates never answer.
    struct SilentCreateService {
        silent: usize,
        creates: AtomicUsize,
        landed: Mutex<Vec<String>>,
    }

    impl SilentCreateService {
        fn new(silent: usize) -> Self {
            Self {
                silent,
                creates: AtomicUsize::new(0),
                landed: Mutex::new(Vec::new()),
            }
        }
    }

    fn ready(id: &str) -> ResourceDescription {
        ResourceDescription {
            id: id.to_string(),
            kind: ResourceKind::Compute,
            state: RemoteState::Ready,
            attributes: Default::default(),
            tags: Default::default(),
        }
    }

    #[async_trait]
    impl ResourceService for SilentCreateService {
        fn kind(&self) -> ResourceKind {
            ResourceKind::Compute
        }

        async fn discover(&self, _stack_id: &str) -> std::result::Result<Option<ResourceDescription>, ResourceError> {
            Ok(self.landed.lock().unwrap().first().map(|id| ready(id)))
        }

        async fn describe(&self, id: &str) -> std::result::Result<Option<ResourceDescription>, ResourceError> {
            Ok(Some(ready(id)))
        }

        async fn create(&self, _request: &CreateRequest) -> std::result::Result<String, ResourceError> {
            let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
            let id = format!("i-{}", n);
            self.landed.lock().unwrap().push(id.clone());
            if n <= self.silent {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(id)
        }

        async fn wait_until_ready(
            &self,
            id: &str,
            _timeout: Duration,
        ) -> std::result::Result<ResourceDescription, ResourceError> {
            Ok(ready(id))
        }

        async fn delete(&self, _id: &str) -> std::result::Result<(), ResourceError> {
            Ok(())
        }
    }

    fn compute_request() -> CreateRequest {
        CreateRequest {
            stack_id: "demo".into(),
            tags: Default::default(),
            spec: ResourceSpec::Compute {
                instance_type: "t3.medium".into(),
                spot: true,
                max_price: None,
                network_id: "vpc-1".into(),
                security_id: "sg-1".into(),
                storage_id: "vol-1".into(),
                bootstrap: String::new(),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_create_is_adopted_not_repeated() {
        let service = Arc::new(SilentCreateService::new(1));
        let settings = GatewaySettings {
            call_timeout_secs: 5,
            max_in_flight: 4,
        };
        let mut gateway = ResourceGateway::new(&settings, RetryPolicy::default());
        gateway.register(service.clone());

        let id = gateway.create(&compute_request()).await.unwrap();
        assert_eq!(id, "i-1");
        assert_eq!(service.creates.load(Ordering::SeqCst), 1);
        assert_eq!(service.landed.lock().unwrap().len(), 1);
    }

    fn gateway(service: Arc<ScriptedService>, max_in_flight: usize) -> ResourceGateway {
        let settings = GatewaySettings {
            call_timeout_secs: 5,
            max_in_flight,
        };
        let mut gateway = ResourceGateway::new(&settings, RetryPolicy::default());
        gateway.register(service);
        gateway
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_delete_retried() {
        let service = Arc::new(ScriptedService::new(vec![
            ResourceError::new("RequestLimitExceeded", "slow down"),
            ResourceError::new("ServiceUnavailable", "try later"),
        ]));
        let gateway = gateway(service.clone(), 4);

        gateway.delete(ResourceKind::Network, "vpc-1").await.unwrap();
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_delete_not_retried() {
        let service = Arc::new(ScriptedService::new(vec![ResourceError::new(
            "UnauthorizedOperation",
            "denied",
        )]));
        let gateway = gateway(service.clone(), 4);

        let err = gateway.delete(ResourceKind::Network, "vpc-1").await.unwrap_err();
        assert!(matches!(err, CloudError::Resource { .. }));
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_delete_is_success() {
        let service = Arc::new(ScriptedService::new(vec![ResourceError::not_found("vpc-1")]));
        let gateway = gateway(service, 4);
        gateway.delete(ResourceKind::Network, "vpc-1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_is_transient_and_bounded() {
        let service = Arc::new(ScriptedService::new(Vec::new()));
        let gateway = gateway(service, 4);

        let err = gateway.describe(ResourceKind::Network, "vpc-1").await.unwrap_err();
        match err {
            CloudError::Resource { source, .. } => assert_eq!(source.code, ResourceError::TIMEOUT),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_bounded_per_kind() {
        let service = Arc::new(ScriptedService::new(Vec::new()));
        let gateway = Arc::new(gateway(service.clone(), 2));

        let calls = (0..6).map(|_| {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.discover(ResourceKind::Network, "demo").await })
        });
        for call in futures_util::future::join_all(calls).await {
            call.unwrap().unwrap();
        }
        assert_eq!(service.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_service() {
        let gateway = ResourceGateway::new(&GatewaySettings::default(), RetryPolicy::none());
        assert!(matches!(
            gateway.require([ResourceKind::Cdn]),
            Err(CloudError::Validation(_))
        ));
        let request = CreateRequest {
            stack_id: "demo".into(),
            tags: Default::default(),
            spec: ResourceSpec::Cdn {
                origin: "x".into(),
            },
        };
        assert!(gateway.create(&request).await.is_err());
    }
}
