//! In-memory cloud for tests
//!
//! [`FakeCloud`] serves every [`ResourceKind`] from one shared inventory,
//! with per-kind failure injection and call counters. [`FakeProbe`] and
//! [`FakePricing`] stand in for the health probe and the pricing source.

use crate::config::ServiceSpec;
use crate::error::{PricingError, ResourceError};
use crate::provider::{
    CreateRequest, HealthProbe, PricingSource, ProbeOutcome, RemoteState, ResourceDescription,
    ResourceService, ResourceSpec, attr,
};
use crate::state::{ResourceKind, STACK_TAG};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct FakeResource {
    kind: ResourceKind,
    tags: BTreeMap<String, String>,
    attributes: HashMap<String, String>,
    spec: Option<ResourceSpec>,
}

#[derive(Default)]
struct Inventory {
    next_id: u64,
    resources: BTreeMap<String, FakeResource>,
    create_failures: HashMap<ResourceKind, Vec<ResourceError>>,
    sticky_create_failures: HashMap<ResourceKind, ResourceError>,
    delete_failures: HashMap<ResourceKind, ResourceError>,
    create_delays: HashMap<ResourceKind, Duration>,
    late_answers: HashMap<ResourceKind, Duration>,
    delete_delays: HashMap<ResourceKind, Duration>,
    calls: HashMap<(ResourceKind, &'static str), usize>,
    created: Vec<(ResourceKind, String)>,
    deleted: Vec<(ResourceKind, String)>,
}

/// Shared in-memory inventory of cloud resources
#[derive(Clone, Default)]
pub struct FakeCloud {
    inner: Arc<Mutex<Inventory>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// One service per resource kind, all backed by this inventory.
    pub fn services(&self) -> Vec<Arc<dyn ResourceService>> {
        ResourceKind::ALL
            .iter()
            .map(|kind| {
                Arc::new(FakeService {
                    kind: *kind,
                    cloud: self.clone(),
                }) as Arc<dyn ResourceService>
            })
            .collect()
    }

    /// Make every create of `kind` fail until cleared.
    pub fn fail_create(&self, kind: ResourceKind, error: ResourceError) {
        guard(&self.inner).sticky_create_failures.insert(kind, error);
    }

    /// Fail the next creates of `kind` with these errors, in order.
    pub fn fail_create_times(&self, kind: ResourceKind, errors: Vec<ResourceError>) {
        let mut errors = errors;
        errors.reverse();
        guard(&self.inner).create_failures.insert(kind, errors);
    }

    pub fn fail_delete(&self, kind: ResourceKind, error: ResourceError) {
        guard(&self.inner).delete_failures.insert(kind, error);
    }

    pub fn clear_failures(&self) {
        let mut inner = guard(&self.inner);
        inner.create_failures.clear();
        inner.sticky_create_failures.clear();
        inner.delete_failures.clear();
    }

    /// Delay creates of `kind`, e.g. to keep a deployment in flight.
    pub fn delay_create(&self, kind: ResourceKind, delay: Duration) {
        guard(&self.inner).create_delays.insert(kind, delay);
    }

    /// Let the next create of `kind` take effect at once but answer only
    /// after `delay`.
    pub fn answer_create_late(&self, kind: ResourceKind, delay: Duration) {
        guard(&self.inner).late_answers.insert(kind, delay);
    }

    /// Delay deletes of `kind`.
    pub fn delay_delete(&self, kind: ResourceKind, delay: Duration) {
        guard(&self.inner).delete_delays.insert(kind, delay);
    }

    /// Add a resource not created by the engine (no stack tag).
    pub fn insert_existing(&self, kind: ResourceKind, id: impl Into<String>) -> String {
        let id = id.into();
        guard(&self.inner).resources.insert(
            id.clone(),
            FakeResource {
                kind,
                tags: BTreeMap::new(),
                attributes: default_attributes(kind, 250),
                spec: None,
            },
        );
        id
    }

    /// Remove a resource behind the engine's back.
    pub fn remove(&self, id: &str) -> bool {
        guard(&self.inner).resources.remove(id).is_some()
    }

    pub fn exists(&self, id: &str) -> bool {
        guard(&self.inner).resources.contains_key(id)
    }

    /// Ids of live resources of `kind`.
    pub fn live(&self, kind: ResourceKind) -> Vec<String> {
        guard(&self.inner)
            .resources
            .iter()
            .filter(|(_, r)| r.kind == kind)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn resource_count(&self) -> usize {
        guard(&self.inner).resources.len()
    }

    /// Number of successful creates of `kind`.
    pub fn created(&self, kind: ResourceKind) -> usize {
        guard(&self.inner)
            .created
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    /// Ids deleted so far, in deletion order.
    pub fn deleted(&self) -> Vec<(ResourceKind, String)> {
        guard(&self.inner).deleted.clone()
    }

    pub fn calls(&self, kind: ResourceKind, operation: &str) -> usize {
        guard(&self.inner)
            .calls
            .iter()
            .filter(|((k, op), _)| *k == kind && *op == operation)
            .map(|(_, n)| *n)
            .sum()
    }

    /// Spec of the most recent compute create.
    pub fn last_compute_spec(&self) -> Option<ResourceSpec> {
        let inner = guard(&self.inner);
        inner
            .created
            .iter()
            .rev()
            .find(|(k, _)| *k == ResourceKind::Compute)
            .and_then(|(_, id)| inner.resources.get(id))
            .and_then(|r| r.spec.clone())
    }

    fn count(&self, kind: ResourceKind, operation: &'static str) {
        *guard(&self.inner).calls.entry((kind, operation)).or_default() += 1;
    }

    fn describe_now(&self, id: &str) -> Option<ResourceDescription> {
        guard(&self.inner).resources.get(id).map(|r| ResourceDescription {
            id: id.to_string(),
            kind: r.kind,
            state: RemoteState::Ready,
            attributes: r.attributes.clone(),
            tags: r.tags.clone(),
        })
    }
}

fn prefix(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Network => "vpc",
        ResourceKind::Storage => "vol",
        ResourceKind::Security => "sg",
        ResourceKind::Compute => "i",
        ResourceKind::LoadBalancer => "lb",
        ResourceKind::Cdn => "cdn",
    }
}

fn default_attributes(kind: ResourceKind, n: u64) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    match kind {
        ResourceKind::Network => {
            attributes.insert(attr::AVAILABILITY_ZONE.to_string(), "us-east-1a".to_string());
        }
        ResourceKind::Compute => {
            attributes.insert(attr::PUBLIC_IP.to_string(), format!("203.0.113.{}", n % 250 + 1));
            attributes.insert(attr::PRIVATE_IP.to_string(), format!("10.0.1.{}", n % 250 + 1));
        }
        ResourceKind::LoadBalancer => {
            attributes.insert(attr::DNS_NAME.to_string(), format!("lb-{}.elb.example.com", n));
        }
        ResourceKind::Cdn => {
            attributes.insert(attr::DNS_NAME.to_string(), format!("d{}.cdn.example.com", n));
        }
        ResourceKind::Storage | ResourceKind::Security => {}
    }
    attributes
}

struct FakeService {
    kind: ResourceKind,
    cloud: FakeCloud,
}

#[async_trait]
impl ResourceService for FakeService {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn discover(&self, stack_id: &str) -> Result<Option<ResourceDescription>, ResourceError> {
        self.cloud.count(self.kind, "discover");
        let id = guard(&self.cloud.inner)
            .resources
            .iter()
            .find(|(_, r)| {
                r.kind == self.kind && r.tags.get(STACK_TAG).map(String::as_str) == Some(stack_id)
            })
            .map(|(id, _)| id.clone());
        Ok(id.and_then(|id| self.cloud.describe_now(&id)))
    }

    async fn describe(&self, id: &str) -> Result<Option<ResourceDescription>, ResourceError> {
        self.cloud.count(self.kind, "describe");
        Ok(self.cloud.describe_now(id).filter(|d| d.kind == self.kind))
    }

    async fn create(&self, request: &CreateRequest) -> Result<String, ResourceError> {
        self.cloud.count(self.kind, "create");
        let delay = guard(&self.cloud.inner).create_delays.get(&self.kind).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (id, late) = {
            let mut inner = guard(&self.cloud.inner);
            if let Some(error) = inner.sticky_create_failures.get(&self.kind) {
                return Err(error.clone());
            }
            if let Some(error) = inner.create_failures.get_mut(&self.kind).and_then(Vec::pop) {
                return Err(error);
            }

            inner.next_id += 1;
            let n = inner.next_id;
            let id = format!("{}-{:04}", prefix(self.kind), n);
            inner.resources.insert(
                id.clone(),
                FakeResource {
                    kind: self.kind,
                    tags: request.tags.clone(),
                    attributes: default_attributes(self.kind, n),
                    spec: Some(request.spec.clone()),
                },
            );
            inner.created.push((self.kind, id.clone()));
            (id, inner.late_answers.remove(&self.kind))
        };

        if let Some(delay) = late {
            tokio::time::sleep(delay).await;
        }
        Ok(id)
    }

    async fn wait_until_ready(&self, id: &str, _timeout: Duration) -> Result<ResourceDescription, ResourceError> {
        self.cloud.count(self.kind, "wait_until_ready");
        self.cloud
            .describe_now(id)
            .ok_or_else(|| ResourceError::not_found(id))
    }

    async fn delete(&self, id: &str) -> Result<(), ResourceError> {
        self.cloud.count(self.kind, "delete");
        let delay = guard(&self.cloud.inner).delete_delays.get(&self.kind).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = guard(&self.cloud.inner);
        if let Some(error) = inner.delete_failures.get(&self.kind) {
            return Err(error.clone());
        }
        match inner.resources.remove(id) {
            Some(_) => {
                inner.deleted.push((self.kind, id.to_string()));
                Ok(())
            }
            None => Err(ResourceError::not_found(id)),
        }
    }
}

/// Health probe with switchable per-service health
#[derive(Default)]
pub struct FakeProbe {
    unhealthy: Mutex<HashSet<String>>,
    all_down: Mutex<bool>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_unhealthy(&self, service: &str, unhealthy: bool) {
        let mut set = guard(&self.unhealthy);
        if unhealthy {
            set.insert(service.to_string());
        } else {
            set.remove(service);
        }
    }

    pub fn set_all_down(&self, down: bool) {
        *guard(&self.all_down) = down;
    }

    /// Hold every check started from now on for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *guard(&self.delay) = delay;
    }

    /// Checks started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self, _address: &str, service: &ServiceSpec) -> ProbeOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *guard(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *guard(&self.all_down) || guard(&self.unhealthy).contains(&service.name) {
            ProbeOutcome::unhealthy(Duration::ZERO, format!("{} not answering", service.name))
        } else {
            ProbeOutcome::healthy(Duration::from_millis(2))
        }
    }
}

/// Pricing source with fixed answers
#[derive(Default)]
pub struct FakePricing {
    spot: Mutex<Option<f64>>,
    on_demand: Mutex<Option<f64>>,
    calls: AtomicUsize,
}

impl FakePricing {
    pub fn new(spot: Option<f64>, on_demand: Option<f64>) -> Arc<Self> {
        Arc::new(Self {
            spot: Mutex::new(spot),
            on_demand: Mutex::new(on_demand),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_spot(&self, price: Option<f64>) {
        *guard(&self.spot) = price;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PricingSource for FakePricing {
    async fn spot_price(&self, _instance_type: &str, _region: &str) -> Result<f64, PricingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (*guard(&self.spot)).ok_or_else(|| PricingError::Unavailable("spot feed down".to_string()))
    }

    async fn on_demand_price(&self, instance_type: &str, region: &str) -> Result<f64, PricingError> {
        (*guard(&self.on_demand)).ok_or_else(|| PricingError::NoPrice {
            instance_type: instance_type.to_string(),
            region: region.to_string(),
        })
    }
}
