//! Network health probe
//!
//! HTTP services are healthy when `GET http://<address>:<port><path>` answers
//! with a 2xx status; TCP services when a connection can be opened. Both are
//! bounded by the service timeout.

use crate::config::{ProbeKind, ServiceSpec};
use crate::provider::{HealthProbe, ProbeOutcome};
use crate::state::{ServiceHealthRecord, ServiceStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Instant;
use tokio::net::TcpStream;

/// [`HealthProbe`] over plain HTTP and TCP
#[derive(Clone, Default)]
pub struct NetworkProbe {
    client: reqwest::Client,
}

impl NetworkProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn probe_http(&self, address: &str, service: &ServiceSpec, path: &str) -> Result<(), String> {
        let url = format!("http://{}:{}{}", address, service.port, path);
        let response = self
            .client
            .get(&url)
            .timeout(service.timeout())
            .send()
            .await
            .map_err(|e| format!("GET {} failed: {}", url, e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("GET {} returned {}", url, status))
        }
    }

    async fn probe_tcp(&self, address: &str, service: &ServiceSpec) -> Result<(), String> {
        match tokio::time::timeout(service.timeout(), TcpStream::connect((address, service.port))).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(format!("connect {}:{} failed: {}", address, service.port, e)),
            Err(_) => Err(format!(
                "connect {}:{} timed out after {:?}",
                address,
                service.port,
                service.timeout()
            )),
        }
    }
}

#[async_trait]
impl HealthProbe for NetworkProbe {
    async fn probe(&self, address: &str, service: &ServiceSpec) -> ProbeOutcome {
        let started = Instant::now();
        let result = match &service.probe {
            ProbeKind::Http { path } => self.probe_http(address, service, path).await,
            ProbeKind::Tcp => self.probe_tcp(address, service).await,
        };
        match result {
            Ok(()) => ProbeOutcome::healthy(started.elapsed()),
            Err(e) => {
                tracing::debug!(service = %service.name, "Probe failed: {}", e);
                ProbeOutcome::unhealthy(started.elapsed(), e)
            }
        }
    }
}

/// Probe every service concurrently and fold the outcomes into `records`.
///
/// Records missing for a service are created; the number of services that
/// failed this round is returned.
pub(crate) async fn probe_round(
    probe: &dyn HealthProbe,
    address: &str,
    services: &[ServiceSpec],
    records: &mut Vec<ServiceHealthRecord>,
) -> usize {
    let outcomes =
        futures_util::future::join_all(services.iter().map(|s| probe.probe(address, s))).await;
    let now = Utc::now();

    let mut failed = 0;
    for (spec, outcome) in services.iter().zip(outcomes) {
        let index = match records.iter().position(|r| r.name == spec.name) {
            Some(index) => index,
            None => {
                records.push(ServiceHealthRecord::starting(spec));
                records.len() - 1
            }
        };
        let record = &mut records[index];
        if outcome.healthy {
            record.record_success(outcome.latency.as_millis() as u64, now);
        } else {
            failed += 1;
            record.record_failure(
                outcome.error.unwrap_or_else(|| "unhealthy".to_string()),
                now,
            );
        }
    }
    failed
}

/// Names of services whose record is not healthy.
pub(crate) fn unhealthy_names(records: &[ServiceHealthRecord]) -> Vec<&str> {
    records
        .iter()
        .filter(|r| r.status != ServiceStatus::Healthy)
        .map(|r| r.name.as_str())
        .collect()
}
