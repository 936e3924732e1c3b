//! TTL-cached upstream health verdicts.
//!
//! A record younger than the TTL is returned as is. A stale or missing record
//! triggers a probe (`GET baseUrl + healthCheckPath`) whose outcome, success
//! or failure, is cached for the next TTL. Two callers racing on the same stale
//! record may both probe; the last write wins.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::{
    core::registry::ServiceRegistry,
    ports::http_client::{HttpClient, HttpClientError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub service_name: String,
    pub status: HealthStatus,
    pub url: String,
    pub last_checked_at: DateTime<Utc>,
    #[serde(skip)]
    pub checked_at: Instant,
    pub last_response_time_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl HealthRecord {
    /// A verdict stamped with the current time.
    pub fn probed(
        service: &str,
        url: String,
        status: HealthStatus,
        response_time_ms: Option<u64>,
        error: Option<String>,
    ) -> Self {
        Self {
            service_name: service.to_string(),
            status,
            url,
            last_checked_at: Utc::now(),
            checked_at: Instant::now(),
            last_response_time_ms: response_time_ms,
            last_error: error,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.checked_at.elapsed() < ttl
    }
}

pub struct HealthCache {
    registry: Arc<ServiceRegistry>,
    client: Arc<dyn HttpClient>,
    records: scc::HashMap<String, HealthRecord>,
    ttl: Duration,
    probe_timeout: Duration,
}

impl HealthCache {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        client: Arc<dyn HttpClient>,
        ttl: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            client,
            records: scc::HashMap::new(),
            ttl,
            probe_timeout,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current verdict for `service`, probing first if the cached one is stale.
    pub async fn get_status(&self, service: &str) -> HealthRecord {
        let Some(descriptor) = self.registry.get(service) else {
            return HealthRecord::probed(
                service,
                String::new(),
                HealthStatus::Unknown,
                None,
                Some(format!("Service '{service}' is not registered")),
            );
        };

        let cached = self
            .records
            .get_async(service)
            .await
            .map(|entry| entry.get().clone());
        if let Some(record) = cached.filter(|r| r.is_fresh(self.ttl)) {
            return record;
        }

        let url = descriptor.health_url();
        let started = Instant::now();
        let outcome = match tokio::time::timeout(
            self.probe_timeout,
            self.client.probe(&url, self.probe_timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(HttpClientError::timeout(self.probe_timeout)),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let record = match outcome {
            Ok(status) if status == http::StatusCode::OK => {
                HealthRecord::probed(service, url, HealthStatus::Healthy, Some(elapsed_ms), None)
            }
            Ok(status) => {
                tracing::warn!(
                    "Health probe for '{}' at {} answered {}",
                    service,
                    url,
                    status
                );
                HealthRecord::probed(
                    service,
                    url,
                    HealthStatus::Unhealthy,
                    Some(elapsed_ms),
                    Some(format!("Unexpected status {status}")),
                )
            }
            Err(e) => {
                tracing::warn!("Health probe for '{}' at {} failed: {}", service, url, e);
                HealthRecord::probed(
                    service,
                    url,
                    HealthStatus::Unhealthy,
                    None,
                    Some(e.to_string()),
                )
            }
        };

        self.records
            .upsert_async(service.to_string(), record.clone())
            .await;
        record
    }

    /// Verdicts for every registered service, probed concurrently.
    pub async fn get_all(&self) -> Vec<HealthRecord> {
        let names = self.registry.names();
        futures_util::future::join_all(names.into_iter().map(|name| self.get_status(name))).await
    }
}
