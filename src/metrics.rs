//! Request metrics for the gateway.
//!
//! [`MetricsAggregator`] keeps process-wide counters updated exactly once per
//! completed request and derives averages and rates only when a snapshot is
//! read. Every sample is mirrored to OpenTelemetry instruments:
//!
//! * `gateway_requests_total` (counter; `method`, `status`)
//! * `gateway_request_duration_ms` (histogram; `method`)
//!
//! Without an OTLP endpoint the global meter is a no-op.
use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram},
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, metrics::SdkMeterProvider};
use serde::Serialize;

pub const GATEWAY_REQUESTS_TOTAL: &str = "gateway_requests_total";
pub const GATEWAY_REQUEST_DURATION_MS: &str = "gateway_request_duration_ms";

#[derive(Debug, Default)]
struct RequestStats {
    total_requests: u64,
    by_method: BTreeMap<String, u64>,
    by_status: BTreeMap<u16, u64>,
    response_time_total_ms: f64,
    response_time_count: u64,
    response_time_min_ms: Option<f64>,
    response_time_max_ms: f64,
    errors_total: u64,
    errors_4xx: u64,
    errors_5xx: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestCounts {
    pub total: u64,
    pub by_method: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResponseTimeStats {
    pub average: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorCounts {
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
}

/// Point-in-time view of the aggregator with derived statistics.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Milliseconds since the aggregator was created
    pub uptime: u64,
    pub uptime_human: String,
    pub requests: RequestCounts,
    pub response_time: ResponseTimeStats,
    pub errors: ErrorCounts,
    pub requests_per_second: f64,
    /// Percentage of requests answered with 4xx/5xx
    pub error_rate: f64,
    pub started_at: DateTime<Utc>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub struct MetricsAggregator {
    stats: Mutex<RequestStats>,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    requests_total: Counter<u64>,
    request_duration: Histogram<f64>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    /// Create an aggregator. Instruments are bound to whichever global meter
    /// provider is installed at this point.
    pub fn new() -> Self {
        let meter = global::meter("gatehouse");
        let requests_total = meter
            .u64_counter(GATEWAY_REQUESTS_TOTAL)
            .with_description("Total number of HTTP requests handled by the gateway.")
            .build();
        let request_duration = meter
            .f64_histogram(GATEWAY_REQUEST_DURATION_MS)
            .with_unit("ms")
            .with_description("Latency of HTTP requests handled by the gateway.")
            .build();

        Self {
            stats: Mutex::new(RequestStats::default()),
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            requests_total,
            request_duration,
        }
    }

    /// Record one completed request.
    pub fn record(&self, method: &str, status: u16, elapsed: Duration) {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;

        {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.total_requests += 1;
            *stats.by_method.entry(method.to_string()).or_insert(0) += 1;
            *stats.by_status.entry(status).or_insert(0) += 1;

            stats.response_time_total_ms += elapsed_ms;
            stats.response_time_count += 1;
            stats.response_time_min_ms = Some(match stats.response_time_min_ms {
                Some(min) => min.min(elapsed_ms),
                None => elapsed_ms,
            });
            stats.response_time_max_ms = stats.response_time_max_ms.max(elapsed_ms);

            if status >= 400 {
                stats.errors_total += 1;
                if status >= 500 {
                    stats.errors_5xx += 1;
                } else {
                    stats.errors_4xx += 1;
                }
            }
        }

        self.requests_total.add(
            1,
            &[
                KeyValue::new("method", method.to_string()),
                KeyValue::new("status", i64::from(status)),
            ],
        );
        self.request_duration
            .record(elapsed_ms, &[KeyValue::new("method", method.to_string())]);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn total_requests(&self) -> u64 {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total_requests
    }

    /// Derive statistics without mutating stored state.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(self.uptime())
    }

    fn snapshot_at(&self, uptime: Duration) -> MetricsSnapshot {
        let stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);

        let average = if stats.response_time_count == 0 {
            0.0
        } else {
            stats.response_time_total_ms / stats.response_time_count as f64
        };
        let uptime_secs = uptime.as_secs_f64();
        let requests_per_second = if uptime_secs > 0.0 {
            stats.total_requests as f64 / uptime_secs
        } else {
            0.0
        };
        let error_rate = if stats.total_requests == 0 {
            0.0
        } else {
            stats.errors_total as f64 / stats.total_requests as f64 * 100.0
        };

        let mut by_type = BTreeMap::new();
        by_type.insert("4xx".to_string(), stats.errors_4xx);
        by_type.insert("5xx".to_string(), stats.errors_5xx);

        MetricsSnapshot {
            uptime: uptime.as_millis() as u64,
            uptime_human: humantime::format_duration(Duration::from_secs(uptime.as_secs()))
                .to_string(),
            requests: RequestCounts {
                total: stats.total_requests,
                by_method: stats.by_method.clone(),
                by_status: stats
                    .by_status
                    .iter()
                    .map(|(status, count)| (status.to_string(), *count))
                    .collect(),
            },
            response_time: ResponseTimeStats {
                average: round2(average),
                min: round2(stats.response_time_min_ms.unwrap_or(0.0)),
                max: round2(stats.response_time_max_ms),
            },
            errors: ErrorCounts {
                total: stats.errors_total,
                by_type,
            },
            requests_per_second: round2(requests_per_second),
            error_rate: round2(error_rate),
            started_at: self.started_at_utc,
        }
    }
}

/// Install an OTLP (gRPC) metrics pipeline as the global meter provider.
///
/// Returns `None` when no endpoint is configured. Call
/// [`SdkMeterProvider::shutdown`] on the returned provider to flush on exit.
pub fn init_metrics_exporter(endpoint: Option<&str>) -> Result<Option<SdkMeterProvider>> {
    let Some(endpoint) = endpoint else {
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .wrap_err_with(|| format!("Failed to build OTLP metrics exporter for {endpoint}"))?;

    let provider = SdkMeterProvider::builder()
        .with_resource(Resource::builder().with_service_name("gatehouse").build())
        .with_periodic_exporter(exporter)
        .build();

    global::set_meter_provider(provider.clone());
    tracing::info!("OTLP metrics export enabled: endpoint={}", endpoint);
    Ok(Some(provider))
}
