use dashmap::DashMap;
use hdrhistogram::Histogram;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

/// Histogram bucket boundaries for latency metrics (seconds), used by the
/// Prometheus exporter only. The percentile reservoir below is separate.
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Highest latency (microseconds) the per-route reservoir can record;
/// anything above is clamped rather than dropped, keeping the histogram's
/// memory footprint fixed regardless of traffic.
const MAX_LATENCY_MICROS: u64 = 60_000_000;

/// Per-route counters plus a bounded-memory latency reservoir. hdrhistogram
/// gives percentile estimation with a fixed allocation (no unbounded
/// resizing as traffic grows), which is how this reservoir stays bounded
/// the way the distilled spec's "fixed-size ring of recent samples"
/// describes without literally carrying a growable Vec of samples.
struct RouteMetrics {
    total: AtomicU64,
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    rate_limited: AtomicU64,
    circuit_rejected: AtomicU64,
    latencies_micros: Mutex<Histogram<u64>>,
}

impl RouteMetrics {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            status_2xx: AtomicU64::new(0),
            status_3xx: AtomicU64::new(0),
            status_4xx: AtomicU64::new(0),
            status_5xx: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            circuit_rejected: AtomicU64::new(0),
            latencies_micros: Mutex::new(
                Histogram::new_with_bounds(1, MAX_LATENCY_MICROS, 3)
                    .expect("static histogram bounds are valid"),
            ),
        }
    }

    fn record(&self, status: u16, latency: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match status {
            200..=299 => self.status_2xx.fetch_add(1, Ordering::Relaxed),
            300..=399 => self.status_3xx.fetch_add(1, Ordering::Relaxed),
            400..=499 => self.status_4xx.fetch_add(1, Ordering::Relaxed),
            _ => self.status_5xx.fetch_add(1, Ordering::Relaxed),
        };
        let micros = latency.as_micros().min(MAX_LATENCY_MICROS as u128) as u64;
        if let Ok(mut h) = self.latencies_micros.lock() {
            let _ = h.record(micros.max(1));
        }
    }

    fn snapshot(&self) -> Value {
        let h = self.latencies_micros.lock().expect("histogram mutex poisoned");
        json!({
            "total": self.total.load(Ordering::Relaxed),
            "status_2xx": self.status_2xx.load(Ordering::Relaxed),
            "status_3xx": self.status_3xx.load(Ordering::Relaxed),
            "status_4xx": self.status_4xx.load(Ordering::Relaxed),
            "status_5xx": self.status_5xx.load(Ordering::Relaxed),
            "rate_limited": self.rate_limited.load(Ordering::Relaxed),
            "circuit_rejected": self.circuit_rejected.load(Ordering::Relaxed),
            "latency_ms": {
                "p50": micros_to_ms(h.value_at_quantile(0.50)),
                "p95": micros_to_ms(h.value_at_quantile(0.95)),
                "p99": micros_to_ms(h.value_at_quantile(0.99)),
            },
        })
    }
}

fn micros_to_ms(micros: u64) -> f64 {
    micros as f64 / 1000.0
}

/// Process-local metrics: per-route counters and latency percentiles for the
/// JSON `/metrics` snapshot, plus the global Prometheus recorder backing
/// `/metrics/prometheus`. Both are fed from the same call sites so the two
/// endpoints never disagree about what happened.
pub struct MetricsRegistry {
    prometheus: PrometheusHandle,
    routes: DashMap<String, RouteMetrics>,
}

impl MetricsRegistry {
    /// Installs the global Prometheus recorder. Production code calls this
    /// exactly once at startup; tests may call it repeatedly (each gets its
    /// own local route table, sharing the one process-wide global recorder
    /// the `metrics` crate requires).
    pub fn install() -> Self {
        static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();
        let handle = RECORDER
            .get_or_init(|| {
                PrometheusBuilder::new()
                    .set_buckets_for_metric(
                        metrics_exporter_prometheus::Matcher::Suffix(
                            "_duration_seconds".to_string(),
                        ),
                        LATENCY_BUCKETS,
                    )
                    .expect("valid matcher")
                    .install_recorder()
                    .expect("failed to install metrics recorder")
            })
            .clone();

        describe_counter!(
            "gateway_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed, by route and status class"
        );
        describe_histogram!(
            "gateway_http_request_duration_seconds",
            Unit::Seconds,
            "End-to-end request duration as observed by the gateway"
        );
        describe_gauge!(
            "gateway_http_requests_in_flight",
            Unit::Count,
            "Number of requests currently being processed"
        );
        describe_counter!(
            "gateway_rate_limit_rejected_total",
            Unit::Count,
            "Requests rejected by the sliding-window or token-bucket limiter"
        );
        describe_counter!(
            "gateway_rate_limit_store_fail_open_total",
            Unit::Count,
            "Requests admitted because the shared store was unreachable"
        );
        describe_counter!(
            "gateway_circuit_breaker_rejected_total",
            Unit::Count,
            "Requests fast-rejected by an open circuit breaker"
        );
        describe_gauge!(
            "gateway_connections_active",
            Unit::Count,
            "Active downstream connections"
        );
        describe_counter!(
            "gateway_connections_total",
            Unit::Count,
            "Total downstream connections accepted"
        );

        Self {
            prometheus: handle,
            routes: DashMap::new(),
        }
    }

    /// Records a completed request's outcome for `route` (status and
    /// latency), updating both the Prometheus recorder and the local
    /// percentile reservoir.
    pub fn record_request(&self, route: &str, status: u16, latency: Duration) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status).to_owned();

        metrics::counter!(
            "gateway_http_requests_total",
            "route" => route.to_string(),
            "status_code" => status_str,
        )
        .increment(1);
        metrics::histogram!(
            "gateway_http_request_duration_seconds",
            "route" => route.to_string(),
        )
        .record(latency.as_secs_f64());

        self.routes
            .entry(route.to_string())
            .or_insert_with(RouteMetrics::new)
            .record(status, latency);
    }

    pub fn record_rate_limited(&self, route: &str) {
        metrics::counter!(
            "gateway_rate_limit_rejected_total",
            "route" => route.to_string(),
        )
        .increment(1);
        self.routes
            .entry(route.to_string())
            .or_insert_with(RouteMetrics::new)
            .rate_limited
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_fail_open(&self, origin: &str) {
        metrics::counter!(
            "gateway_rate_limit_store_fail_open_total",
            "origin" => origin.to_string(),
        )
        .increment(1);
    }

    pub fn record_circuit_rejected(&self, service: &str) {
        metrics::counter!(
            "gateway_circuit_breaker_rejected_total",
            "service" => service.to_string(),
        )
        .increment(1);
        self.routes
            .entry(service.to_string())
            .or_insert_with(RouteMetrics::new)
            .circuit_rejected
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Renders the global recorder in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        self.prometheus.render()
    }

    /// Builds the JSON snapshot served at `GET /metrics`.
    pub fn snapshot(&self) -> Value {
        let routes: serde_json::Map<String, Value> = self
            .routes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        json!({ "routes": routes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_status_classes_and_percentiles() {
        let registry = MetricsRegistry::install();
        for _ in 0..10 {
            registry.record_request("users", 200, Duration::from_millis(10));
        }
        registry.record_request("users", 500, Duration::from_millis(200));

        let snapshot = registry.snapshot();
        let users = &snapshot["routes"]["users"];
        assert_eq!(users["total"], 11);
        assert_eq!(users["status_2xx"], 10);
        assert_eq!(users["status_5xx"], 1);
        assert!(users["latency_ms"]["p50"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn prometheus_output_is_nonempty_after_a_record() {
        let registry = MetricsRegistry::install();
        registry.record_request("orders", 200, Duration::from_millis(5));
        assert!(registry.render_prometheus().contains("gateway_http_requests_total"));
    }
}
