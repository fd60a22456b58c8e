//! Process-wide metrics
//!
//! Counters, gauges and latency histograms built on atomics, rendered in the
//! Prometheus text format at `/metrics`:
//! - HTTP request latency per route
//! - proposal outcomes and the applied index
//! - live watchers and how watches end

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// Fixed-bucket histogram for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    /// Sum in microseconds
    sum_us: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        Self {
            buckets: (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: boundaries.to_vec(),
            sum_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in milliseconds
    pub fn observe(&self, value_ms: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| value_ms <= b)
            .unwrap_or(self.boundaries.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_us
            .fetch_add((value_ms * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative `(le, count)` pairs ending with `+Inf`
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            let le = self.boundaries.get(i).copied().unwrap_or(f64::INFINITY);
            result.push((le, cumulative));
        }
        result
    }

    /// Sum of observed values in milliseconds
    pub fn sum(&self) -> f64 {
        self.sum_us.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Per-route HTTP metrics
#[derive(Debug, Default)]
pub struct RouteMetrics {
    pub requests_total: Counter,
    pub requests_error: Counter,
    pub latency: Histogram,
}

#[derive(Debug)]
pub struct MetricsRegistry {
    routes: Mutex<BTreeMap<String, Arc<RouteMetrics>>>,

    pub total_requests: Counter,
    pub total_errors: Counter,

    // Consensus
    pub proposals_pending: Gauge,
    pub proposals_failed: Counter,
    pub proposals_applied: Counter,
    pub applied_index: Gauge,
    pub leader_changes: Counter,

    // Watches
    pub watchers_active: Gauge,
    pub watch_completed: Counter,
    pub watch_cancelled: Counter,
    pub watch_overruns: Counter,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(BTreeMap::new()),
            total_requests: Counter::new(),
            total_errors: Counter::new(),
            proposals_pending: Gauge::new(),
            proposals_failed: Counter::new(),
            proposals_applied: Counter::new(),
            applied_index: Gauge::new(),
            leader_changes: Counter::new(),
            watchers_active: Gauge::new(),
            watch_completed: Counter::new(),
            watch_cancelled: Counter::new(),
            watch_overruns: Counter::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create metrics for a route
    pub fn route(&self, route: &str) -> Arc<RouteMetrics> {
        self.routes
            .lock()
            .entry(route.to_string())
            .or_default()
            .clone()
    }

    /// Record one finished HTTP request
    pub fn record_request(&self, route: &str, duration: Duration, success: bool) {
        let metrics = self.route(route);
        metrics.requests_total.inc();
        metrics.latency.observe(duration.as_secs_f64() * 1000.0);
        self.total_requests.inc();
        if !success {
            metrics.requests_error.inc();
            self.total_errors.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Render Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let scalars: [(&str, &str, &str, u64); 12] = [
            ("quorumkv_requests_total", "counter", "Total HTTP requests", self.total_requests.get()),
            ("quorumkv_errors_total", "counter", "Total HTTP requests that failed", self.total_errors.get()),
            ("quorumkv_proposals_pending", "gauge", "Proposals waiting to be applied", self.proposals_pending.get()),
            ("quorumkv_proposals_failed_total", "counter", "Proposals that failed or timed out", self.proposals_failed.get()),
            ("quorumkv_proposals_applied_total", "counter", "Log entries applied", self.proposals_applied.get()),
            ("quorumkv_applied_index", "gauge", "Index of the last applied entry", self.applied_index.get()),
            ("quorumkv_leader_changes_total", "counter", "Leader changes seen", self.leader_changes.get()),
            ("quorumkv_watchers", "gauge", "Registered watchers", self.watchers_active.get()),
            ("quorumkv_watch_completed_total", "counter", "Watches that delivered their event", self.watch_completed.get()),
            ("quorumkv_watch_cancelled_total", "counter", "Watches cancelled by the client or deadline", self.watch_cancelled.get()),
            ("quorumkv_watch_overruns_total", "counter", "Watchers dropped for falling behind", self.watch_overruns.get()),
            ("quorumkv_uptime_seconds", "gauge", "Server uptime in seconds", self.uptime_seconds()),
        ];
        for (name, kind, help, value) in scalars {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} {}", name, kind);
            let _ = writeln!(out, "{} {}", name, value);
        }

        let routes = self.routes.lock();
        let _ = writeln!(
            out,
            "# HELP quorumkv_http_request_duration_ms Request duration in milliseconds"
        );
        let _ = writeln!(out, "# TYPE quorumkv_http_request_duration_ms histogram");
        for (route, metrics) in routes.iter() {
            for (le, count) in metrics.latency.get_buckets() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(
                    out,
                    "quorumkv_http_request_duration_ms_bucket{{route=\"{}\",le=\"{}\"}} {}",
                    route, le, count
                );
            }
            let _ = writeln!(
                out,
                "quorumkv_http_request_duration_ms_sum{{route=\"{}\"}} {}",
                route,
                metrics.latency.sum()
            );
            let _ = writeln!(
                out,
                "quorumkv_http_request_duration_ms_count{{route=\"{}\"}} {}",
                route,
                metrics.latency.count()
            );
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);
