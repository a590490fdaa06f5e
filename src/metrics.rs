//! Metrics helpers for Rampart.
//!
//! Thin wrappers over the `metrics` crate macros. [`init_metrics`] installs a
//! Prometheus recorder whose text exposition is served on
//! `/metrics/prometheus`. The gateway additionally keeps an in-process
//! [`OutcomeCounters`] snapshot that `/metrics` serves as JSON.
//!
//! Provided metrics:
//! * `rampart_requests_total` (counter, label `outcome`)
//! * `rampart_request_duration_seconds` (histogram)
//! * `rampart_upstream_requests_total` (counter, labels `upstream`, `status`)
//! * `rampart_upstream_request_duration_seconds` (histogram)
//! * `rampart_instance_health_status` (gauge per instance)
//! * `rampart_retry_attempts_total` (counter per route)
//! * `rampart_rate_limited_total` (counter per route)
//! * `rampart_breaker_transitions_total` (counter, labels `breaker`, `from`, `to`)
//! * `rampart_breaker_state` (gauge, 0 closed, 1 half-open, 2 open)
//! * `rampart_stream_dropped_events_total` (counter)
//! * `rampart_active_streams` (gauge)
use std::{
    collections::{BTreeMap, HashMap},
    time::{Duration, Instant},
};

use eyre::WrapErr;
use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::{Lazy, OnceCell};

pub const RAMPART_REQUESTS_TOTAL: &str = "rampart_requests_total";
pub const RAMPART_REQUEST_DURATION_SECONDS: &str = "rampart_request_duration_seconds";
pub const RAMPART_UPSTREAM_REQUESTS_TOTAL: &str = "rampart_upstream_requests_total";
pub const RAMPART_UPSTREAM_REQUEST_DURATION_SECONDS: &str =
    "rampart_upstream_request_duration_seconds";
pub const RAMPART_INSTANCE_HEALTH_STATUS: &str = "rampart_instance_health_status";
pub const RAMPART_RETRY_ATTEMPTS_TOTAL: &str = "rampart_retry_attempts_total";
pub const RAMPART_RATE_LIMITED_TOTAL: &str = "rampart_rate_limited_total";
pub const RAMPART_BREAKER_TRANSITIONS_TOTAL: &str = "rampart_breaker_transitions_total";
pub const RAMPART_BREAKER_STATE: &str = "rampart_breaker_state";
pub const RAMPART_STREAM_DROPPED_EVENTS_TOTAL: &str = "rampart_stream_dropped_events_total";
pub const RAMPART_ACTIVE_STREAMS: &str = "rampart_active_streams";

/// Last reported health per instance, kept for `/health`-style ad-hoc exports.
pub static INSTANCE_HEALTH_GAUGES: Lazy<scc::HashMap<String, f64>> = Lazy::new(scc::HashMap::new);

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

fn describe_metrics() {
    describe_counter!(
        RAMPART_REQUESTS_TOTAL,
        Unit::Count,
        "Requests handled by the gateway, by outcome."
    );
    describe_histogram!(
        RAMPART_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests handled by the gateway."
    );
    describe_counter!(
        RAMPART_UPSTREAM_REQUESTS_TOTAL,
        Unit::Count,
        "Requests sent to upstream instances."
    );
    describe_histogram!(
        RAMPART_UPSTREAM_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Time until upstream response headers arrived."
    );
    describe_gauge!(
        RAMPART_INSTANCE_HEALTH_STATUS,
        "Health of individual upstream instances (1 healthy, 0 unhealthy)."
    );
    describe_counter!(
        RAMPART_RETRY_ATTEMPTS_TOTAL,
        Unit::Count,
        "Retries issued after a retryable outcome."
    );
    describe_counter!(
        RAMPART_RATE_LIMITED_TOTAL,
        Unit::Count,
        "Requests rejected by a rate limit filter."
    );
    describe_counter!(
        RAMPART_BREAKER_TRANSITIONS_TOTAL,
        Unit::Count,
        "Circuit breaker state transitions."
    );
    describe_gauge!(
        RAMPART_BREAKER_STATE,
        "Circuit breaker state (0 closed, 1 half-open, 2 open)."
    );
    describe_counter!(
        RAMPART_STREAM_DROPPED_EVENTS_TOTAL,
        Unit::Count,
        "Stream events discarded by the drop_oldest overflow policy."
    );
    describe_gauge!(RAMPART_ACTIVE_STREAMS, "Streams currently being relayed.");
}

/// Set (and record) the health gauge for an upstream instance.
pub fn set_instance_health_status(instance: &str, is_healthy: bool) {
    let value = if is_healthy { 1.0 } else { 0.0 };
    INSTANCE_HEALTH_GAUGES.upsert_sync(instance.to_string(), value);
    gauge!(RAMPART_INSTANCE_HEALTH_STATUS, "instance" => instance.to_string()).set(value);
}

pub fn increment_request_total(outcome: &'static str) {
    counter!(RAMPART_REQUESTS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn increment_upstream_request(upstream: &str, status: u16) {
    counter!(
        RAMPART_UPSTREAM_REQUESTS_TOTAL,
        "upstream" => upstream.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn increment_retry_attempt(route_id: &str) {
    counter!(RAMPART_RETRY_ATTEMPTS_TOTAL, "route" => route_id.to_string()).increment(1);
}

pub fn increment_rate_limited(route_id: &str) {
    counter!(RAMPART_RATE_LIMITED_TOTAL, "route" => route_id.to_string()).increment(1);
}

pub fn record_breaker_transition(breaker: &str, from: &'static str, to: &'static str) {
    counter!(
        RAMPART_BREAKER_TRANSITIONS_TOTAL,
        "breaker" => breaker.to_string(),
        "from" => from,
        "to" => to
    )
    .increment(1);
}

pub fn set_breaker_state(breaker: &str, value: f64) {
    gauge!(RAMPART_BREAKER_STATE, "breaker" => breaker.to_string()).set(value);
}

pub fn increment_stream_dropped_events(count: u64) {
    counter!(RAMPART_STREAM_DROPPED_EVENTS_TOTAL).increment(count);
}

/// Tracks one relayed stream in `rampart_active_streams` until dropped.
pub struct ActiveStreamGuard;

impl ActiveStreamGuard {
    pub fn new() -> Self {
        gauge!(RAMPART_ACTIVE_STREAMS).increment(1.0);
        Self
    }
}

impl Default for ActiveStreamGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ActiveStreamGuard {
    fn drop(&mut self) {
        gauge!(RAMPART_ACTIVE_STREAMS).decrement(1.0);
    }
}

/// RAII helper measuring inbound request duration.
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for RequestTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        histogram!(RAMPART_REQUEST_DURATION_SECONDS).record(self.start.elapsed().as_secs_f64());
    }
}

/// RAII helper measuring time to upstream response headers.
pub struct UpstreamRequestTimer {
    start: Instant,
    upstream: String,
}

impl UpstreamRequestTimer {
    pub fn new(upstream: &str) -> Self {
        Self {
            start: Instant::now(),
            upstream: upstream.to_string(),
        }
    }
}

impl Drop for UpstreamRequestTimer {
    fn drop(&mut self) {
        histogram!(
            RAMPART_UPSTREAM_REQUEST_DURATION_SECONDS,
            "upstream" => std::mem::take(&mut self.upstream)
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}

/// In-process outcome counters, one per outcome label.
#[derive(Debug, Default)]
pub struct OutcomeCounters {
    counts: scc::HashMap<&'static str, u64>,
}

impl OutcomeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one outcome here and in `rampart_requests_total`.
    pub fn record(&self, outcome: &'static str) {
        let mut entry = self.counts.entry_sync(outcome).or_insert(0);
        *entry.get_mut() += 1;
        drop(entry);
        increment_request_total(outcome);
    }

    pub fn get(&self, outcome: &str) -> u64 {
        self.counts.read_sync(outcome, |_, count| *count).unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        let mut snapshot = BTreeMap::new();
        self.counts.iter_sync(|outcome, count| {
            snapshot.insert(*outcome, *count);
            true
        });
        snapshot
    }
}

/// Install the Prometheus recorder and register metric descriptions.
///
/// Idempotent: later calls return the handle installed by the first one.
pub fn init_metrics() -> eyre::Result<PrometheusHandle> {
    let handle = PROMETHEUS.get_or_try_init(|| {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .wrap_err("Failed to install Prometheus recorder")?;
        describe_metrics();
        tracing::debug!("Prometheus recorder installed");
        Ok::<_, eyre::Report>(handle)
    })?;
    Ok(handle.clone())
}

/// Periodically drain histogram buckets until the task is dropped.
pub async fn run_upkeep(handle: PrometheusHandle) {
    let mut interval = tokio::time::interval(UPKEEP_INTERVAL);
    loop {
        interval.tick().await;
        handle.run_upkeep();
    }
}

/// Prometheus text exposition, if a recorder was installed.
pub fn render_prometheus() -> Option<String> {
    PROMETHEUS.get().map(PrometheusHandle::render)
}

/// Snapshot of instance health gauges.
pub fn instance_health_snapshot() -> HashMap<String, f64> {
    let mut snapshot = HashMap::new();
    INSTANCE_HEALTH_GAUGES.iter_sync(|instance, value| {
        snapshot.insert(instance.clone(), *value);
        true
    });
    snapshot
}
