//! Prometheus metrics for the synthetic monitoring agent.
//!
//! Metrics cover:
//! - Clock synchronization (current offset, sync outcomes per server)
//! - Partition refresh and rebalancing (outcomes, leadership per broker)
//! - Latency distributions (end-to-end and acknowledgement percentiles)
//! - Sample accounting (recorded, ignored, dropped)
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "synth_client"
//! prefix to avoid name collisions with other libraries using the default
//! Prometheus registry. Registration errors are logged and the metric is
//! returned unregistered instead of panicking.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for agent metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("synth_client".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

/// Declare an IntGauge metric.
macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare an IntGaugeVec metric with labels.
macro_rules! define_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntGaugeVec> = Lazy::new(|| {
            register_int_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare a floating point GaugeVec metric with labels.
macro_rules! define_float_gauge_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<GaugeVec> = Lazy::new(|| {
            register_gauge_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

// =============================================================================
// Clock metrics
// =============================================================================

define_gauge!(
    CLOCK_OFFSET_MS,
    "time_clock_offset_ms",
    "Offset applied to local time, in milliseconds"
);
define_counter_vec!(
    CLOCK_SYNC_TOTAL,
    "clock_sync_total",
    "Clock synchronization attempts by server and outcome",
    ["server", "status"]
);

// =============================================================================
// Topology metrics
// =============================================================================

define_counter_vec!(
    PARTITION_REFRESH_TOTAL,
    "partition_refresh_total",
    "Partition refresh cycles by outcome",
    ["status"]
);
define_gauge!(
    REBALANCER_ENABLED,
    "rebalancer_enabled",
    "1 while the partition rebalancer is active, 0 once disabled"
);
define_gauge_vec!(
    PARTITION_LEADERS,
    "partition_leaders",
    "Number of monitored partitions led by each broker",
    ["broker"]
);
define_counter_vec!(
    PARTITION_REASSIGNMENTS,
    "partition_reassignments_total",
    "Partition leadership reassignments by outcome",
    ["status"]
);

// =============================================================================
// Retry metrics
// =============================================================================

define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry attempts by policy and outcome",
    ["policy", "outcome"]
);

// =============================================================================
// Latency metrics
// =============================================================================

define_float_gauge_vec!(
    E2E_LATENCY,
    "e2e_latency_ms",
    "End-to-end latency percentiles of the synthetic client",
    [
        "topic",
        "partition",
        "broker",
        "toRack",
        "fromRack",
        "viaBrokerRack",
        "quantile"
    ]
);
define_gauge_vec!(
    E2E_LATENCY_COUNT,
    "e2e_latency_ms_count",
    "End-to-end latency samples in the current window",
    [
        "topic",
        "partition",
        "broker",
        "toRack",
        "fromRack",
        "viaBrokerRack"
    ]
);
define_gauge_vec!(
    E2E_LATENCY_BUCKET,
    "e2e_latency_ms_bucket",
    "End-to-end latency samples at or below `le` ms in the current window",
    [
        "topic",
        "partition",
        "broker",
        "toRack",
        "fromRack",
        "viaBrokerRack",
        "le"
    ]
);
define_float_gauge_vec!(
    ACK_LATENCY,
    "ack_latency_ms",
    "Ack latency percentiles of the synthetic client",
    [
        "topic",
        "partition",
        "broker",
        "rack",
        "viaBrokerRack",
        "quantile"
    ]
);
define_gauge_vec!(
    ACK_LATENCY_COUNT,
    "ack_latency_ms_count",
    "Ack latency samples in the current window",
    ["topic", "partition", "broker", "rack", "viaBrokerRack"]
);
define_gauge_vec!(
    ACK_LATENCY_BUCKET,
    "ack_latency_ms_bucket",
    "Ack latency samples at or below `le` ms in the current window",
    ["topic", "partition", "broker", "rack", "viaBrokerRack", "le"]
);
define_counter_vec!(
    SAMPLES_TOTAL,
    "samples_total",
    "Latency samples by kind and outcome",
    ["kind", "outcome"]
);
define_counter_vec!(
    PRODUCED_TOTAL,
    "produced_total",
    "Synthetic records handed to the producer by outcome",
    ["status"]
);
define_gauge_vec!(
    TIME_SINCE_LAST_CONSUMPTION,
    "time_since_last_consumption_ms",
    "Milliseconds since a synthetic record was last consumed",
    ["rack"]
);

// =============================================================================
// Safe registration helpers
// =============================================================================

/// Register an IntGauge safely, returning a fallback on error.
fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

/// Register an IntGaugeVec safely, returning a fallback on error.
fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

/// Register a GaugeVec safely, returning a fallback on error.
fn register_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> GaugeVec {
    let gauge = GaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register GaugeVec metric, using unregistered fallback");
            gauge
        }
    }
}

/// Register an IntCounterVec safely, returning a fallback on error.
fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

/// Force registration of every metric so they appear in the first scrape.
pub fn init_metrics() {
    let _ = &*CLOCK_OFFSET_MS;
    let _ = &*CLOCK_SYNC_TOTAL;
    let _ = &*PARTITION_REFRESH_TOTAL;
    let _ = &*REBALANCER_ENABLED;
    let _ = &*PARTITION_LEADERS;
    let _ = &*PARTITION_REASSIGNMENTS;
    let _ = &*RETRY_ATTEMPTS;
    let _ = &*E2E_LATENCY;
    let _ = &*E2E_LATENCY_COUNT;
    let _ = &*ACK_LATENCY;
    let _ = &*ACK_LATENCY_COUNT;
    let _ = &*E2E_LATENCY_BUCKET;
    let _ = &*ACK_LATENCY_BUCKET;
    let _ = &*SAMPLES_TOTAL;
    let _ = &*PRODUCED_TOTAL;
    let _ = &*TIME_SINCE_LAST_CONSUMPTION;
}

/// Render all metrics in the Prometheus text exposition format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Gather all metric families from the registry.
pub fn gather_metrics() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

/// Record the outcome of one exchange with a time server.
pub fn record_clock_sync(server: &str, status: &str) {
    CLOCK_SYNC_TOTAL.with_label_values(&[server, status]).inc();
}

/// Publish the current clock offset.
pub fn set_clock_offset(offset_ms: i64) {
    CLOCK_OFFSET_MS.set(offset_ms);
}

/// Record the outcome of one partition refresh cycle.
pub fn record_partition_refresh(status: &str) {
    PARTITION_REFRESH_TOTAL.with_label_values(&[status]).inc();
}

/// Record the outcome of one leadership reassignment.
pub fn record_reassignment(status: &str) {
    PARTITION_REASSIGNMENTS.with_label_values(&[status]).inc();
}

/// Replace the broker leadership gauges with a fresh map.
///
/// Brokers absent from `partitions_by_broker` disappear from the export.
pub fn set_partition_leaders(partitions_by_broker: &BTreeMap<i32, Vec<i32>>) {
    PARTITION_LEADERS.reset();
    for (broker, partitions) in partitions_by_broker {
        PARTITION_LEADERS
            .with_label_values(&[broker.to_string().as_str()])
            .set(partitions.len() as i64);
    }
}

/// Count one latency sample.
///
/// `kind` is `e2e` or `ack`; `outcome` is one of `recorded`, `buffered`,
/// `ignored`, `dropped`.
pub fn record_sample(kind: &str, outcome: &str) {
    SAMPLES_TOTAL.with_label_values(&[kind, outcome]).inc();
}

/// Count one produce attempt (`success` or `failure`).
pub fn record_produced(status: &str) {
    PRODUCED_TOTAL.with_label_values(&[status]).inc();
}
