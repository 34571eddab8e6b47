//! Prometheus metrics for the broker.
//!
//! Metrics cover:
//! - Produce/fetch throughput and latency
//! - Segment rolls and retention
//! - Replication traffic, forwarder drops and follower catch-up
//! - Raft state and proposal backpressure
//! - Gossip membership and controller decisions
//!
//! All metrics are registered to a custom registry with the "ledgerline" prefix.
//! Registration errors are logged and the metric is used unregistered rather
//! than panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Registry, TextEncoder, opts,
};
use tracing::warn;

use super::raft::RaftNodeId;

/// Custom Prometheus registry for broker metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("ledgerline".to_string()), None).unwrap_or_else(|_| Registry::new())
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

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounter metric (no labels).
macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare a HistogramVec metric with labels and buckets.
macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Client path
// =============================================================================

define_counter_vec!(
    PRODUCE_REQUESTS,
    "produce_requests_total",
    "Produce calls by outcome",
    ["status"]
);
define_histogram_vec!(
    PRODUCE_DURATION,
    "produce_duration_seconds",
    "Produce latency by ack policy",
    ["ack_policy"],
    [0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]
);
define_counter!(BYTES_PRODUCED, "bytes_produced_total", "Payload bytes appended by leaders");
define_counter_vec!(
    FETCH_REQUESTS,
    "fetch_requests_total",
    "Fetch calls by outcome",
    ["status"]
);
define_counter!(BYTES_FETCHED, "bytes_fetched_total", "Payload bytes returned by fetches");

// =============================================================================
// Storage
// =============================================================================

define_counter!(SEGMENT_ROLLS, "segment_rolls_total", "Segments rolled by size or age");
define_counter!(
    RETENTION_DELETED_SEGMENTS,
    "retention_deleted_segments_total",
    "Segments removed by retention"
);
define_counter!(
    PARTITION_STORAGE_FAILURES,
    "partition_storage_failures_total",
    "Partitions marked unavailable after a fatal storage error"
);

// =============================================================================
// Partitions and replication
// =============================================================================

define_gauge_vec!(
    HOSTED_PARTITIONS,
    "hosted_partitions",
    "Partitions open on this broker by role",
    ["role"]
);
define_counter_vec!(
    REPLICATION_REQUESTS,
    "replication_requests_total",
    "Replication RPCs handled by kind and outcome",
    ["kind", "status"]
);
define_counter!(
    FORWARD_QUEUE_DROPS,
    "forward_queue_drops_total",
    "Records not pushed to a replica because its forward queue was full"
);
define_counter!(
    FOLLOWER_TRUNCATIONS,
    "follower_truncations_total",
    "Divergent follower suffixes truncated during catch-up"
);
define_counter!(
    FOLLOWER_RESYNCS,
    "follower_resyncs_total",
    "Full resyncs after a follower fell out of the leader's retention"
);
define_counter!(
    LEADERS_FENCED,
    "leaders_fenced_total",
    "Times a partition leader learned it was deposed"
);

// =============================================================================
// Raft
// =============================================================================

define_gauge!(
    RAFT_STATE,
    "raft_state",
    "Raft state (0=learner, 1=follower, 2=candidate, 3=leader, 4=shutdown)"
);
define_gauge!(RAFT_TERM, "raft_term", "Current Raft term");
define_gauge!(RAFT_APPLIED_INDEX, "raft_applied_index", "Last applied Raft log index");
define_gauge!(RAFT_PENDING_PROPOSALS, "raft_pending_proposals", "Proposals in flight");
define_histogram_vec!(
    RAFT_PROPOSAL_DURATION,
    "raft_proposal_duration_seconds",
    "Time from proposal to applied response",
    ["status"],
    [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
);
define_counter_vec!(
    RAFT_BACKPRESSURE_EVENTS,
    "raft_backpressure_events_total",
    "Proposal slot acquisition outcomes",
    ["outcome"]
);
define_counter_vec!(
    RAFT_FORWARDED_WRITES,
    "raft_forwarded_writes_total",
    "Writes forwarded to the Raft leader",
    ["status"]
);
define_gauge!(METADATA_VERSION, "metadata_version", "Raft index of the latest applied metadata");

// =============================================================================
// Membership and control
// =============================================================================

define_gauge_vec!(
    GOSSIP_MEMBERS,
    "gossip_members",
    "Known gossip members by state",
    ["state"]
);
define_counter_vec!(
    GOSSIP_MESSAGES,
    "gossip_messages_total",
    "Gossip packets by kind and direction",
    ["kind", "direction"]
);
define_counter!(
    GOSSIP_PROBE_FAILURES,
    "gossip_probe_failures_total",
    "Probes that got no direct or indirect ack"
);
define_counter_vec!(
    CONTROLLER_DECISIONS,
    "controller_decisions_total",
    "Metadata changes proposed by the controller",
    ["kind", "outcome"]
);
define_counter_vec!(
    RECONCILE_RUNS,
    "reconcile_runs_total",
    "Reconciliation passes by outcome",
    ["status"]
);
define_counter_vec!(
    CIRCUIT_BREAKER_TRIPS,
    "circuit_breaker_trips_total",
    "RPC circuit breakers opened",
    ["channel"]
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retries by operation and outcome",
    ["operation", "outcome"]
);

// =============================================================================
// Safe registration
// =============================================================================

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
    }
    gauge
}

fn register_int_gauge_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    if let Err(e) = registry.register(Box::new(gauge.clone())) {
        warn!(name, error = %e, "Failed to register IntGaugeVec metric, using unregistered fallback");
    }
    gauge
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
    }
    counter
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    if let Err(e) = registry.register(Box::new(counter.clone())) {
        warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
    }
    counter
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    if let Err(e) = registry.register(Box::new(histogram.clone())) {
        warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
    }
    histogram
}

/// Force registration of every metric so they appear in scrapes before first use.
pub fn init_metrics() {
    let _ = &*PRODUCE_REQUESTS;
    let _ = &*PRODUCE_DURATION;
    let _ = &*BYTES_PRODUCED;
    let _ = &*FETCH_REQUESTS;
    let _ = &*BYTES_FETCHED;
    let _ = &*SEGMENT_ROLLS;
    let _ = &*RETENTION_DELETED_SEGMENTS;
    let _ = &*PARTITION_STORAGE_FAILURES;
    let _ = &*HOSTED_PARTITIONS;
    let _ = &*REPLICATION_REQUESTS;
    let _ = &*FORWARD_QUEUE_DROPS;
    let _ = &*FOLLOWER_TRUNCATIONS;
    let _ = &*FOLLOWER_RESYNCS;
    let _ = &*LEADERS_FENCED;
    let _ = &*RAFT_STATE;
    let _ = &*RAFT_TERM;
    let _ = &*RAFT_APPLIED_INDEX;
    let _ = &*RAFT_PENDING_PROPOSALS;
    let _ = &*RAFT_PROPOSAL_DURATION;
    let _ = &*RAFT_BACKPRESSURE_EVENTS;
    let _ = &*RAFT_FORWARDED_WRITES;
    let _ = &*METADATA_VERSION;
    let _ = &*GOSSIP_MEMBERS;
    let _ = &*GOSSIP_MESSAGES;
    let _ = &*GOSSIP_PROBE_FAILURES;
    let _ = &*CONTROLLER_DECISIONS;
    let _ = &*RECONCILE_RUNS;
    let _ = &*CIRCUIT_BREAKER_TRIPS;
    let _ = &*RETRY_ATTEMPTS;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

pub fn record_produce(status: &str, ack_policy: &str, duration_secs: f64, bytes: usize) {
    PRODUCE_REQUESTS.with_label_values(&[status]).inc();
    PRODUCE_DURATION
        .with_label_values(&[ack_policy])
        .observe(duration_secs);
    if status == "success" {
        BYTES_PRODUCED.inc_by(bytes as u64);
    }
}

pub fn record_fetch(status: &str, bytes: usize) {
    FETCH_REQUESTS.with_label_values(&[status]).inc();
    BYTES_FETCHED.inc_by(bytes as u64);
}

pub fn record_replication(kind: &str, status: &str) {
    REPLICATION_REQUESTS.with_label_values(&[kind, status]).inc();
}

pub fn record_raft_proposal(status: &str, duration_secs: f64) {
    RAFT_PROPOSAL_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
}

pub fn record_raft_backpressure(outcome: &str) {
    RAFT_BACKPRESSURE_EVENTS.with_label_values(&[outcome]).inc();
}

pub fn set_raft_pending_proposals(count: usize) {
    RAFT_PENDING_PROPOSALS.set(count as i64);
}

/// Copy the interesting parts of openraft's metrics into gauges.
pub fn update_raft_metrics(metrics: &openraft::RaftMetrics<RaftNodeId, openraft::BasicNode>) {
    let state = match metrics.state {
        openraft::ServerState::Learner => 0,
        openraft::ServerState::Follower => 1,
        openraft::ServerState::Candidate => 2,
        openraft::ServerState::Leader => 3,
        openraft::ServerState::Shutdown => 4,
    };
    RAFT_STATE.set(state);
    RAFT_TERM.set(metrics.current_term as i64);
    RAFT_APPLIED_INDEX.set(metrics.last_applied.map(|l| l.index as i64).unwrap_or(0));
}

pub fn record_controller_decision(kind: &str, outcome: &str) {
    CONTROLLER_DECISIONS.with_label_values(&[kind, outcome]).inc();
}

pub fn record_gossip_message(kind: &str, direction: &str) {
    GOSSIP_MESSAGES.with_label_values(&[kind, direction]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_prefixed_names() {
        init_metrics();
        SEGMENT_ROLLS.inc();
        record_produce("success", "leader_only", 0.001, 10);
        let text = encode_metrics().unwrap();
        assert!(text.contains("ledgerline_segment_rolls_total"));
        assert!(text.contains("ledgerline_produce_requests_total"));
    }

    #[test]
    fn test_counters_accumulate() {
        let before = FORWARD_QUEUE_DROPS.get();
        FORWARD_QUEUE_DROPS.inc();
        FORWARD_QUEUE_DROPS.inc();
        assert!(FORWARD_QUEUE_DROPS.get() >= before + 2);
    }
}
