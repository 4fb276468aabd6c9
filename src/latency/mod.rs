//! Latency sample aggregation.
//!
//! The [`LatencyAggregator`] turns raw end-to-end and acknowledgement
//! latencies into per-dimension [`DistributionSummary`]s:
//!
//! 1. Samples are dropped until the first partition refresh completed, so
//!    nothing is attributed to a broker the agent has not discovered yet.
//! 2. The broker leading the partition is resolved from the current
//!    topology snapshot while the aggregator lock is held, so samples see
//!    topology changes in lock order. When the broker differs from the one
//!    a summary was created for, that summary is retired and a new one
//!    takes its place.
//! 3. End-to-end samples of the first `ignore_first_n_messages` records per
//!    partition are discarded.
//! 4. The first `min_samples_first_window` accepted samples of each kind are
//!    held back and released together, each into the summary of its own
//!    key. A held sample whose leader changed in the meantime is discarded
//!    rather than attributed to the new broker.
//!
//! All state sits behind one mutex; no network call happens while it is
//! held.

pub mod summary;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use prometheus::{GaugeVec, IntGaugeVec};
use serde::Serialize;
use tracing::{debug, info};

use crate::cluster::TopologyTracker;
use crate::config::SynthConfig;
use crate::constants::{
    E2E_MAX_EXPECTED_LATENCY_MS, E2E_MIN_EXPECTED_LATENCY_MS, HISTOGRAM_BUCKETS_MS,
    PUBLISHED_PERCENTILES, UNKNOWN,
};
use crate::error::Result;
use crate::metrics;

pub use summary::{DistributionSummary, SummaryConfig, SummarySnapshot};

/// Configuration for the aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Rack of this agent; the `toRack` of end-to-end and the `rack` of ack
    /// summaries.
    pub local_rack: String,
    pub ignore_first_n_messages: u64,
    pub min_samples_first_window: usize,
    pub e2e: SummaryConfig,
    pub ack: SummaryConfig,
}

impl AggregatorConfig {
    pub fn from_config(config: &SynthConfig) -> Result<Self> {
        Ok(Self {
            local_rack: config.rack.clone(),
            ignore_first_n_messages: config.messages.ignore_first_n_messages,
            min_samples_first_window: config.min_samples_first_window,
            e2e: SummaryConfig::new(
                E2E_MIN_EXPECTED_LATENCY_MS,
                E2E_MAX_EXPECTED_LATENCY_MS,
                config.sampling_time_window,
            )?
            .with_histogram_buckets(config.publish_histogram_buckets),
            ack: SummaryConfig::new(
                config.expected_min_latency_ms,
                config.expected_max_latency_ms,
                config.sampling_time_window,
            )?
            .with_histogram_buckets(config.publish_histogram_buckets),
        })
    }
}

/// Identity of an end-to-end summary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct E2eKey {
    pub topic: String,
    pub partition: i32,
    pub from_rack: String,
}

/// Identity of an acknowledgement summary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckKey {
    pub topic: String,
    pub partition: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyKind {
    E2e,
    Ack,
}

impl LatencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LatencyKind::E2e => "e2e",
            LatencyKind::Ack => "ack",
        }
    }
}

/// Labels a summary is exported with. Fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryTags {
    pub kind: LatencyKind,
    pub topic: String,
    pub partition: i32,
    pub broker: String,
    /// Rack of this agent.
    pub local_rack: String,
    /// Rack of the producing agent; end-to-end only.
    pub from_rack: Option<String>,
    /// Rack of the leading broker.
    pub via_broker_rack: String,
}

impl SummaryTags {
    /// Label values in the order of the exported gauge families.
    fn label_values(&self) -> Vec<String> {
        let mut values = vec![
            self.topic.clone(),
            self.partition.to_string(),
            self.broker.clone(),
            self.local_rack.clone(),
        ];
        if let Some(from_rack) = &self.from_rack {
            values.push(from_rack.clone());
        }
        values.push(self.via_broker_rack.clone());
        values
    }

    fn families(&self) -> (&'static GaugeVec, &'static IntGaugeVec, &'static IntGaugeVec) {
        match self.kind {
            LatencyKind::E2e => (
                &*metrics::E2E_LATENCY,
                &*metrics::E2E_LATENCY_COUNT,
                &*metrics::E2E_LATENCY_BUCKET,
            ),
            LatencyKind::Ack => (
                &*metrics::ACK_LATENCY,
                &*metrics::ACK_LATENCY_COUNT,
                &*metrics::ACK_LATENCY_BUCKET,
            ),
        }
    }

    fn publish(&self, snapshot: &SummarySnapshot) {
        let mut labels = self.label_values();
        let (percentiles, count, buckets) = self.families();
        {
            let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
            count
                .with_label_values(&refs)
                .set(snapshot.window_count as i64);
        }
        for (quantile, value) in &snapshot.percentiles {
            labels.push(quantile.to_string());
            let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
            percentiles.with_label_values(&refs).set(*value);
            labels.pop();
        }
        if snapshot.buckets.is_empty() {
            return;
        }
        for (bound, samples) in &snapshot.buckets {
            labels.push(bound.to_string());
            let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
            buckets.with_label_values(&refs).set(*samples as i64);
            labels.pop();
        }
        labels.push("+Inf".to_string());
        let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
        buckets
            .with_label_values(&refs)
            .set(snapshot.window_count as i64);
    }

    /// Remove every exported series of this summary.
    fn unpublish(&self) {
        let mut labels = self.label_values();
        let (percentiles, count, buckets) = self.families();
        {
            let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
            let _ = count.remove_label_values(&refs);
        }
        for quantile in PUBLISHED_PERCENTILES {
            labels.push(quantile.to_string());
            let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
            let _ = percentiles.remove_label_values(&refs);
            labels.pop();
        }
        let bounds = HISTOGRAM_BUCKETS_MS
            .iter()
            .map(f64::to_string)
            .chain(std::iter::once("+Inf".to_string()));
        for bound in bounds {
            labels.push(bound);
            let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
            let _ = buckets.remove_label_values(&refs);
            labels.pop();
        }
    }
}

/// A summary bound to the broker it was created for.
#[derive(Debug)]
struct TaggedSummary {
    tags: SummaryTags,
    summary: DistributionSummary,
}

/// Snapshot of one live summary together with its labels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelledSnapshot {
    pub tags: SummaryTags,
    pub snapshot: SummarySnapshot,
}

/// What happened to a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Dropped: the first partition refresh has not finished.
    TopologyPending,
    /// Dropped: part of the per-partition warm-up.
    Ignored { seen: u64 },
    /// Held back in the initial buffer.
    Buffered { held: usize },
    /// This sample completed the initial buffer; that many samples were
    /// released into their summaries. Samples buffered under a previous
    /// leader are not counted.
    Flushed(usize),
    /// Recorded directly.
    Recorded,
}

/// A held sample: key, broker it was resolved to, value.
type HeldSample<K> = (K, String, f64);

enum BufferDecision<K> {
    Pass,
    Held(usize),
    Flush(Vec<HeldSample<K>>),
}

/// Samples held back until the first window has enough data.
#[derive(Debug)]
struct InitialBuffer<K> {
    capacity: usize,
    samples: Vec<HeldSample<K>>,
    flushed: bool,
}

impl<K> InitialBuffer<K> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: Vec::with_capacity(capacity),
            flushed: capacity == 0,
        }
    }

    fn offer(&mut self, key: K, broker: &str, value: f64) -> BufferDecision<K> {
        if self.flushed {
            return BufferDecision::Pass;
        }
        self.samples.push((key, broker.to_string(), value));
        if self.samples.len() < self.capacity {
            return BufferDecision::Held(self.samples.len());
        }
        self.flushed = true;
        BufferDecision::Flush(std::mem::take(&mut self.samples))
    }
}

struct AggregatorState {
    e2e: HashMap<E2eKey, TaggedSummary>,
    ack: HashMap<AckKey, TaggedSummary>,
    consumed_per_partition: HashMap<(String, i32), u64>,
    e2e_buffer: InitialBuffer<E2eKey>,
    ack_buffer: InitialBuffer<AckKey>,
}

/// Records latency samples into per-dimension summaries.
pub struct LatencyAggregator {
    config: AggregatorConfig,
    topology: Arc<TopologyTracker>,
    state: Mutex<AggregatorState>,
    origin: Instant,
    /// Milliseconds after `origin` of the latest consumption.
    last_consumption_ms: AtomicU64,
}

/// Where a new sample goes once the broker is resolved.
struct Resolution {
    broker: String,
    leader_rack: String,
}

impl LatencyAggregator {
    pub fn new(config: AggregatorConfig, topology: Arc<TopologyTracker>) -> Self {
        let state = AggregatorState {
            e2e: HashMap::new(),
            ack: HashMap::new(),
            consumed_per_partition: HashMap::new(),
            e2e_buffer: InitialBuffer::new(config.min_samples_first_window),
            ack_buffer: InitialBuffer::new(config.min_samples_first_window),
        };
        Self {
            config,
            topology,
            state: Mutex::new(state),
            origin: Instant::now(),
            last_consumption_ms: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Leader of `partition` in the current snapshot. Callers hold the state
    /// lock.
    fn resolve(&self, partition: i32) -> Resolution {
        let snapshot = self.topology.snapshot();
        Resolution {
            broker: snapshot
                .broker_for_partition(partition)
                .map(|b| b.to_string())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            leader_rack: snapshot.rack_of_partition_leader(partition).to_string(),
        }
    }

    /// Record an end-to-end latency measured by the consumer.
    pub fn record_end_to_end_latency(
        &self,
        topic: &str,
        partition: i32,
        latency_ms: i64,
        from_rack: &str,
    ) -> RecordOutcome {
        self.record_end_to_end_latency_at(topic, partition, latency_ms, from_rack, Instant::now())
    }

    pub fn record_end_to_end_latency_at(
        &self,
        topic: &str,
        partition: i32,
        latency_ms: i64,
        from_rack: &str,
        now: Instant,
    ) -> RecordOutcome {
        let kind = LatencyKind::E2e;
        debug!(topic, partition, latency_ms, "End-to-end latency sample");
        if self.topology.is_initial_refresh_pending() {
            info!("Ignoring latency as the initial partition assignment is not done yet");
            metrics::record_sample(kind.as_str(), "dropped");
            return RecordOutcome::TopologyPending;
        }
        let mut state = self.lock();
        let resolution = self.resolve(partition);

        let seen = {
            let counter = state
                .consumed_per_partition
                .entry((topic.to_string(), partition))
                .or_insert(0);
            let seen = *counter;
            *counter = seen.saturating_add(1).max(1);
            seen
        };
        if seen < self.config.ignore_first_n_messages {
            debug!(
                partition,
                seen,
                threshold = self.config.ignore_first_n_messages,
                "Ignoring latency during partition warm-up"
            );
            metrics::record_sample(kind.as_str(), "ignored");
            return RecordOutcome::Ignored { seen };
        }

        let key = E2eKey {
            topic: topic.to_string(),
            partition,
            from_rack: from_rack.to_string(),
        };
        let tags = SummaryTags {
            kind,
            topic: topic.to_string(),
            partition,
            broker: resolution.broker.clone(),
            local_rack: self.config.local_rack.clone(),
            from_rack: Some(from_rack.to_string()),
            via_broker_rack: resolution.leader_rack,
        };
        ensure_summary(&mut state.e2e, key.clone(), tags, &self.config.e2e, now);

        let value = latency_ms as f64;
        let decision = state.e2e_buffer.offer(key.clone(), &resolution.broker, value);
        let outcome = apply(&mut state.e2e, key, value, decision, now);
        if let RecordOutcome::Flushed(n) = outcome {
            info!(samples = n, "Initial e2e latencies recorded");
        }
        metrics::record_sample(kind.as_str(), outcome_label(&outcome));
        outcome
    }

    /// Record the time between producing a record and its acknowledgement.
    pub fn record_ack_latency(&self, topic: &str, partition: i32, elapsed: Duration) -> RecordOutcome {
        self.record_ack_latency_at(topic, partition, elapsed, Instant::now())
    }

    pub fn record_ack_latency_at(
        &self,
        topic: &str,
        partition: i32,
        elapsed: Duration,
        now: Instant,
    ) -> RecordOutcome {
        let kind = LatencyKind::Ack;
        let value = elapsed.as_secs_f64() * 1000.0;
        debug!(topic, partition, latency_ms = value, "Ack latency sample");
        if self.topology.is_initial_refresh_pending() {
            info!("Ignoring ack latency as the initial partition assignment is not done yet");
            metrics::record_sample(kind.as_str(), "dropped");
            return RecordOutcome::TopologyPending;
        }
        let mut state = self.lock();
        let resolution = self.resolve(partition);
        let key = AckKey {
            topic: topic.to_string(),
            partition,
        };
        let tags = SummaryTags {
            kind,
            topic: topic.to_string(),
            partition,
            broker: resolution.broker.clone(),
            local_rack: self.config.local_rack.clone(),
            from_rack: None,
            via_broker_rack: resolution.leader_rack,
        };
        ensure_summary(&mut state.ack, key.clone(), tags, &self.config.ack, now);

        let decision = state.ack_buffer.offer(key.clone(), &resolution.broker, value);
        let outcome = apply(&mut state.ack, key, value, decision, now);
        if let RecordOutcome::Flushed(n) = outcome {
            info!(samples = n, "Initial ack latencies recorded");
        }
        metrics::record_sample(kind.as_str(), outcome_label(&outcome));
        outcome
    }

    /// Note that a synthetic record was just consumed. Never moves backwards.
    pub fn record_consumption_time(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_consumption_ms.fetch_max(elapsed, Ordering::SeqCst);
    }

    /// Milliseconds since the last consumption, or since start-up if nothing
    /// was consumed yet.
    pub fn millis_since_last_consumption(&self) -> u64 {
        let now = self.origin.elapsed().as_millis() as u64;
        now.saturating_sub(self.last_consumption_ms.load(Ordering::SeqCst))
    }

    pub fn e2e_snapshots(&self) -> Vec<LabelledSnapshot> {
        self.e2e_snapshots_at(Instant::now())
    }

    pub fn e2e_snapshots_at(&self, now: Instant) -> Vec<LabelledSnapshot> {
        collect_snapshots(self.lock().e2e.values_mut(), now)
    }

    pub fn ack_snapshots(&self) -> Vec<LabelledSnapshot> {
        self.ack_snapshots_at(Instant::now())
    }

    pub fn ack_snapshots_at(&self, now: Instant) -> Vec<LabelledSnapshot> {
        collect_snapshots(self.lock().ack.values_mut(), now)
    }

    /// Snapshot of the end-to-end summary for `(topic, partition, from_rack)`.
    pub fn e2e_snapshot_at(
        &self,
        topic: &str,
        partition: i32,
        from_rack: &str,
        now: Instant,
    ) -> Option<LabelledSnapshot> {
        let key = E2eKey {
            topic: topic.to_string(),
            partition,
            from_rack: from_rack.to_string(),
        };
        self.lock().e2e.get_mut(&key).map(|t| LabelledSnapshot {
            tags: t.tags.clone(),
            snapshot: t.summary.snapshot(now),
        })
    }

    /// Snapshot of the acknowledgement summary for `(topic, partition)`.
    pub fn ack_snapshot_at(
        &self,
        topic: &str,
        partition: i32,
        now: Instant,
    ) -> Option<LabelledSnapshot> {
        let key = AckKey {
            topic: topic.to_string(),
            partition,
        };
        self.lock().ack.get_mut(&key).map(|t| LabelledSnapshot {
            tags: t.tags.clone(),
            snapshot: t.summary.snapshot(now),
        })
    }

    /// Copy every live summary into the exported gauges.
    pub fn publish_metrics(&self) {
        let now = Instant::now();
        for labelled in self.e2e_snapshots_at(now).iter().chain(&self.ack_snapshots_at(now)) {
            labelled.tags.publish(&labelled.snapshot);
        }
        metrics::TIME_SINCE_LAST_CONSUMPTION
            .with_label_values(&[self.config.local_rack.as_str()])
            .set(self.millis_since_last_consumption() as i64);
    }
}

/// Make sure `key` maps to a summary tagged with the broker in `tags`.
/// A summary for a different broker is retired and replaced.
fn ensure_summary<K>(
    summaries: &mut HashMap<K, TaggedSummary>,
    key: K,
    tags: SummaryTags,
    config: &SummaryConfig,
    now: Instant,
) where
    K: std::hash::Hash + Eq,
{
    if let Some(existing) = summaries.get(&key) {
        if existing.tags.broker == tags.broker {
            return;
        }
        info!(
            kind = tags.kind.as_str(),
            partition = tags.partition,
            from = %existing.tags.broker,
            to = %tags.broker,
            "Partition leader changed, recreating latency summary"
        );
        existing.tags.unpublish();
    }
    summaries.insert(
        key,
        TaggedSummary {
            tags,
            summary: DistributionSummary::new(config, now),
        },
    );
}

fn apply<K>(
    summaries: &mut HashMap<K, TaggedSummary>,
    key: K,
    value: f64,
    decision: BufferDecision<K>,
    now: Instant,
) -> RecordOutcome
where
    K: std::hash::Hash + Eq,
{
    match decision {
        BufferDecision::Held(held) => RecordOutcome::Buffered { held },
        BufferDecision::Flush(samples) => {
            let mut count = 0;
            for (sample_key, broker, sample) in samples {
                let Some(tagged) = summaries.get_mut(&sample_key) else {
                    continue;
                };
                if tagged.tags.broker != broker {
                    debug!(
                        kind = tagged.tags.kind.as_str(),
                        partition = tagged.tags.partition,
                        held_for = %broker,
                        leader = %tagged.tags.broker,
                        "Discarding buffered sample from previous leader"
                    );
                    metrics::record_sample(tagged.tags.kind.as_str(), "stale");
                    continue;
                }
                tagged.summary.record(sample, now);
                count += 1;
            }
            RecordOutcome::Flushed(count)
        }
        BufferDecision::Pass => {
            if let Some(tagged) = summaries.get_mut(&key) {
                tagged.summary.record(value, now);
            }
            RecordOutcome::Recorded
        }
    }
}

fn collect_snapshots<'a>(
    summaries: impl Iterator<Item = &'a mut TaggedSummary>,
    now: Instant,
) -> Vec<LabelledSnapshot> {
    summaries
        .map(|t| LabelledSnapshot {
            tags: t.tags.clone(),
            snapshot: t.summary.snapshot(now),
        })
        .collect()
}

fn outcome_label(outcome: &RecordOutcome) -> &'static str {
    match outcome {
        RecordOutcome::TopologyPending => "dropped",
        RecordOutcome::Ignored { .. } => "ignored",
        RecordOutcome::Buffered { .. } => "buffered",
        RecordOutcome::Flushed(_) | RecordOutcome::Recorded => "recorded",
    }
}
