//! Glue between the message transport and the measurement layers.
//!
//! The transport itself (producer and consumer clients) lives outside this
//! crate. [`RecordFactory`] builds the records it sends, stamped with the
//! clock-corrected time and this agent's rack. [`SampleRecorder`] turns
//! acknowledgements and consumed records back into latency samples.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error};

use crate::clock::ClockSync;
use crate::config::SynthConfig;
use crate::constants::{RACK_HEADER, UNKNOWN};
use crate::latency::{LatencyAggregator, RecordOutcome};
use crate::metrics;

/// A synthetic record as produced and consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticRecord {
    pub key: i64,
    pub payload: Bytes,
    /// Produce time in Unix milliseconds, clock-corrected.
    pub timestamp_ms: i64,
    pub headers: Vec<(String, Bytes)>,
}

impl SyntheticRecord {
    pub fn header(&self, name: &str) -> Option<&Bytes> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Rack of the producing agent, `unknown` when absent or not UTF-8.
    pub fn rack(&self) -> &str {
        self.header(RACK_HEADER)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .unwrap_or(UNKNOWN)
    }
}

/// Builds outgoing synthetic records.
pub struct RecordFactory {
    clock: Arc<ClockSync>,
    topic: String,
    rack: Bytes,
    payload: Bytes,
    interval: Duration,
    rng: Mutex<fastrand::Rng>,
}

impl RecordFactory {
    pub fn new(config: &SynthConfig, clock: Arc<ClockSync>) -> Self {
        let rate = config.messages.messages_per_second.max(1);
        Self {
            clock,
            topic: config.topic.clone(),
            rack: Bytes::from(config.rack.clone()),
            payload: Bytes::from(vec![0u8; config.messages.message_size_bytes]),
            interval: Duration::from_secs(1) / rate,
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Pause between two records at the configured rate.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_record(&self) -> SyntheticRecord {
        let key = self.rng.lock().unwrap_or_else(|e| e.into_inner()).i64(..);
        SyntheticRecord {
            key,
            payload: self.payload.clone(),
            timestamp_ms: self.clock.current_time_millis(),
            headers: vec![(RACK_HEADER.to_string(), self.rack.clone())],
        }
    }
}

/// Feeds transport callbacks into the [`LatencyAggregator`].
pub struct SampleRecorder {
    clock: Arc<ClockSync>,
    aggregator: Arc<LatencyAggregator>,
}

impl SampleRecorder {
    pub fn new(clock: Arc<ClockSync>, aggregator: Arc<LatencyAggregator>) -> Self {
        Self { clock, aggregator }
    }

    /// A record was consumed from `topic`/`partition`.
    pub fn on_consumed(&self, topic: &str, partition: i32, record: &SyntheticRecord) -> RecordOutcome {
        let latency_ms = self.clock.current_time_millis() - record.timestamp_ms;
        self.aggregator.record_consumption_time();
        self.aggregator
            .record_end_to_end_latency(topic, partition, latency_ms, record.rack())
    }

    /// The cluster acknowledged a record sent at `sent_at`.
    pub fn on_acknowledged(&self, topic: &str, partition: i32, sent_at: Instant) -> RecordOutcome {
        metrics::record_produced("success");
        let elapsed = sent_at.elapsed();
        debug!(topic, partition, elapsed_ms = elapsed.as_millis() as u64, "Record acknowledged");
        self.aggregator.record_ack_latency(topic, partition, elapsed)
    }

    /// Sending a record failed.
    pub fn on_produce_failed(&self, topic: &str, error: &dyn std::error::Error) {
        metrics::record_produced("failure");
        error!(topic, error = %error, "Failed to send synthetic record");
    }
}
