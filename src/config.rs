//! Agent configuration.
//!
//! [`SynthConfig`] holds everything the three periodic tasks need. It can be
//! built from defaults, from the environment via [`SynthConfig::from_env`],
//! or field by field in tests.

use std::time::Duration;

use crate::constants::{
    DEFAULT_CLOCK_SYNC_INTERVAL, DEFAULT_CLOCK_SYNC_TIMEOUT, DEFAULT_METRICS_PUBLISH_INTERVAL,
    DEFAULT_PARTITION_REFRESH_INITIAL_DELAY, DEFAULT_PARTITION_REFRESH_INTERVAL,
    DEFAULT_TIME_SERVERS, UNKNOWN,
};

/// Synthetic message settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagesConfig {
    /// Payload size of each synthetic record.
    pub message_size_bytes: usize,
    /// Production rate.
    pub messages_per_second: u32,
    /// Per-partition warm-up: this many consumed records are not recorded.
    pub ignore_first_n_messages: u64,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            message_size_bytes: 8,
            messages_per_second: 1,
            ignore_first_n_messages: 0,
        }
    }
}

/// Configuration for the synthetic monitoring agent.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthConfig {
    /// Topic used for synthetic traffic.
    pub topic: String,
    /// Rack this agent runs in.
    pub rack: String,
    /// Create the topic when it does not exist.
    pub auto_create_topic: bool,
    /// Replication factor used when creating the topic.
    pub topic_replication_factor: usize,

    /// Time servers, tried in rotation. Entries are `host` or `host:port`.
    pub time_servers: Vec<String>,
    pub clock_sync_interval: Duration,
    /// Upper bound for one request/response exchange with a time server.
    pub clock_sync_timeout: Duration,

    pub partition_refresh_interval: Duration,
    pub partition_refresh_initial_delay: Duration,

    pub messages: MessagesConfig,

    /// Number of samples held back before the first summary sees any data.
    pub min_samples_first_window: usize,
    /// Lower bound for acknowledgement latency summaries, in ms.
    pub expected_min_latency_ms: f64,
    /// Upper bound for acknowledgement latency summaries, in ms.
    pub expected_max_latency_ms: f64,
    /// How long a sample stays in a summary's percentiles.
    pub sampling_time_window: Duration,
    /// How often summaries are copied into the exported gauges.
    pub metrics_publish_interval: Duration,
    /// Also export cumulative histogram bucket counts per summary.
    pub publish_histogram_buckets: bool,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            topic: "synth-client".to_string(),
            rack: UNKNOWN.to_string(),
            auto_create_topic: true,
            topic_replication_factor: 1,
            time_servers: parse_time_servers(DEFAULT_TIME_SERVERS),
            clock_sync_interval: DEFAULT_CLOCK_SYNC_INTERVAL,
            clock_sync_timeout: DEFAULT_CLOCK_SYNC_TIMEOUT,
            partition_refresh_interval: DEFAULT_PARTITION_REFRESH_INTERVAL,
            partition_refresh_initial_delay: DEFAULT_PARTITION_REFRESH_INITIAL_DELAY,
            messages: MessagesConfig::default(),
            min_samples_first_window: 1,
            expected_min_latency_ms: 1.0,
            expected_max_latency_ms: 10_000.0,
            sampling_time_window: Duration::from_secs(60),
            metrics_publish_interval: DEFAULT_METRICS_PUBLISH_INTERVAL,
            publish_histogram_buckets: false,
        }
    }
}

/// Split a server list on commas and whitespace, dropping empty entries.
pub fn parse_time_servers(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v.to_lowercase() != "false" && v != "0")
        .unwrap_or(default)
}

fn env_parse<T>(name: &str, default: T) -> Result<T, Box<dyn std::error::Error>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => Ok(raw
            .trim()
            .parse()
            .map_err(|e| format!("Invalid {}: {}", name, e))?),
        Err(_) => Ok(default),
    }
}

impl SynthConfig {
    /// Load configuration from `SYNTH_*` environment variables.
    ///
    /// Unset variables keep their defaults. Malformed values are an error.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = Self::default();

        let topic = std::env::var("SYNTH_TOPIC").unwrap_or(defaults.topic);
        if topic.trim().is_empty() {
            return Err("SYNTH_TOPIC must not be empty".into());
        }

        let rack = std::env::var("SYNTH_RACK").unwrap_or(defaults.rack);

        let time_servers = std::env::var("SYNTH_TIME_SERVERS")
            .map(|raw| parse_time_servers(&raw))
            .unwrap_or(defaults.time_servers);

        let clock_sync_interval = Duration::from_secs(env_parse(
            "SYNTH_CLOCK_SYNC_INTERVAL_SECS",
            defaults.clock_sync_interval.as_secs(),
        )?);
        let clock_sync_timeout = Duration::from_millis(env_parse(
            "SYNTH_CLOCK_SYNC_TIMEOUT_MS",
            defaults.clock_sync_timeout.as_millis() as u64,
        )?);
        let partition_refresh_interval = Duration::from_secs(env_parse(
            "SYNTH_PARTITION_REFRESH_INTERVAL_SECS",
            defaults.partition_refresh_interval.as_secs(),
        )?);
        let partition_refresh_initial_delay = Duration::from_secs(env_parse(
            "SYNTH_PARTITION_REFRESH_DELAY_SECS",
            defaults.partition_refresh_initial_delay.as_secs(),
        )?);

        let messages = MessagesConfig {
            message_size_bytes: env_parse(
                "SYNTH_MESSAGE_SIZE_BYTES",
                defaults.messages.message_size_bytes,
            )?,
            messages_per_second: env_parse(
                "SYNTH_MESSAGES_PER_SECOND",
                defaults.messages.messages_per_second,
            )?,
            ignore_first_n_messages: env_parse(
                "SYNTH_IGNORE_FIRST_N_MESSAGES",
                defaults.messages.ignore_first_n_messages,
            )?,
        };

        Ok(Self {
            topic,
            rack,
            auto_create_topic: env_bool("SYNTH_AUTO_CREATE_TOPIC", defaults.auto_create_topic),
            topic_replication_factor: env_parse(
                "SYNTH_TOPIC_REPLICATION_FACTOR",
                defaults.topic_replication_factor,
            )?,
            time_servers,
            clock_sync_interval,
            clock_sync_timeout,
            partition_refresh_interval,
            partition_refresh_initial_delay,
            messages,
            min_samples_first_window: env_parse(
                "SYNTH_MIN_SAMPLES_FIRST_WINDOW",
                defaults.min_samples_first_window,
            )?,
            expected_min_latency_ms: env_parse(
                "SYNTH_EXPECTED_MIN_LATENCY_MS",
                defaults.expected_min_latency_ms,
            )?,
            expected_max_latency_ms: env_parse(
                "SYNTH_EXPECTED_MAX_LATENCY_MS",
                defaults.expected_max_latency_ms,
            )?,
            sampling_time_window: Duration::from_secs(env_parse(
                "SYNTH_SAMPLING_TIME_WINDOW_SECS",
                defaults.sampling_time_window.as_secs(),
            )?),
            metrics_publish_interval: Duration::from_secs(env_parse(
                "SYNTH_METRICS_PUBLISH_INTERVAL_SECS",
                defaults.metrics_publish_interval.as_secs(),
            )?),
            publish_histogram_buckets: env_bool(
                "SYNTH_PUBLISH_HISTOGRAM_BUCKETS",
                defaults.publish_histogram_buckets,
            ),
        })
    }

    /// Check cross-field constraints. Returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.topic.trim().is_empty() {
            errors.push("topic must not be empty".to_string());
        }
        if self.topic_replication_factor == 0 {
            errors.push("topic_replication_factor must be at least 1".to_string());
        }
        if self.clock_sync_interval.is_zero() {
            errors.push("clock_sync_interval must be greater than zero".to_string());
        }
        if self.clock_sync_timeout.is_zero() {
            errors.push("clock_sync_timeout must be greater than zero".to_string());
        }
        if self.clock_sync_timeout >= self.clock_sync_interval {
            errors.push(format!(
                "clock_sync_timeout ({:?}) must be less than clock_sync_interval ({:?})",
                self.clock_sync_timeout, self.clock_sync_interval
            ));
        }
        if self.partition_refresh_interval.is_zero() {
            errors.push("partition_refresh_interval must be greater than zero".to_string());
        }
        if self.messages.messages_per_second == 0 {
            errors.push("messages.messages_per_second must be at least 1".to_string());
        }
        if !(self.expected_min_latency_ms > 0.0) {
            errors.push(format!(
                "expected_min_latency_ms ({}) must be positive",
                self.expected_min_latency_ms
            ));
        }
        if self.expected_max_latency_ms <= self.expected_min_latency_ms {
            errors.push(format!(
                "expected_max_latency_ms ({}) must exceed expected_min_latency_ms ({})",
                self.expected_max_latency_ms, self.expected_min_latency_ms
            ));
        }
        if self.sampling_time_window.is_zero() {
            errors.push("sampling_time_window must be greater than zero".to_string());
        }
        if self.metrics_publish_interval.is_zero() {
            errors.push("metrics_publish_interval must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
