//! Centralized protocol and configuration constants.
//!
//! # Categories
//!
//! - **Time Protocol Constants**: SNTP packet layout and epoch conversion
//! - **Scheduling Constants**: default intervals for the periodic tasks
//! - **Retry Constants**: budgets for clock sync and partition refresh
//! - **Metric Constants**: percentiles, expected value bounds, label values

use std::time::Duration;

// =============================================================================
// Time Protocol Constants (SNTP, RFC 4330)
// =============================================================================

/// Size of an SNTP packet without authenticator.
pub const NTP_PACKET_SIZE: usize = 48;

/// Default UDP port of time servers.
pub const NTP_PORT: u16 = 123;

/// First byte of a client request: LI = 0, VN = 3, Mode = 3 (client).
pub const NTP_CLIENT_MODE_V3: u8 = 0x1B;

// -----------------------------------------------------------------------------
// Timestamp field offsets
// -----------------------------------------------------------------------------
// Each timestamp is 8 bytes: 32-bit seconds since 1900-01-01 followed by a
// 32-bit binary fraction of a second, both big-endian.

/// Offset of the Reference Timestamp.
pub const NTP_REFERENCE_OFFSET: usize = 16;

/// Offset of the Originate Timestamp (client transmit time, echoed).
pub const NTP_ORIGINATE_OFFSET: usize = 24;

/// Offset of the Receive Timestamp (server receive time).
pub const NTP_RECEIVE_OFFSET: usize = 32;

/// Offset of the Transmit Timestamp (server transmit time).
pub const NTP_TRANSMIT_OFFSET: usize = 40;

/// Seconds between 1900-01-01 and 1970-01-01: 70 years with 17 leap days.
pub const NTP_UNIX_EPOCH_DELTA_SECS: u64 = (365 * 70 + 17) * 86_400;

// =============================================================================
// Scheduling Constants
// =============================================================================

/// How often the clock offset is re-synchronized.
pub const DEFAULT_CLOCK_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Upper bound for a single time-server exchange.
pub const DEFAULT_CLOCK_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

/// How often the partition topology is refreshed.
pub const DEFAULT_PARTITION_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Delay before the first partition refresh.
pub const DEFAULT_PARTITION_REFRESH_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// How often live summaries are copied into the prometheus gauges.
pub const DEFAULT_METRICS_PUBLISH_INTERVAL: Duration = Duration::from_secs(10);

/// Default time servers.
pub const DEFAULT_TIME_SERVERS: &str = "time.google.com,time.cloudflare.com";

// =============================================================================
// Retry Constants
// =============================================================================

/// Retries per clock sync cycle (in addition to the first attempt).
pub const CLOCK_SYNC_MAX_RETRIES: usize = 3;

/// Backoff ceiling for clock sync retries.
pub const CLOCK_SYNC_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Retries per partition refresh cycle (in addition to the first attempt).
pub const PARTITION_REFRESH_MAX_RETRIES: usize = 3;

/// Backoff ceiling for partition refresh retries.
pub const PARTITION_REFRESH_MAX_BACKOFF: Duration = Duration::from_secs(30);

// =============================================================================
// Metric Constants
// =============================================================================

/// Percentiles published for every latency summary.
pub const PUBLISHED_PERCENTILES: [f64; 5] = [0.5, 0.8, 0.9, 0.95, 0.99];

/// Lower bound of the end-to-end latency summaries, in milliseconds.
pub const E2E_MIN_EXPECTED_LATENCY_MS: f64 = 1.0;

/// Upper bound of the end-to-end latency summaries, in milliseconds.
pub const E2E_MAX_EXPECTED_LATENCY_MS: f64 = 10_000.0;

/// Upper bounds, in milliseconds, of the exported histogram buckets. Only
/// bounds inside a summary's expected range are used.
pub const HISTOGRAM_BUCKETS_MS: [f64; 16] = [
    1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1_000.0, 2_000.0, 5_000.0, 10_000.0,
    20_000.0, 30_000.0, 60_000.0,
];

/// Number of rotating windows making up one summary.
pub const SUMMARY_BUFFER_LENGTH: u32 = 3;

/// Label value for a broker or rack that could not be resolved.
pub const UNKNOWN: &str = "unknown";

/// Name of the record header carrying the producer's rack.
pub const RACK_HEADER: &str = "rack";
