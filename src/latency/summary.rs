//! Rolling percentile summaries.
//!
//! A [`DistributionSummary`] is a ring of HDR histograms. Every sample is
//! recorded into all of them; percentiles are read from the oldest one.
//! Every `expiry / ring length` the oldest histogram is cleared and the
//! ring advances, so a sample stops influencing percentiles between
//! `expiry * (n - 1) / n` and `expiry` after it was recorded.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::Serialize;

use crate::constants::{HISTOGRAM_BUCKETS_MS, PUBLISHED_PERCENTILES, SUMMARY_BUFFER_LENGTH};
use crate::error::{Error, Result};

/// Histogram values are stored in thousandths of a millisecond.
const SCALE: f64 = 1000.0;
const SIGNIFICANT_DIGITS: u8 = 3;

/// Shape shared by every summary of one kind.
#[derive(Debug, Clone)]
pub struct SummaryConfig {
    min_expected_ms: f64,
    max_expected_ms: f64,
    expiry: Duration,
    buffer_length: u32,
    /// Bucket upper bounds reported in snapshots; empty when disabled.
    bucket_bounds: Vec<f64>,
    template: Histogram<u64>,
}

impl SummaryConfig {
    /// Fails if the bounds are not positive and increasing, or the expiry
    /// is zero.
    pub fn new(min_expected_ms: f64, max_expected_ms: f64, expiry: Duration) -> Result<Self> {
        if !(min_expected_ms > 0.0) || !(max_expected_ms > min_expected_ms) {
            return Err(Error::Config(format!(
                "invalid summary bounds [{}, {}]",
                min_expected_ms, max_expected_ms
            )));
        }
        if expiry.is_zero() {
            return Err(Error::Config("summary expiry must be positive".into()));
        }
        let highest = ((max_expected_ms * SCALE).ceil() as u64).max(2);
        let template = Histogram::new_with_bounds(1, highest, SIGNIFICANT_DIGITS)
            .map_err(|e| Error::Config(format!("cannot build histogram: {}", e)))?;

        Ok(Self {
            min_expected_ms,
            max_expected_ms,
            expiry,
            buffer_length: SUMMARY_BUFFER_LENGTH,
            bucket_bounds: Vec::new(),
            template,
        })
    }

    /// Report cumulative bucket counts in snapshots. The buckets are the
    /// [`HISTOGRAM_BUCKETS_MS`] bounds between the expected minimum and
    /// maximum.
    pub fn with_histogram_buckets(mut self, enabled: bool) -> Self {
        self.bucket_bounds = if enabled {
            HISTOGRAM_BUCKETS_MS
                .iter()
                .copied()
                .filter(|b| *b >= self.min_expected_ms && *b <= self.max_expected_ms)
                .collect()
        } else {
            Vec::new()
        };
        self
    }

    pub fn publishes_buckets(&self) -> bool {
        !self.bucket_bounds.is_empty()
    }

    pub fn min_expected_ms(&self) -> f64 {
        self.min_expected_ms
    }

    pub fn max_expected_ms(&self) -> f64 {
        self.max_expected_ms
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }
}

/// Point-in-time view of a summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummarySnapshot {
    /// Samples recorded since the summary was created.
    pub total_count: u64,
    /// Samples currently contributing to the percentiles.
    pub window_count: u64,
    pub window_max_ms: f64,
    pub window_mean_ms: f64,
    /// `(quantile, value in ms)` pairs, ascending by quantile.
    pub percentiles: Vec<(f64, f64)>,
    /// `(upper bound in ms, samples at or below it)`, ascending. Empty
    /// unless bucket export is enabled.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub buckets: Vec<(f64, u64)>,
    pub taken_at: DateTime<Utc>,
}

impl SummarySnapshot {
    pub fn percentile(&self, quantile: f64) -> Option<f64> {
        self.percentiles
            .iter()
            .find(|(q, _)| (*q - quantile).abs() < f64::EPSILON)
            .map(|(_, v)| *v)
    }
}

/// Decaying percentile estimator.
#[derive(Debug, Clone)]
pub struct DistributionSummary {
    config: SummaryConfig,
    ring: Vec<Histogram<u64>>,
    current: usize,
    last_rotation: Instant,
    rotate_every: Duration,
    total_count: u64,
}

impl DistributionSummary {
    pub fn new(config: &SummaryConfig, now: Instant) -> Self {
        let ring = (0..config.buffer_length)
            .map(|_| Histogram::new_from(&config.template))
            .collect();
        Self {
            rotate_every: config.expiry / config.buffer_length,
            config: config.clone(),
            ring,
            current: 0,
            last_rotation: now,
            total_count: 0,
        }
    }

    /// Record one sample, clamped to the expected bounds.
    pub fn record(&mut self, value_ms: f64, now: Instant) {
        self.rotate(now);
        let clamped = value_ms.clamp(self.config.min_expected_ms, self.config.max_expected_ms);
        let scaled = ((clamped * SCALE).round() as u64).max(1);
        for histogram in &mut self.ring {
            histogram.saturating_record(scaled);
        }
        self.total_count += 1;
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    /// Samples in the active window.
    pub fn window_count(&mut self, now: Instant) -> u64 {
        self.rotate(now);
        self.ring[self.current].len()
    }

    /// Value at `quantile` over the active window; 0 when empty.
    pub fn percentile(&mut self, quantile: f64, now: Instant) -> f64 {
        self.rotate(now);
        let histogram = &self.ring[self.current];
        if histogram.is_empty() {
            return 0.0;
        }
        histogram.value_at_quantile(quantile) as f64 / SCALE
    }

    pub fn snapshot(&mut self, now: Instant) -> SummarySnapshot {
        self.rotate(now);
        let histogram = &self.ring[self.current];
        let empty = histogram.is_empty();
        let percentiles = PUBLISHED_PERCENTILES
            .iter()
            .map(|q| {
                let value = if empty {
                    0.0
                } else {
                    histogram.value_at_quantile(*q) as f64 / SCALE
                };
                (*q, value)
            })
            .collect();
        let buckets = self
            .config
            .bucket_bounds
            .iter()
            .map(|bound| {
                let count = if empty {
                    0
                } else {
                    histogram.count_between(0, (*bound * SCALE).round() as u64)
                };
                (*bound, count)
            })
            .collect();

        SummarySnapshot {
            total_count: self.total_count,
            window_count: histogram.len(),
            window_max_ms: if empty { 0.0 } else { histogram.max() as f64 / SCALE },
            window_mean_ms: if empty { 0.0 } else { histogram.mean() / SCALE },
            percentiles,
            buckets,
            taken_at: Utc::now(),
        }
    }

    fn rotate(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_rotation);
        if elapsed < self.rotate_every || self.rotate_every.is_zero() {
            return;
        }
        let ticks = (elapsed.as_nanos() / self.rotate_every.as_nanos()) as u64;
        let len = self.ring.len() as u64;
        for _ in 0..ticks.min(len) {
            self.ring[self.current].reset();
            self.current = (self.current + 1) % self.ring.len();
        }
        self.last_rotation += self.rotate_every * ticks.min(u32::MAX as u64) as u32;
    }
}
