//! Clock synchronization against a pool of SNTP servers.
//!
//! [`ClockSync`] keeps a single signed millisecond offset. Every timestamp
//! the agent produces, and every consumption time it compares against, is
//! `local wall clock + offset`, so latency numbers stay meaningful when the
//! host clock drifts.
//!
//! A sync cycle talks to the server under the pool cursor. Transient
//! failures are retried on the same server; once the retry budget is spent
//! the cursor moves on and the previous offset stays in place.

pub mod packet;

use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::{UdpSocket, lookup_host};
use tracing::{debug, info, warn};

use crate::config::SynthConfig;
use crate::constants::{NTP_PACKET_SIZE, NTP_PORT};
use crate::error::{Error, Result};
use crate::metrics;
use crate::retry;

pub use packet::{ExchangeTimes, NtpPacket, NtpTimestamp};

/// Milliseconds since the Unix epoch according to the local clock.
pub fn system_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Ordered time servers with a rotating cursor.
#[derive(Debug, Default)]
pub struct TimeServerPool {
    servers: Vec<String>,
    cursor: AtomicUsize,
}

impl TimeServerPool {
    pub fn new(servers: Vec<String>) -> Self {
        Self {
            servers,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// The server under the cursor, or `None` for an empty pool.
    pub fn current(&self) -> Option<&str> {
        if self.servers.is_empty() {
            return None;
        }
        let idx = self.cursor.load(Ordering::SeqCst) % self.servers.len();
        Some(&self.servers[idx])
    }

    /// Move the cursor to the next server, wrapping around.
    pub fn advance(&self) {
        if self.servers.is_empty() {
            return;
        }
        let len = self.servers.len();
        let _ = self
            .cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some((c + 1) % len));
    }
}

/// Result of one scheduled sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The offset was replaced with the given skew.
    Synced { server: String, offset_ms: i64 },
    /// Every attempt failed; the cursor moved to the next server.
    Failed { server: String, error: Error },
    /// The pool is empty.
    NoServers,
    /// Another cycle was still running.
    Skipped,
}

/// Maintains the process-wide clock offset.
pub struct ClockSync {
    offset_ms: AtomicI64,
    pool: TimeServerPool,
    timeout: Duration,
    retry_min_delay: Duration,
    in_progress: AtomicBool,
    rng: Mutex<fastrand::Rng>,
}

impl ClockSync {
    pub fn new(servers: Vec<String>, timeout: Duration) -> Self {
        Self {
            offset_ms: AtomicI64::new(0),
            pool: TimeServerPool::new(servers),
            timeout,
            retry_min_delay: Duration::from_secs(1),
            in_progress: AtomicBool::new(false),
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    pub fn from_config(config: &SynthConfig) -> Self {
        Self::new(config.time_servers.clone(), config.clock_sync_timeout)
    }

    /// Override the first retry delay. Useful for tests.
    pub fn with_retry_min_delay(mut self, delay: Duration) -> Self {
        self.retry_min_delay = delay;
        self
    }

    /// Local wall clock corrected by the current offset.
    pub fn current_time_millis(&self) -> i64 {
        system_time_millis() + self.offset_ms()
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::SeqCst)
    }

    pub fn pool(&self) -> &TimeServerPool {
        &self.pool
    }

    /// Query `server` once and replace the offset with the measured skew.
    ///
    /// `server` is `host` or `host:port`; the port defaults to 123. On any
    /// error the offset is left untouched.
    pub async fn synchronize(&self, server: &str) -> Result<i64> {
        let addr = resolve(server).await?;
        let bind_addr: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        let transmit = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            NtpTimestamp::from_unix_millis(system_time_millis()).with_random_low_bits(&mut rng)
        };
        let request = NtpPacket::client_request(transmit);
        socket.send_to(&request.encode(), addr).await?;

        let mut buf = [0u8; 2 * NTP_PACKET_SIZE];
        let len = match tokio::time::timeout(self.timeout, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => len,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(Error::Timeout(self.timeout.as_millis() as u64)),
        };
        let destination = system_time_millis();

        let reply = NtpPacket::decode(&buf[..len])?;
        reply.validate_reply(&request)?;

        let times = ExchangeTimes::from_reply(&reply, destination);
        let skew = times.skew_millis();
        self.offset_ms.store(skew, Ordering::SeqCst);
        metrics::set_clock_offset(skew);

        debug!(
            server,
            skew_ms = skew,
            round_trip_ms = times.round_trip_millis(),
            stratum = reply.stratum,
            "Clock synchronized"
        );
        Ok(skew)
    }

    /// Run one scheduled cycle against the server under the cursor.
    ///
    /// Retries the same server with [`retry::clock_sync_policy`]. After the
    /// last failure the cursor advances so the next cycle tries a different
    /// server. Overlapping calls return [`SyncOutcome::Skipped`].
    pub async fn sync_cycle(&self) -> SyncOutcome {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            debug!("Clock sync already in progress, skipping");
            return SyncOutcome::Skipped;
        }
        let outcome = self.sync_cycle_inner().await;
        self.in_progress.store(false, Ordering::SeqCst);
        outcome
    }

    async fn sync_cycle_inner(&self) -> SyncOutcome {
        let Some(server) = self.pool.current().map(str::to_string) else {
            warn!("No time servers configured, skipping clock sync");
            return SyncOutcome::NoServers;
        };

        let result = retry::with_policy(
            "clock_sync",
            retry::clock_sync_policy_with_min_delay(self.retry_min_delay),
            || async {
                let result = self.synchronize(&server).await;
                if let Err(e) = &result {
                    metrics::record_clock_sync(&server, "failure");
                    debug!(server = %server, error = %e, "Time server exchange failed");
                }
                result
            },
            Error::is_retriable,
        )
        .await;

        match result {
            Ok(offset_ms) => {
                metrics::record_clock_sync(&server, "success");
                info!(server = %server, offset_ms, "Clock offset updated");
                SyncOutcome::Synced { server, offset_ms }
            }
            Err(error) => {
                self.pool.advance();
                warn!(
                    server = %server,
                    error = %error,
                    offset_ms = self.offset_ms(),
                    next = self.pool.current().unwrap_or_default(),
                    "Clock sync failed, keeping previous offset"
                );
                SyncOutcome::Failed { server, error }
            }
        }
    }
}

async fn resolve(server: &str) -> Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = server.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, NTP_PORT));
    }
    let target = if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:{}", server, NTP_PORT)
    };
    lookup_host(&target)
        .await
        .map_err(|e| Error::Network(format!("cannot resolve {}: {}", server, e)))?
        .next()
        .ok_or_else(|| Error::Network(format!("no address for {}", server)))
}
