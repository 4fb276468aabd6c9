//! Crate level errors.
//!
//! Every fallible operation in the agent returns [`Result`]. Errors fall in
//! two groups:
//!
//! - **Transient**: network hiccups, time-server timeouts, malformed
//!   replies, admin calls that failed mid-flight. These are retried with
//!   the policies in [`crate::retry`].
//! - **Permanent**: invalid configuration, too few brokers to satisfy the
//!   replication factor. Retrying does not help.
//!
//! None of these terminate the process. The periodic tasks log the error
//! and fall back (keep the old clock offset, disable the rebalancer).

use std::{io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Errors produced by clock synchronization, cluster administration and
/// configuration loading.
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum Error {
    /// Socket level failure (unreachable host, refused, reset).
    #[error("Network error: {0}")]
    Network(String),

    /// The remote end did not answer within the configured timeout.
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// A reply could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The cluster admin interface rejected or failed a request.
    #[error("Admin error: {0}")]
    Admin(String),

    /// The monitored topic does not exist.
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// The topic was created concurrently by someone else.
    #[error("Topic already exists: {0}")]
    TopicAlreadyExists(String),

    /// Not enough brokers to build a replica set of the required size.
    #[error("Need {required} brokers for replica set, only {available} available")]
    InsufficientBrokers { required: usize, available: usize },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether a retry of the same operation may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::Timeout(_)
                | Error::Protocol(_)
                | Error::Admin(_)
                | Error::TopicNotFound(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout(0),
            _ => Error::Network(e.to_string()),
        }
    }
}

impl From<Box<dyn std::error::Error>> for Error {
    fn from(e: Box<dyn std::error::Error>) -> Self {
        Error::Config(e.to_string())
    }
}
