//! # Synthwatch
//! Synthetic latency monitoring agent for Kafka-compatible clusters.
//!
//! The agent produces small synthetic records to a dedicated topic and
//! consumes them back, measuring two latencies per partition:
//!
//! - **ack latency**: from handing a record to the producer until the
//!   cluster acknowledges it
//! - **end-to-end latency**: from the record's produce timestamp until a
//!   consumer in any rack reads it
//!
//! To make both numbers meaningful across hosts and across every broker it:
//!
//! - keeps the local clock corrected against a pool of SNTP servers
//!   ([`clock`])
//! - grows the topic and moves partition leadership until every broker
//!   leads at least one partition ([`cluster`])
//! - aggregates samples into decaying percentile summaries tagged with the
//!   leading broker and the racks involved ([`latency`])
//!
//! ## Getting started
//! The message transport stays with the embedding application. It
//! implements [`ClusterAdmin`](cluster::ClusterAdmin) and
//! [`ProducerLifecycle`](cluster::ProducerLifecycle), then drives the
//! producer and consumer loops through the agent's record factory and
//! sample recorder:
//!
//! ```rust,ignore
//! use synthwatch::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_logging(LogFormat::from_env())?;
//!     let config = SynthConfig::from_env()?;
//!     let mut agent = SynthAgent::new(config, my_admin(), my_producer())?;
//!     agent.start();
//!
//!     let factory = agent.record_factory().clone();
//!     let recorder = agent.sample_recorder().clone();
//!     // send factory.next_record() every factory.interval(), report
//!     // acknowledgements and consumed records to the recorder
//!
//!     tokio::signal::ctrl_c().await?;
//!     agent.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! Metrics are exposed in Prometheus text format by
//! [`metrics::encode_metrics`].

#![forbid(unsafe_code)]

pub mod agent;
pub mod background_tasks;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod constants;
pub mod error;
pub mod latency;
pub mod metrics;
pub mod retry;
pub mod sampler;
pub mod telemetry;

pub use error::{Error, Result};

pub mod prelude {
    //! Commonly used types.
    pub use crate::agent::SynthAgent;
    pub use crate::clock::{ClockSync, SyncOutcome};
    pub use crate::cluster::{
        BrokerNode, ClusterAdmin, PartitionInfo, ProducerLifecycle, RebalanceEngine,
        RefreshOutcome, TopicDescription, TopologyTracker,
    };
    pub use crate::config::SynthConfig;
    pub use crate::error::{Error, Result};
    pub use crate::latency::{LatencyAggregator, RecordOutcome};
    pub use crate::sampler::{RecordFactory, SampleRecorder, SyntheticRecord};
    pub use crate::telemetry::{LogFormat, init_logging};

    pub use bytes;
}
