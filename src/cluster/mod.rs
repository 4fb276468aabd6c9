//! Cluster-facing side of the agent.
//!
//! The agent needs leadership of its topic spread over every broker so the
//! synthetic traffic exercises all of them:
//!
//! ```text
//!   ┌──────────────┐  admin calls   ┌──────────────────┐
//!   │ ClusterAdmin │ ◄───────────── │ RebalanceEngine  │
//!   └──────────────┘                └────────┬─────────┘
//!                                            │ replace()
//!                                            ▼
//!                                   ┌──────────────────┐  broker / rack
//!                                   │ TopologyTracker  │ ──────────────► latency tags
//!                                   └──────────────────┘
//! ```
//!
//! - [`admin`]: the traits the embedding application implements
//! - [`topology`]: the latest leadership view, swapped atomically
//! - [`rebalancer`]: partition growth and greedy leadership moves

pub mod admin;
pub mod rebalancer;
pub mod topology;

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock_admin;

pub use admin::{BrokerNode, ClusterAdmin, PartitionInfo, ProducerLifecycle, TopicDescription};
#[cfg(any(test, feature = "test-utilities"))]
pub use mock_admin::{AdminOp, MockClusterAdmin, MockProducer};
pub use rebalancer::{
    RebalanceConfig, RebalanceEngine, RefreshOutcome, RefreshReport, gen_reassignment,
    group_leaders,
};
pub use topology::{TopologySnapshot, TopologyTracker};
