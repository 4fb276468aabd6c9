//! Cluster admin and producer lifecycle traits.
//!
//! These traits abstract the parts of the log cluster the agent drives,
//! allowing for:
//! - A real admin client in production
//! - The in-memory [`MockClusterAdmin`](super::MockClusterAdmin) in tests
//!
//! # Trait Hierarchy
//!
//! - [`ClusterAdmin`]: broker discovery, topic metadata, partition growth and reassignment
//! - [`ProducerLifecycle`]: reconnect hook invoked after leadership moves

use async_trait::async_trait;

use crate::error::Result;

/// A broker as reported by cluster metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerNode {
    pub id: i32,
    pub rack: Option<String>,
}

impl BrokerNode {
    pub fn new(id: i32, rack: Option<&str>) -> Self {
        Self {
            id,
            rack: rack.map(str::to_string),
        }
    }
}

/// Leadership and replica placement of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub partition: i32,
    /// `None` while the partition has no elected leader.
    pub leader: Option<i32>,
    /// Replica broker ids, preferred leader first.
    pub replicas: Vec<i32>,
}

/// Metadata of one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDescription {
    pub name: String,
    pub partitions: Vec<PartitionInfo>,
}

impl TopicDescription {
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Replica count of the lowest-numbered partition.
    pub fn replication_factor(&self) -> usize {
        self.partitions
            .iter()
            .min_by_key(|p| p.partition)
            .map(|p| p.replicas.len())
            .unwrap_or(0)
    }
}

/// Admin operations against the log cluster.
///
/// Implementations should map "topic does not exist" to
/// [`Error::TopicNotFound`](crate::Error::TopicNotFound) and a concurrent
/// creation to [`Error::TopicAlreadyExists`](crate::Error::TopicAlreadyExists).
#[async_trait]
pub trait ClusterAdmin: Send + Sync {
    /// Live brokers with their rack labels.
    async fn list_brokers(&self) -> Result<Vec<BrokerNode>>;

    /// Partition leadership and replicas of `topic`.
    async fn describe_topic(&self, topic: &str) -> Result<TopicDescription>;

    /// Create `topic`.
    async fn create_topic(
        &self,
        topic: &str,
        partitions: usize,
        replication_factor: usize,
    ) -> Result<()>;

    /// Grow `topic` to `total` partitions. Partition counts never shrink.
    async fn create_partitions(&self, topic: &str, total: usize) -> Result<()>;

    /// Move `partition` onto `replicas`; the first replica becomes leader.
    async fn reassign_partition(&self, topic: &str, partition: i32, replicas: Vec<i32>)
    -> Result<()>;
}

/// Hook into the message transport.
#[async_trait]
pub trait ProducerLifecycle: Send + Sync {
    /// Replace the producer with a fresh one so it picks up new partition
    /// metadata. The new producer must be installed before the old one is
    /// closed.
    async fn recreate(&self) -> Result<()>;
}
