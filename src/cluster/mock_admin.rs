//! In-memory cluster admin and producer for testing.
//!
//! [`MockClusterAdmin`] keeps brokers and topics in memory and applies
//! partition growth and reassignments the way a real controller would:
//! a reassigned partition is led by the first replica. Individual
//! operations can be made to fail to exercise retry and fallback paths.
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! synthwatch = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::admin::{BrokerNode, ClusterAdmin, PartitionInfo, ProducerLifecycle, TopicDescription};
use crate::error::{Error, Result};

/// Operations whose failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminOp {
    ListBrokers,
    DescribeTopic,
    CreateTopic,
    CreatePartitions,
    Reassign,
}

#[derive(Debug, Default)]
struct MockState {
    brokers: Vec<BrokerNode>,
    topics: HashMap<String, Vec<PartitionInfo>>,
    /// Remaining injected failures per operation.
    failures: HashMap<AdminOp, u32>,
    /// Leader given to partitions added by `create_partitions`.
    new_partition_leader: Option<i32>,
    reassignments: Vec<(String, i32, Vec<i32>)>,
    calls: HashMap<AdminOp, u32>,
}

/// In-memory [`ClusterAdmin`].
#[derive(Debug, Clone, Default)]
pub struct MockClusterAdmin {
    state: Arc<RwLock<MockState>>,
    /// Answer `create_topic` with "already exists" after creating it.
    creation_race: Arc<AtomicBool>,
}

impl MockClusterAdmin {
    pub fn new(brokers: Vec<BrokerNode>) -> Self {
        Self {
            state: Arc::new(RwLock::new(MockState {
                brokers,
                ..Default::default()
            })),
            creation_race: Arc::new(AtomicBool::new(false)),
        }
    }

    /// `count` brokers with ids `1..=count`, rack `rack-<id>`.
    pub fn with_brokers(count: i32) -> Self {
        Self::new(
            (1..=count)
                .map(|id| BrokerNode::new(id, Some(&format!("rack-{}", id))))
                .collect(),
        )
    }

    /// Add a topic whose partitions are all led by `leader`, replicated to
    /// the following brokers.
    pub async fn add_topic(&self, topic: &str, partitions: usize, rf: usize, leader: i32) {
        let mut state = self.state.write().await;
        let infos = (0..partitions as i32)
            .map(|p| PartitionInfo {
                partition: p,
                leader: Some(leader),
                replicas: replica_set(&state.brokers, leader, rf),
            })
            .collect();
        state.topics.insert(topic.to_string(), infos);
    }

    /// Replace the partitions of a topic verbatim.
    pub async fn set_partitions(&self, topic: &str, partitions: Vec<PartitionInfo>) {
        self.state
            .write()
            .await
            .topics
            .insert(topic.to_string(), partitions);
    }

    pub async fn set_brokers(&self, brokers: Vec<BrokerNode>) {
        self.state.write().await.brokers = brokers;
    }

    /// Make the next `times` calls of `op` fail with a transient error.
    pub async fn fail_next(&self, op: AdminOp, times: u32) {
        self.state.write().await.failures.insert(op, times);
    }

    pub async fn set_new_partition_leader(&self, broker: i32) {
        self.state.write().await.new_partition_leader = Some(broker);
    }

    pub fn set_creation_race(&self, enabled: bool) {
        self.creation_race.store(enabled, Ordering::SeqCst);
    }

    pub async fn topic(&self, topic: &str) -> Option<Vec<PartitionInfo>> {
        self.state.read().await.topics.get(topic).cloned()
    }

    pub async fn reassignments(&self) -> Vec<(String, i32, Vec<i32>)> {
        self.state.read().await.reassignments.clone()
    }

    pub async fn call_count(&self, op: AdminOp) -> u32 {
        self.state
            .read()
            .await
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Count the call and consume one injected failure if any is left.
    async fn enter(&self, op: AdminOp) -> Result<()> {
        let mut state = self.state.write().await;
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(remaining) = state.failures.get_mut(&op)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(Error::Admin(format!("injected {:?} failure", op)));
        }
        Ok(())
    }
}

/// `leader` followed by the next `rf - 1` brokers in list order.
fn replica_set(brokers: &[BrokerNode], leader: i32, rf: usize) -> Vec<i32> {
    let mut replicas = vec![leader];
    replicas.extend(
        brokers
            .iter()
            .map(|b| b.id)
            .filter(|id| *id != leader)
            .take(rf.saturating_sub(1)),
    );
    replicas
}

#[async_trait]
impl ClusterAdmin for MockClusterAdmin {
    async fn list_brokers(&self) -> Result<Vec<BrokerNode>> {
        self.enter(AdminOp::ListBrokers).await?;
        Ok(self.state.read().await.brokers.clone())
    }

    async fn describe_topic(&self, topic: &str) -> Result<TopicDescription> {
        self.enter(AdminOp::DescribeTopic).await?;
        let state = self.state.read().await;
        let partitions = state
            .topics
            .get(topic)
            .ok_or_else(|| Error::TopicNotFound(topic.to_string()))?;
        Ok(TopicDescription {
            name: topic.to_string(),
            partitions: partitions.clone(),
        })
    }

    async fn create_topic(
        &self,
        topic: &str,
        partitions: usize,
        replication_factor: usize,
    ) -> Result<()> {
        self.enter(AdminOp::CreateTopic).await?;
        let exists = self.state.read().await.topics.contains_key(topic);
        if exists {
            return Err(Error::TopicAlreadyExists(topic.to_string()));
        }
        let leader = {
            let state = self.state.read().await;
            state
                .new_partition_leader
                .or_else(|| state.brokers.first().map(|b| b.id))
                .ok_or_else(|| Error::Admin("no brokers".into()))?
        };
        self.add_topic(topic, partitions, replication_factor, leader)
            .await;
        if self.creation_race.load(Ordering::SeqCst) {
            return Err(Error::TopicAlreadyExists(topic.to_string()));
        }
        Ok(())
    }

    async fn create_partitions(&self, topic: &str, total: usize) -> Result<()> {
        self.enter(AdminOp::CreatePartitions).await?;
        let mut state = self.state.write().await;
        let leader = state
            .new_partition_leader
            .or_else(|| state.brokers.first().map(|b| b.id))
            .ok_or_else(|| Error::Admin("no brokers".into()))?;
        let brokers = state.brokers.clone();
        let partitions = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| Error::TopicNotFound(topic.to_string()))?;
        if total < partitions.len() {
            return Err(Error::Admin(format!(
                "cannot shrink {} from {} to {} partitions",
                topic,
                partitions.len(),
                total
            )));
        }
        let rf = partitions.first().map(|p| p.replicas.len()).unwrap_or(1);
        for p in partitions.len()..total {
            partitions.push(PartitionInfo {
                partition: p as i32,
                leader: Some(leader),
                replicas: replica_set(&brokers, leader, rf),
            });
        }
        Ok(())
    }

    async fn reassign_partition(
        &self,
        topic: &str,
        partition: i32,
        replicas: Vec<i32>,
    ) -> Result<()> {
        self.enter(AdminOp::Reassign).await?;
        let mut state = self.state.write().await;
        if replicas.is_empty() {
            return Err(Error::Admin("empty replica set".into()));
        }
        if let Some(unknown) = replicas
            .iter()
            .find(|id| !state.brokers.iter().any(|b| b.id == **id))
        {
            return Err(Error::Admin(format!("unknown broker {}", unknown)));
        }
        let info = state
            .topics
            .get_mut(topic)
            .and_then(|parts| parts.iter_mut().find(|p| p.partition == partition))
            .ok_or_else(|| Error::TopicNotFound(format!("{}-{}", topic, partition)))?;
        info.leader = replicas.first().copied();
        info.replicas = replicas.clone();
        state
            .reassignments
            .push((topic.to_string(), partition, replicas));
        Ok(())
    }
}

/// [`ProducerLifecycle`] that counts `recreate` calls.
#[derive(Debug, Default)]
pub struct MockProducer {
    recreated: AtomicU32,
    fail: AtomicBool,
}

impl MockProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recreate_count(&self) -> u32 {
        self.recreated.load(Ordering::SeqCst)
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProducerLifecycle for MockProducer {
    async fn recreate(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Network("producer bootstrap failed".into()));
        }
        self.recreated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
