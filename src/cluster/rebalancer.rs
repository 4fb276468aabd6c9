//! Partition rebalancing for full broker coverage.
//!
//! Synthetic traffic only measures the brokers that lead a partition of the
//! monitored topic. The [`RebalanceEngine`] keeps every broker a leader:
//!
//! ```text
//!  list brokers ──► describe topic ──► grow to N partitions ──► group leaders
//!        │            (create if missing)                          │
//!        │                                                         ▼
//!        │                                  every broker leads? ──► publish snapshot
//!        │                                         │ no                   ▲
//!        │                                         ▼                      │
//!        └──────────────────────── greedy reassign ──► recreate producer ─┘
//! ```
//!
//! A whole cycle is retried with [`retry::partition_refresh_policy`]. If the
//! budget runs out the engine disables itself for the rest of the process
//! lifetime and releases the initial-refresh gate so latency samples are
//! recorded, tagged with whatever topology is known.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::admin::{BrokerNode, ClusterAdmin, ProducerLifecycle, TopicDescription};
use super::topology::{TopologySnapshot, TopologyTracker};
use crate::config::SynthConfig;
use crate::constants::{DEFAULT_PARTITION_REFRESH_INITIAL_DELAY, DEFAULT_PARTITION_REFRESH_INTERVAL};
use crate::error::{Error, Result};
use crate::metrics;
use crate::retry;

/// Configuration for the rebalance engine.
#[derive(Debug, Clone)]
pub struct RebalanceConfig {
    /// Topic whose leadership is balanced.
    pub topic: String,
    /// Create the topic when it does not exist.
    pub auto_create_topic: bool,
    /// Replication factor for a newly created topic.
    pub replication_factor: usize,
    /// Time between refresh cycles.
    pub refresh_interval: Duration,
    /// Delay before the first cycle.
    pub initial_delay: Duration,
    /// First backoff delay between retries of a failed cycle.
    pub retry_min_delay: Duration,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            topic: "synth-client".to_string(),
            auto_create_topic: true,
            replication_factor: 1,
            refresh_interval: DEFAULT_PARTITION_REFRESH_INTERVAL,
            initial_delay: DEFAULT_PARTITION_REFRESH_INITIAL_DELAY,
            retry_min_delay: Duration::from_secs(1),
        }
    }
}

impl From<&SynthConfig> for RebalanceConfig {
    fn from(config: &SynthConfig) -> Self {
        Self {
            topic: config.topic.clone(),
            auto_create_topic: config.auto_create_topic,
            replication_factor: config.topic_replication_factor,
            refresh_interval: config.partition_refresh_interval,
            initial_delay: config.partition_refresh_initial_delay,
            ..Default::default()
        }
    }
}

/// Summary of one successful refresh cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub brokers: usize,
    pub partitions: usize,
    /// Partitions added to reach the broker count.
    pub partitions_created: usize,
    /// Leadership moves that the cluster accepted.
    pub partitions_moved: usize,
    /// Whether the greedy pass ran (and the producer was recreated).
    pub rebalanced: bool,
}

/// Result of [`RebalanceEngine::refresh`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Completed(RefreshReport),
    /// Previous cycle still running.
    Skipped,
    /// The engine was already disabled; nothing was done.
    Disabled,
    /// Retries ran out; the engine is now disabled.
    GaveUp(Error),
}

/// Outcome of the greedy pass.
#[derive(Debug, Default)]
struct GreedyPass {
    ran: bool,
    moved: usize,
}

/// Drives partition count and leadership toward full broker coverage.
pub struct RebalanceEngine {
    admin: Arc<dyn ClusterAdmin>,
    producer: Arc<dyn ProducerLifecycle>,
    topology: Arc<TopologyTracker>,
    config: RebalanceConfig,
    enabled: AtomicBool,
    in_progress: AtomicBool,
    rng: Mutex<fastrand::Rng>,
}

impl RebalanceEngine {
    pub fn new(
        admin: Arc<dyn ClusterAdmin>,
        producer: Arc<dyn ProducerLifecycle>,
        topology: Arc<TopologyTracker>,
        config: RebalanceConfig,
    ) -> Self {
        metrics::REBALANCER_ENABLED.set(1);
        Self {
            admin,
            producer,
            topology,
            config,
            enabled: AtomicBool::new(true),
            in_progress: AtomicBool::new(false),
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Seed replica selection for reproducible runs.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
            ..self
        }
    }

    pub fn config(&self) -> &RebalanceConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<TopologyTracker> {
        &self.topology
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Run one refresh cycle with retries.
    ///
    /// No-op once disabled. Overlapping calls are skipped.
    pub async fn refresh(&self) -> RefreshOutcome {
        if !self.is_enabled() {
            return RefreshOutcome::Disabled;
        }
        if self.in_progress.swap(true, Ordering::SeqCst) {
            debug!("Partition refresh already in progress, skipping");
            return RefreshOutcome::Skipped;
        }

        info!(
            topic = %self.config.topic,
            "Rebalancing partitions so synthetic traffic reaches every broker"
        );
        let result = retry::with_policy(
            "partition_refresh",
            retry::partition_refresh_policy_with_min_delay(self.config.retry_min_delay),
            || async {
                let result = self.refresh_once().await;
                if let Err(e) = &result {
                    metrics::record_partition_refresh("failure");
                    warn!(topic = %self.config.topic, error = %e, "Partition refresh attempt failed");
                }
                result
            },
            Error::is_retriable,
        )
        .await;

        let outcome = match result {
            Ok(report) => {
                metrics::record_partition_refresh("success");
                RefreshOutcome::Completed(report)
            }
            Err(e) => {
                self.disable(&e);
                RefreshOutcome::GaveUp(e)
            }
        };
        self.in_progress.store(false, Ordering::SeqCst);
        outcome
    }

    fn disable(&self, cause: &Error) {
        self.enabled.store(false, Ordering::SeqCst);
        self.topology.mark_initial_refresh_done();
        metrics::REBALANCER_ENABLED.set(0);
        error!(
            topic = %self.config.topic,
            error = %cause,
            "Failed to refresh partitions after retries, disabling rebalancing"
        );
    }

    /// One refresh cycle without retries.
    pub async fn refresh_once(&self) -> Result<RefreshReport> {
        let topic = self.config.topic.as_str();

        let brokers = self.admin.list_brokers().await?;
        if brokers.is_empty() {
            return Err(Error::Admin("cluster reported no brokers".into()));
        }
        info!(brokers = brokers.len(), "Discovered cluster brokers");

        let mut description = self.describe_or_create(brokers.len()).await?;
        info!(
            topic,
            partitions = description.partition_count(),
            "Described monitored topic"
        );

        let mut partitions_created = 0;
        if description.partition_count() < brokers.len() {
            partitions_created = brokers.len() - description.partition_count();
            info!(topic, partitions_created, "Creating additional partitions");
            self.admin.create_partitions(topic, brokers.len()).await?;
            description = self.admin.describe_topic(topic).await?;
        }

        let mut partitions_by_broker = group_leaders(&description, &brokers);
        for (broker, partitions) in &partitions_by_broker {
            debug!(broker, ?partitions, "Current leadership");
        }

        let pass = self
            .greedy_rebalance(&description, &brokers, &mut partitions_by_broker)
            .await;
        if pass.ran {
            for (broker, partitions) in &partitions_by_broker {
                info!(broker, ?partitions, "New leadership");
            }
            if let Err(e) = self.producer.recreate().await {
                warn!(error = %e, "Failed to recreate producer after rebalancing");
            }
        }

        let report = RefreshReport {
            brokers: brokers.len(),
            partitions: description.partition_count(),
            partitions_created,
            partitions_moved: pass.moved,
            rebalanced: pass.ran,
        };

        metrics::set_partition_leaders(&partitions_by_broker);
        self.topology
            .replace(TopologySnapshot::new(brokers, partitions_by_broker));
        self.topology.mark_initial_refresh_done();
        debug!(?report, "Partition refresh done");
        Ok(report)
    }

    async fn describe_or_create(&self, broker_count: usize) -> Result<TopicDescription> {
        let topic = self.config.topic.as_str();
        match self.admin.describe_topic(topic).await {
            Err(Error::TopicNotFound(_)) if self.config.auto_create_topic => {
                let rf = self.config.replication_factor.clamp(1, broker_count);
                info!(topic, partitions = broker_count, replication_factor = rf, "Creating monitored topic");
                match self.admin.create_topic(topic, broker_count, rf).await {
                    Ok(()) => {}
                    Err(Error::TopicAlreadyExists(_)) => {
                        debug!(topic, "Topic was created concurrently");
                    }
                    Err(e) => return Err(e),
                }
                self.admin.describe_topic(topic).await
            }
            other => other,
        }
    }

    /// Hand partitions from the richest brokers to brokers leading nothing.
    ///
    /// Brokers are sorted by led-partition count. The `poor` cursor walks up
    /// from the start, `rich` walks down from the end and moves inward once
    /// its broker is left with a single partition. The pass stops at the
    /// first broker that already leads something or at the first failed
    /// reassignment.
    async fn greedy_rebalance(
        &self,
        description: &TopicDescription,
        brokers: &[BrokerNode],
        partitions_by_broker: &mut BTreeMap<i32, Vec<i32>>,
    ) -> GreedyPass {
        let mut order: Vec<i32> = brokers.iter().map(|b| b.id).collect();
        order.sort_by_key(|id| partitions_by_broker.get(id).map_or(0, Vec::len));

        let led = |map: &BTreeMap<i32, Vec<i32>>, id: i32| map.get(&id).map_or(0, Vec::len);

        let Some(&poorest) = order.first() else {
            return GreedyPass::default();
        };
        if led(partitions_by_broker, poorest) > 0 {
            debug!("Each broker leads at least one partition, not reassigning");
            return GreedyPass::default();
        }

        let replication_factor = description.replication_factor().max(1);
        let topic = self.config.topic.as_str();
        let mut pass = GreedyPass {
            ran: true,
            moved: 0,
        };
        let (mut poor, mut rich) = (0, order.len() - 1);

        while poor < rich {
            let (poor_id, rich_id) = (order[poor], order[rich]);
            if led(partitions_by_broker, poor_id) > 0 {
                break;
            }
            if led(partitions_by_broker, rich_id) < 2 {
                warn!(
                    broker = poor_id,
                    "Not enough partitions to give every broker leadership"
                );
                break;
            }
            let Some(partition) = partitions_by_broker
                .get(&rich_id)
                .and_then(|p| p.first().copied())
            else {
                break;
            };

            let replicas = {
                let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                gen_reassignment(poor_id, replication_factor, brokers, &mut rng)
            };
            let replicas = match replicas {
                Ok(replicas) => replicas,
                Err(e) => {
                    error!(partition, broker = poor_id, error = %e, "Cannot build replica set");
                    metrics::record_reassignment("failure");
                    break;
                }
            };

            if let Err(e) = self
                .admin
                .reassign_partition(topic, partition, replicas.clone())
                .await
            {
                error!(
                    partition,
                    broker = poor_id,
                    error = %e,
                    "Failed to reassign partition"
                );
                metrics::record_reassignment("failure");
                break;
            }
            metrics::record_reassignment("success");
            info!(partition, from = rich_id, to = poor_id, ?replicas, "Reassigned partition leadership");

            if let Some(rich_parts) = partitions_by_broker.get_mut(&rich_id) {
                rich_parts.retain(|p| *p != partition);
            }
            partitions_by_broker.entry(poor_id).or_default().push(partition);
            pass.moved += 1;

            if led(partitions_by_broker, rich_id) < 2 {
                rich -= 1;
            }
            poor += 1;
        }

        pass
    }
}

/// Leader ids to the partitions they lead. Every broker in `brokers` gets
/// an entry, possibly empty. Leaderless partitions are skipped.
pub fn group_leaders(
    description: &TopicDescription,
    brokers: &[BrokerNode],
) -> BTreeMap<i32, Vec<i32>> {
    let mut by_broker: BTreeMap<i32, Vec<i32>> =
        brokers.iter().map(|b| (b.id, Vec::new())).collect();

    let mut partitions: Vec<_> = description.partitions.iter().collect();
    partitions.sort_by_key(|p| p.partition);
    for info in partitions {
        match info.leader {
            Some(leader) => by_broker.entry(leader).or_default().push(info.partition),
            None => warn!(partition = info.partition, "Partition has no leader"),
        }
    }
    by_broker
}

/// Replica set led by `leader`: the leader followed by
/// `replication_factor - 1` distinct brokers picked at random.
pub fn gen_reassignment(
    leader: i32,
    replication_factor: usize,
    brokers: &[BrokerNode],
    rng: &mut fastrand::Rng,
) -> Result<Vec<i32>> {
    let mut candidates: Vec<i32> = brokers
        .iter()
        .map(|b| b.id)
        .filter(|id| *id != leader)
        .collect();
    let followers = replication_factor.saturating_sub(1);
    if candidates.len() < followers {
        return Err(Error::InsufficientBrokers {
            required: replication_factor,
            available: candidates.len() + 1,
        });
    }
    rng.shuffle(&mut candidates);

    let mut replicas = Vec::with_capacity(replication_factor);
    replicas.push(leader);
    replicas.extend_from_slice(&candidates[..followers]);
    Ok(replicas)
}
