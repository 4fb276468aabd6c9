//! Copy-on-write view of the monitored topic's leadership.
//!
//! The rebalancer builds a new [`TopologySnapshot`] from scratch on every
//! refresh and swaps it in whole. Readers clone the `Arc` and never observe
//! a half-updated map.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use super::admin::BrokerNode;
use crate::constants::UNKNOWN;

/// One refresh worth of topology.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    /// Brokers known at refresh time.
    pub brokers: Vec<BrokerNode>,
    /// Broker id to the partitions it leads. Brokers leading nothing map to
    /// an empty list.
    pub partitions_by_broker: BTreeMap<i32, Vec<i32>>,
    /// Partition to the rack of its leader.
    pub rack_by_partition: HashMap<i32, String>,
}

impl TopologySnapshot {
    /// Build a snapshot and derive the rack index from broker metadata.
    pub fn new(brokers: Vec<BrokerNode>, partitions_by_broker: BTreeMap<i32, Vec<i32>>) -> Self {
        let racks: HashMap<i32, &str> = brokers
            .iter()
            .map(|b| (b.id, b.rack.as_deref().unwrap_or(UNKNOWN)))
            .collect();

        let mut rack_by_partition = HashMap::new();
        for (broker, partitions) in &partitions_by_broker {
            let rack = racks.get(broker).copied().unwrap_or(UNKNOWN);
            for partition in partitions {
                rack_by_partition.insert(*partition, rack.to_string());
            }
        }

        Self {
            brokers,
            partitions_by_broker,
            rack_by_partition,
        }
    }

    pub fn broker_for_partition(&self, partition: i32) -> Option<i32> {
        self.partitions_by_broker
            .iter()
            .find(|(_, partitions)| partitions.contains(&partition))
            .map(|(broker, _)| *broker)
    }

    pub fn rack_of_partition_leader(&self, partition: i32) -> &str {
        self.rack_by_partition
            .get(&partition)
            .map(String::as_str)
            .unwrap_or(UNKNOWN)
    }

    /// True when every known broker leads at least one partition.
    pub fn every_broker_leads(&self) -> bool {
        !self.brokers.is_empty()
            && self.brokers.iter().all(|b| {
                self.partitions_by_broker
                    .get(&b.id)
                    .is_some_and(|p| !p.is_empty())
            })
    }
}

/// Shared holder of the current [`TopologySnapshot`].
#[derive(Debug, Default)]
pub struct TopologyTracker {
    current: RwLock<Arc<TopologySnapshot>>,
    initial_refresh_done: AtomicBool,
}

impl TopologyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot. Cheap; holds the lock only to clone the `Arc`.
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Install a new snapshot.
    pub fn replace(&self, snapshot: TopologySnapshot) {
        let snapshot = Arc::new(snapshot);
        match self.current.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }

    /// True until the first refresh finished or the rebalancer gave up.
    pub fn is_initial_refresh_pending(&self) -> bool {
        !self.initial_refresh_done.load(Ordering::SeqCst)
    }

    pub fn mark_initial_refresh_done(&self) {
        self.initial_refresh_done.store(true, Ordering::SeqCst);
    }

    pub fn broker_for_partition(&self, partition: i32) -> Option<i32> {
        self.snapshot().broker_for_partition(partition)
    }

    pub fn rack_of_partition_leader(&self, partition: i32) -> String {
        self.snapshot()
            .rack_of_partition_leader(partition)
            .to_string()
    }
}
