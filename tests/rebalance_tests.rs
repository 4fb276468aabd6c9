//! Partition refresh and leadership rebalancing against the in-memory admin.

use std::sync::Arc;
use std::time::Duration;

use synthwatch::Error;
use synthwatch::cluster::{
    AdminOp, MockClusterAdmin, MockProducer, PartitionInfo, RebalanceConfig, RebalanceEngine,
    RefreshOutcome, TopologyTracker,
};

const TOPIC: &str = "synth-it";

struct Harness {
    admin: MockClusterAdmin,
    producer: Arc<MockProducer>,
    topology: Arc<TopologyTracker>,
    engine: RebalanceEngine,
}

fn harness_with(admin: MockClusterAdmin, config: RebalanceConfig) -> Harness {
    let producer = Arc::new(MockProducer::new());
    let topology = Arc::new(TopologyTracker::new());
    let engine = RebalanceEngine::new(
        Arc::new(admin.clone()),
        producer.clone(),
        topology.clone(),
        config,
    )
    .with_seed(7);
    Harness {
        admin,
        producer,
        topology,
        engine,
    }
}

fn config() -> RebalanceConfig {
    RebalanceConfig {
        topic: TOPIC.to_string(),
        retry_min_delay: Duration::from_millis(1),
        ..Default::default()
    }
}

fn harness(admin: MockClusterAdmin) -> Harness {
    harness_with(admin, config())
}

/// Leader of every partition, by partition id.
async fn leaders(admin: &MockClusterAdmin) -> Vec<(i32, Option<i32>)> {
    let mut parts: Vec<_> = admin
        .topic(TOPIC)
        .await
        .unwrap()
        .into_iter()
        .map(|p| (p.partition, p.leader))
        .collect();
    parts.sort();
    parts
}

fn led_by(leaders: &[(i32, Option<i32>)], broker: i32) -> usize {
    leaders.iter().filter(|(_, l)| *l == Some(broker)).count()
}

fn expect_report(outcome: RefreshOutcome) -> synthwatch::cluster::RefreshReport {
    match outcome {
        RefreshOutcome::Completed(report) => report,
        other => panic!("expected a completed refresh, got {:?}", other),
    }
}

#[tokio::test]
async fn test_single_partition_grows_and_spreads_over_three_brokers() {
    let admin = MockClusterAdmin::with_brokers(3);
    admin.add_topic(TOPIC, 1, 1, 1).await;
    let h = harness(admin);

    let report = expect_report(h.engine.refresh().await);

    assert_eq!(report.brokers, 3);
    assert_eq!(report.partitions, 3);
    assert_eq!(report.partitions_created, 2);
    assert_eq!(report.partitions_moved, 2);
    assert!(report.rebalanced);

    let leaders = leaders(&h.admin).await;
    assert_eq!(leaders.len(), 3);
    for broker in 1..=3 {
        assert_eq!(led_by(&leaders, broker), 1, "broker {} in {:?}", broker, leaders);
    }
    assert_eq!(h.producer.recreate_count(), 1);
    assert!(!h.topology.is_initial_refresh_pending());
}

#[tokio::test]
async fn test_new_partitions_on_one_broker_are_spread() {
    let admin = MockClusterAdmin::with_brokers(3);
    admin.add_topic(TOPIC, 1, 1, 3).await;
    // The cluster places every new partition on broker 3.
    admin.set_new_partition_leader(3).await;
    let h = harness(admin);

    let report = expect_report(h.engine.refresh().await);
    assert_eq!(report.partitions_created, 2);

    let leaders = leaders(&h.admin).await;
    for broker in 1..=3 {
        assert_eq!(led_by(&leaders, broker), 1, "{:?}", leaders);
    }
}

#[tokio::test]
async fn test_every_broker_leads_when_partitions_suffice() {
    let admin = MockClusterAdmin::with_brokers(4);
    admin.add_topic(TOPIC, 8, 1, 1).await;
    let h = harness(admin);

    let report = expect_report(h.engine.refresh().await);
    assert_eq!(report.partitions_created, 0);
    assert_eq!(report.partitions_moved, 3);

    let leaders = leaders(&h.admin).await;
    for broker in 1..=4 {
        assert!(led_by(&leaders, broker) >= 1, "broker {} idle in {:?}", broker, leaders);
    }
    assert!(h.topology.snapshot().every_broker_leads());
}

#[tokio::test]
async fn test_uneven_leadership_is_completed() {
    let admin = MockClusterAdmin::with_brokers(4);
    let part = |partition, leader| PartitionInfo {
        partition,
        leader: Some(leader),
        replicas: vec![leader],
    };
    admin
        .set_partitions(TOPIC, vec![part(0, 1), part(1, 1), part(2, 2), part(3, 2)])
        .await;
    let h = harness(admin);

    expect_report(h.engine.refresh().await);

    let leaders = leaders(&h.admin).await;
    for broker in 1..=4 {
        assert_eq!(led_by(&leaders, broker), 1, "{:?}", leaders);
    }
}

#[tokio::test]
async fn test_second_refresh_is_a_noop() {
    let admin = MockClusterAdmin::with_brokers(3);
    admin.add_topic(TOPIC, 1, 1, 1).await;
    let h = harness(admin);

    expect_report(h.engine.refresh().await);
    let moves = h.admin.reassignments().await.len();

    let report = expect_report(h.engine.refresh().await);
    assert!(!report.rebalanced);
    assert_eq!(report.partitions_moved, 0);
    assert_eq!(h.admin.reassignments().await.len(), moves);
    assert_eq!(h.producer.recreate_count(), 1);
}

#[tokio::test]
async fn test_replication_factor_is_preserved() {
    let admin = MockClusterAdmin::with_brokers(5);
    admin.add_topic(TOPIC, 1, 3, 1).await;
    let h = harness(admin);

    expect_report(h.engine.refresh().await);

    let reassignments = h.admin.reassignments().await;
    assert!(!reassignments.is_empty());
    for (_, partition, replicas) in &reassignments {
        assert_eq!(replicas.len(), 3, "partition {} got {:?}", partition, replicas);
        let mut distinct = replicas.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 3);
    }
    for info in h.admin.topic(TOPIC).await.unwrap() {
        assert_eq!(info.replicas.len(), 3);
        assert_eq!(info.leader, info.replicas.first().copied());
    }
}

#[tokio::test]
async fn test_partitions_never_shrink() {
    let admin = MockClusterAdmin::with_brokers(3);
    admin.add_topic(TOPIC, 5, 1, 2).await;
    let h = harness(admin);

    let report = expect_report(h.engine.refresh().await);

    assert_eq!(report.partitions, 5);
    assert_eq!(report.partitions_created, 0);
    assert_eq!(h.admin.call_count(AdminOp::CreatePartitions).await, 0);
    assert_eq!(h.admin.topic(TOPIC).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let admin = MockClusterAdmin::with_brokers(2);
    admin.add_topic(TOPIC, 2, 1, 1).await;
    admin.fail_next(AdminOp::DescribeTopic, 2).await;
    let h = harness(admin);

    let report = expect_report(h.engine.refresh().await);
    assert_eq!(report.partitions_moved, 1);
    assert_eq!(h.admin.call_count(AdminOp::ListBrokers).await, 3);
    assert!(h.engine.is_enabled());
}

#[tokio::test]
async fn test_persistent_failure_disables_engine() {
    let admin = MockClusterAdmin::with_brokers(3);
    admin.add_topic(TOPIC, 1, 1, 1).await;
    admin.fail_next(AdminOp::ListBrokers, 100).await;
    let h = harness(admin);
    assert!(h.topology.is_initial_refresh_pending());

    let outcome = h.engine.refresh().await;
    assert!(matches!(outcome, RefreshOutcome::GaveUp(Error::Admin(_))), "{:?}", outcome);
    // One attempt plus three retries.
    assert_eq!(h.admin.call_count(AdminOp::ListBrokers).await, 4);
    assert!(!h.engine.is_enabled());
    assert!(!h.topology.is_initial_refresh_pending());

    assert_eq!(h.engine.refresh().await, RefreshOutcome::Disabled);
    assert_eq!(h.admin.call_count(AdminOp::ListBrokers).await, 4);
}

#[tokio::test]
async fn test_failed_producer_recreate_is_not_fatal() {
    let admin = MockClusterAdmin::with_brokers(2);
    admin.add_topic(TOPIC, 1, 1, 1).await;
    let h = harness(admin);
    h.producer.set_fail(true);

    let report = expect_report(h.engine.refresh().await);
    assert!(report.rebalanced);
    assert_eq!(h.producer.recreate_count(), 0);
    assert!(h.engine.is_enabled());
}

#[tokio::test]
async fn test_missing_topic_is_created() {
    let admin = MockClusterAdmin::with_brokers(3);
    let h = harness_with(
        admin,
        RebalanceConfig {
            replication_factor: 5,
            ..config()
        },
    );

    let report = expect_report(h.engine.refresh().await);
    assert_eq!(report.partitions, 3);
    assert_eq!(h.admin.call_count(AdminOp::CreateTopic).await, 1);

    let partitions = h.admin.topic(TOPIC).await.unwrap();
    assert_eq!(partitions.len(), 3);
    // Capped at the broker count.
    assert!(partitions.iter().all(|p| p.replicas.len() == 3));
}

#[tokio::test]
async fn test_concurrent_topic_creation_counts_as_success() {
    let admin = MockClusterAdmin::with_brokers(2);
    admin.set_creation_race(true);
    let h = harness(admin);

    let report = expect_report(h.engine.refresh().await);
    assert_eq!(report.partitions, 2);
    assert_eq!(h.admin.call_count(AdminOp::CreateTopic).await, 1);
}

#[tokio::test]
async fn test_missing_topic_without_auto_create_gives_up() {
    let admin = MockClusterAdmin::with_brokers(2);
    let h = harness_with(
        admin,
        RebalanceConfig {
            auto_create_topic: false,
            ..config()
        },
    );

    let outcome = h.engine.refresh().await;
    assert!(matches!(outcome, RefreshOutcome::GaveUp(Error::TopicNotFound(_))));
    assert_eq!(h.admin.call_count(AdminOp::CreateTopic).await, 0);
    assert!(!h.topology.is_initial_refresh_pending());
}

#[tokio::test]
async fn test_snapshot_resolves_leader_and_rack() {
    let admin = MockClusterAdmin::with_brokers(3);
    admin.add_topic(TOPIC, 1, 1, 1).await;
    let h = harness(admin);

    expect_report(h.engine.refresh().await);

    let leaders = leaders(&h.admin).await;
    for (partition, leader) in leaders {
        let leader = leader.unwrap();
        assert_eq!(h.topology.broker_for_partition(partition), Some(leader));
        assert_eq!(
            h.topology.rack_of_partition_leader(partition),
            format!("rack-{}", leader)
        );
    }
    assert_eq!(h.topology.broker_for_partition(42), None);
    assert_eq!(h.topology.rack_of_partition_leader(42), "unknown");
}

#[tokio::test]
async fn test_more_brokers_join_later() {
    let admin = MockClusterAdmin::with_brokers(2);
    admin.add_topic(TOPIC, 1, 1, 1).await;
    let h = harness(admin);

    expect_report(h.engine.refresh().await);
    assert_eq!(h.admin.topic(TOPIC).await.unwrap().len(), 2);

    h.admin
        .set_brokers(
            (1..=4)
                .map(|id| synthwatch::cluster::BrokerNode::new(id, None))
                .collect(),
        )
        .await;
    let report = expect_report(h.engine.refresh().await);

    assert_eq!(report.partitions, 4);
    assert_eq!(report.partitions_created, 2);
    let leaders = leaders(&h.admin).await;
    for broker in 1..=4 {
        assert_eq!(led_by(&leaders, broker), 1, "{:?}", leaders);
    }
    assert_eq!(h.producer.recreate_count(), 2);
}
