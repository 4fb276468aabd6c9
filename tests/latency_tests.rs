//! Latency aggregation: warm-up, first window, failover and export.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use synthwatch::cluster::{BrokerNode, TopologySnapshot, TopologyTracker};
use synthwatch::latency::{AggregatorConfig, LatencyAggregator, RecordOutcome, SummaryConfig};
use synthwatch::metrics;

fn tracker_with(leaders: &[(i32, &[i32])]) -> Arc<TopologyTracker> {
    let tracker = Arc::new(TopologyTracker::new());
    set_leaders(&tracker, leaders);
    tracker.mark_initial_refresh_done();
    tracker
}

fn set_leaders(tracker: &TopologyTracker, leaders: &[(i32, &[i32])]) {
    let brokers = leaders
        .iter()
        .map(|(id, _)| BrokerNode::new(*id, Some(&format!("zone-{}", id))))
        .collect();
    let map: BTreeMap<i32, Vec<i32>> = leaders.iter().map(|(id, p)| (*id, p.to_vec())).collect();
    tracker.replace(TopologySnapshot::new(brokers, map));
}

fn config(ignore: u64, window: usize) -> AggregatorConfig {
    AggregatorConfig {
        local_rack: "zone-local".into(),
        ignore_first_n_messages: ignore,
        min_samples_first_window: window,
        e2e: SummaryConfig::new(1.0, 10_000.0, Duration::from_secs(60)).unwrap(),
        ack: SummaryConfig::new(1.0, 100.0, Duration::from_secs(60)).unwrap(),
    }
}

/// Broker label of every exported series of `family` for `topic`.
fn exported_brokers(family: &str, topic: &str) -> Vec<String> {
    let full_name = format!("synth_client_{}", family);
    let mut brokers: Vec<String> = metrics::gather_metrics()
        .iter()
        .filter(|f| f.get_name() == full_name)
        .flat_map(|f| f.get_metric().iter())
        .filter(|m| {
            m.get_label()
                .iter()
                .any(|l| l.get_name() == "topic" && l.get_value() == topic)
        })
        .filter_map(|m| {
            m.get_label()
                .iter()
                .find(|l| l.get_name() == "broker")
                .map(|l| l.get_value().to_string())
        })
        .collect();
    brokers.sort();
    brokers.dedup();
    brokers
}

#[test]
fn test_first_n_messages_per_partition_are_ignored() {
    let aggregator = LatencyAggregator::new(config(3, 0), tracker_with(&[(1, &[0, 1])]));
    let now = Instant::now();

    for seen in 0..3 {
        assert_eq!(
            aggregator.record_end_to_end_latency_at("warm", 0, 10, "zone-a", now),
            RecordOutcome::Ignored { seen }
        );
    }
    assert_eq!(
        aggregator.record_end_to_end_latency_at("warm", 0, 10, "zone-a", now),
        RecordOutcome::Recorded
    );

    // Partition 1 has its own counter.
    assert!(matches!(
        aggregator.record_end_to_end_latency_at("warm", 1, 10, "zone-a", now),
        RecordOutcome::Ignored { seen: 0 }
    ));

    let snapshot = aggregator
        .e2e_snapshot_at("warm", 0, "zone-a", now)
        .unwrap()
        .snapshot;
    assert_eq!(snapshot.window_count, 1);
    assert_eq!(snapshot.total_count, 1);
}

#[test]
fn test_first_window_is_invisible_until_full() {
    let aggregator = LatencyAggregator::new(config(0, 4), tracker_with(&[(1, &[0])]));
    let now = Instant::now();

    for held in 1..4 {
        assert_eq!(
            aggregator.record_end_to_end_latency_at("window", 0, 20, "zone-a", now),
            RecordOutcome::Buffered { held }
        );
        let count = aggregator
            .e2e_snapshot_at("window", 0, "zone-a", now)
            .map_or(0, |l| l.snapshot.window_count);
        assert_eq!(count, 0);
    }

    assert_eq!(
        aggregator.record_end_to_end_latency_at("window", 0, 20, "zone-a", now),
        RecordOutcome::Flushed(4)
    );
    let snapshot = aggregator
        .e2e_snapshot_at("window", 0, "zone-a", now)
        .unwrap()
        .snapshot;
    assert_eq!(snapshot.window_count, 4);

    assert_eq!(
        aggregator.record_end_to_end_latency_at("window", 0, 20, "zone-a", now),
        RecordOutcome::Recorded
    );
}

#[test]
fn test_flushed_samples_land_in_their_own_summaries() {
    let aggregator = LatencyAggregator::new(config(0, 3), tracker_with(&[(1, &[0]), (2, &[1])]));
    let now = Instant::now();

    aggregator.record_end_to_end_latency_at("split", 0, 5, "zone-a", now);
    aggregator.record_end_to_end_latency_at("split", 1, 500, "zone-b", now);
    assert_eq!(
        aggregator.record_end_to_end_latency_at("split", 0, 7, "zone-a", now),
        RecordOutcome::Flushed(3)
    );

    let p0 = aggregator.e2e_snapshot_at("split", 0, "zone-a", now).unwrap();
    let p1 = aggregator.e2e_snapshot_at("split", 1, "zone-b", now).unwrap();
    assert_eq!(p0.snapshot.window_count, 2);
    assert_eq!(p1.snapshot.window_count, 1);
    assert!(p0.snapshot.window_max_ms < 10.0);
    assert!((p1.snapshot.window_max_ms - 500.0).abs() < 1.0);
    assert_eq!(p1.tags.broker, "2");
}

#[test]
fn test_warm_up_runs_before_first_window() {
    let aggregator = LatencyAggregator::new(config(2, 2), tracker_with(&[(1, &[0])]));
    let now = Instant::now();

    let outcomes: Vec<_> = (0..5)
        .map(|_| aggregator.record_end_to_end_latency_at("layers", 0, 3, "zone-a", now))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            RecordOutcome::Ignored { seen: 0 },
            RecordOutcome::Ignored { seen: 1 },
            RecordOutcome::Buffered { held: 1 },
            RecordOutcome::Flushed(2),
            RecordOutcome::Recorded,
        ]
    );
}

#[test]
fn test_leader_failover_starts_a_fresh_summary() {
    let tracker = tracker_with(&[(1, &[0]), (2, &[])]);
    let aggregator = LatencyAggregator::new(config(0, 0), tracker.clone());
    let now = Instant::now();

    for _ in 0..5 {
        aggregator.record_end_to_end_latency_at("failover", 0, 40, "zone-a", now);
    }
    aggregator.publish_metrics();
    assert_eq!(exported_brokers("e2e_latency_ms_count", "failover"), vec!["1"]);

    set_leaders(&tracker, &[(1, &[]), (2, &[0])]);
    aggregator.record_end_to_end_latency_at("failover", 0, 900, "zone-a", now);
    aggregator.record_end_to_end_latency_at("failover", 0, 900, "zone-a", now);

    let labelled = aggregator
        .e2e_snapshot_at("failover", 0, "zone-a", now)
        .unwrap();
    assert_eq!(labelled.tags.broker, "2");
    assert_eq!(labelled.tags.via_broker_rack, "zone-2");
    assert_eq!(labelled.snapshot.total_count, 2);
    assert!((labelled.snapshot.percentiles[0].1 - 900.0).abs() < 1.0);

    let failover_summaries = aggregator
        .e2e_snapshots_at(now)
        .into_iter()
        .filter(|l| l.tags.topic == "failover")
        .count();
    assert_eq!(failover_summaries, 1);

    aggregator.publish_metrics();
    assert_eq!(exported_brokers("e2e_latency_ms_count", "failover"), vec!["2"]);
    assert_eq!(exported_brokers("e2e_latency_ms", "failover"), vec!["2"]);
}

#[test]
fn test_ack_failover_replaces_summary() {
    let tracker = tracker_with(&[(1, &[0]), (2, &[])]);
    let aggregator = LatencyAggregator::new(config(0, 0), tracker.clone());
    let now = Instant::now();

    aggregator.record_ack_latency_at("ack-failover", 0, Duration::from_millis(8), now);
    set_leaders(&tracker, &[(1, &[]), (2, &[0])]);
    aggregator.record_ack_latency_at("ack-failover", 0, Duration::from_millis(9), now);

    let labelled = aggregator.ack_snapshot_at("ack-failover", 0, now).unwrap();
    assert_eq!(labelled.tags.broker, "2");
    assert_eq!(labelled.tags.from_rack, None);
    assert_eq!(labelled.snapshot.total_count, 1);
}

#[test]
fn test_failover_during_first_window_discards_stale_samples() {
    let tracker = tracker_with(&[(1, &[0]), (2, &[])]);
    let aggregator = LatencyAggregator::new(config(0, 3), tracker.clone());
    let now = Instant::now();

    for held in 1..=2 {
        assert_eq!(
            aggregator.record_end_to_end_latency_at("held-failover", 0, 40, "zone-a", now),
            RecordOutcome::Buffered { held }
        );
    }
    set_leaders(&tracker, &[(1, &[]), (2, &[0])]);
    assert_eq!(
        aggregator.record_end_to_end_latency_at("held-failover", 0, 900, "zone-a", now),
        RecordOutcome::Flushed(1)
    );

    let labelled = aggregator
        .e2e_snapshot_at("held-failover", 0, "zone-a", now)
        .unwrap();
    assert_eq!(labelled.tags.broker, "2");
    assert_eq!(labelled.snapshot.total_count, 1);
    assert!((labelled.snapshot.percentiles[0].1 - 900.0).abs() < 1.0);
}

#[test]
fn test_failover_during_first_window_keeps_other_partitions() {
    let tracker = tracker_with(&[(1, &[0, 1]), (2, &[])]);
    let aggregator = LatencyAggregator::new(config(0, 3), tracker.clone());
    let now = Instant::now();

    aggregator.record_ack_latency_at("held-ack", 0, Duration::from_millis(8), now);
    aggregator.record_ack_latency_at("held-ack", 1, Duration::from_millis(9), now);
    // Only partition 0 moves.
    set_leaders(&tracker, &[(1, &[1]), (2, &[0])]);
    assert_eq!(
        aggregator.record_ack_latency_at("held-ack", 0, Duration::from_millis(30), now),
        RecordOutcome::Flushed(2)
    );

    let p0 = aggregator.ack_snapshot_at("held-ack", 0, now).unwrap();
    let p1 = aggregator.ack_snapshot_at("held-ack", 1, now).unwrap();
    assert_eq!((p0.tags.broker.as_str(), p0.snapshot.total_count), ("2", 1));
    assert_eq!((p1.tags.broker.as_str(), p1.snapshot.total_count), ("1", 1));
}

#[test]
fn test_concurrent_samples_follow_leader_change() {
    let tracker = tracker_with(&[(1, &[0]), (2, &[])]);
    let aggregator = LatencyAggregator::new(config(0, 0), tracker.clone());
    let switched = AtomicBool::new(false);
    const AFTER_SWITCH: u64 = 200;
    const THREADS: u64 = 4;

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                while !switched.load(Ordering::SeqCst) {
                    aggregator.record_end_to_end_latency("racing", 0, 5, "zone-a");
                }
                for _ in 0..AFTER_SWITCH {
                    aggregator.record_end_to_end_latency("racing", 0, 5, "zone-a");
                }
            });
        }
        std::thread::sleep(Duration::from_millis(20));
        set_leaders(&tracker, &[(1, &[]), (2, &[0])]);
        switched.store(true, Ordering::SeqCst);
    });

    // Once broker 2 took over, no sample may bring back a broker 1 summary
    // and drop what was recorded since.
    let labelled = aggregator
        .e2e_snapshot_at("racing", 0, "zone-a", Instant::now())
        .unwrap();
    assert_eq!(labelled.tags.broker, "2");
    assert!(
        labelled.snapshot.total_count >= THREADS * AFTER_SWITCH,
        "total_count = {}",
        labelled.snapshot.total_count
    );
}

#[test]
fn test_histogram_buckets_exported_when_enabled() {
    let tracker = tracker_with(&[(1, &[0]), (2, &[])]);
    let mut config = config(0, 0);
    config.e2e = config.e2e.with_histogram_buckets(true);
    let aggregator = LatencyAggregator::new(config, tracker.clone());
    let now = Instant::now();

    for latency in [3, 4, 15] {
        aggregator.record_end_to_end_latency_at("bucketed", 0, latency, "zone-a", now);
    }
    aggregator.publish_metrics();

    let bucket = |le: &str| -> Option<(String, i64)> {
        metrics::gather_metrics()
            .iter()
            .filter(|f| f.get_name() == "synth_client_e2e_latency_ms_bucket")
            .flat_map(|f| f.get_metric().iter())
            .find(|m| {
                let labels = m.get_label();
                labels
                    .iter()
                    .any(|l| l.get_name() == "topic" && l.get_value() == "bucketed")
                    && labels.iter().any(|l| l.get_name() == "le" && l.get_value() == le)
            })
            .map(|m| {
                let broker = m
                    .get_label()
                    .iter()
                    .find(|l| l.get_name() == "broker")
                    .map(|l| l.get_value().to_string())
                    .unwrap_or_default();
                (broker, m.get_gauge().get_value() as i64)
            })
    };
    assert_eq!(bucket("5"), Some(("1".to_string(), 2)));
    assert_eq!(bucket("20"), Some(("1".to_string(), 3)));
    assert_eq!(bucket("+Inf"), Some(("1".to_string(), 3)));

    set_leaders(&tracker, &[(1, &[]), (2, &[0])]);
    aggregator.record_end_to_end_latency_at("bucketed", 0, 700, "zone-a", now);
    aggregator.publish_metrics();
    assert_eq!(bucket("5"), Some(("2".to_string(), 0)));
    assert_eq!(bucket("1000"), Some(("2".to_string(), 1)));
    assert_eq!(exported_brokers("e2e_latency_ms_bucket", "bucketed"), vec!["2"]);
}

#[test]
fn test_ack_uses_configured_bounds_and_e2e_fixed_bounds() {
    let aggregator = LatencyAggregator::new(config(0, 0), tracker_with(&[(1, &[0])]));
    let now = Instant::now();

    aggregator.record_ack_latency_at("bounds", 0, Duration::from_millis(5_000), now);
    aggregator.record_end_to_end_latency_at("bounds", 0, 5_000, "zone-a", now);

    let ack = aggregator.ack_snapshot_at("bounds", 0, now).unwrap().snapshot;
    let e2e = aggregator
        .e2e_snapshot_at("bounds", 0, "zone-a", now)
        .unwrap()
        .snapshot;
    assert!((ack.window_max_ms - 100.0).abs() < 0.5, "ack max {}", ack.window_max_ms);
    assert!((e2e.window_max_ms - 5_000.0).abs() < 5.0, "e2e max {}", e2e.window_max_ms);
}

#[test]
fn test_percentiles_follow_recorded_distribution() {
    let aggregator = LatencyAggregator::new(config(0, 0), tracker_with(&[(1, &[0])]));
    let now = Instant::now();
    for latency in 1..=1000 {
        aggregator.record_end_to_end_latency_at("dist", 0, latency, "zone-a", now);
    }

    let snapshot = aggregator
        .e2e_snapshot_at("dist", 0, "zone-a", now)
        .unwrap()
        .snapshot;
    let p50 = snapshot.percentile(0.5).unwrap();
    let p99 = snapshot.percentile(0.99).unwrap();
    assert!((p50 - 500.0).abs() < 5.0, "p50 {}", p50);
    assert!((p99 - 990.0).abs() < 5.0, "p99 {}", p99);
}

#[test]
fn test_samples_age_out_of_the_window() {
    let aggregator = LatencyAggregator::new(config(0, 0), tracker_with(&[(1, &[0])]));
    let start = Instant::now();
    aggregator.record_end_to_end_latency_at("aging", 0, 15, "zone-a", start);

    let later = start + Duration::from_secs(61);
    let snapshot = aggregator
        .e2e_snapshot_at("aging", 0, "zone-a", later)
        .unwrap()
        .snapshot;
    assert_eq!(snapshot.window_count, 0);
    assert_eq!(snapshot.total_count, 1);
    assert_eq!(snapshot.percentile(0.5), Some(0.0));
}

#[test]
fn test_released_gate_without_topology_tags_unknown() {
    // A disabled rebalancer releases the gate without publishing a snapshot.
    let tracker = Arc::new(TopologyTracker::new());
    let aggregator = LatencyAggregator::new(config(0, 0), tracker.clone());
    assert_eq!(
        aggregator.record_end_to_end_latency("gated", 0, 10, "zone-a"),
        RecordOutcome::TopologyPending
    );

    tracker.mark_initial_refresh_done();
    assert_eq!(
        aggregator.record_end_to_end_latency("gated", 0, 10, "zone-a"),
        RecordOutcome::Recorded
    );
    let labelled = aggregator
        .e2e_snapshots()
        .into_iter()
        .find(|l| l.tags.topic == "gated")
        .unwrap();
    assert_eq!(labelled.tags.broker, "unknown");
    assert_eq!(labelled.tags.via_broker_rack, "unknown");
}

#[test]
fn test_snapshots_serialize_to_json_shape() {
    let aggregator = LatencyAggregator::new(config(0, 0), tracker_with(&[(3, &[0])]));
    aggregator.record_ack_latency("json", 0, Duration::from_millis(12));

    let snapshots = aggregator.ack_snapshots();
    assert_eq!(snapshots.len(), 1);
    let labelled = &snapshots[0];
    assert_eq!(labelled.tags.local_rack, "zone-local");
    assert_eq!(labelled.tags.via_broker_rack, "zone-3");
    assert_eq!(labelled.snapshot.percentiles.len(), 5);
}
