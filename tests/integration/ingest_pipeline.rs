//! Points pushed into a running transfer end up on the right peers

use std::collections::HashMap;
use std::time::Duration;

use metric_transfer::app::App;
use metric_transfer::clock::Clock;
use metric_transfer::cluster::Role;
use metric_transfer::point::RawPoint;
use metric_transfer::queue::{BoundedQueue, OverflowPolicy, QueueConfig};
use metric_transfer::routing::{Rule, RuleFilter, RuleKind, RuleSet, TagPredicate};
use metric_transfer::rpc::{PoolConfig, PoolRegistry, Request, Response};
use metric_transfer::stats::{self, Stats};
use pretty_assertions::assert_eq;

use crate::helpers::*;

#[tokio::test]
async fn test_points_reach_every_replica_of_their_node() {
    let (a1, a2, b) = (spawn_peer().await, spawn_peer().await, spawn_peer().await);
    let members = HashMap::from([(
        Role::Storage,
        vec![instance("A", &a1.addr), instance("A", &a2.addr), instance("B", &b.addr)],
    )]);
    let app = App::start_with(test_config(members), test_clock(), Stats::new()).await.unwrap();

    let ts = now_secs();
    let points: Vec<RawPoint> = (0..60)
        .map(|i| RawPoint::new(format!("host-{i}"), "cpu.idle", i as f64, ts).with_tag("core", "0"))
        .collect();
    let summary = app.ingestor().push(points).unwrap();
    assert_eq!(summary.invalid, 0);

    let delivered = wait_until(Duration::from_secs(5), || {
        a1.recorder.stored_len() + b.recorder.stored_len() == 60 && a2.recorder.stored_len() == a1.recorder.stored_len()
    })
    .await;
    assert!(delivered, "a1={} a2={} b={}", a1.recorder.stored_len(), a2.recorder.stored_len(), b.recorder.stored_len());

    // both replicas of node A hold the same series
    assert_eq!(a1.recorder.stored_canonicals(), a2.recorder.stored_canonicals());
    assert!(app.shutdown().await);
}

#[tokio::test]
async fn test_rpc_push_reports_invalid_points() {
    let storage = spawn_peer().await;
    let members = HashMap::from([(Role::Storage, vec![instance("S", &storage.addr)])]);
    let app = App::start_with(test_config(members), test_clock(), Stats::new()).await.unwrap();
    let rpc_addr = app.rpc_addr().unwrap().to_string();

    let ts = now_secs();
    let pools = PoolRegistry::new(PoolConfig::default(), Stats::new());
    let request = Request::Push(vec![
        RawPoint::new("host-a", "mem.used", 1.0, ts),
        RawPoint::new("host-a", "", 1.0, ts),
        RawPoint::new("host-a", "mem.free", 1.0, ts - 30 * 86_400),
    ]);

    let Response::Push(summary) = pools.call(&rpc_addr, &request).await.unwrap() else {
        panic!("expected a push summary");
    };
    assert_eq!(summary.total_received, 3);
    assert_eq!(summary.invalid, 2);
    assert!(summary.message.contains("point 1"), "{}", summary.message);
    assert!(summary.message.contains("point 2"), "{}", summary.message);

    assert!(wait_until(Duration::from_secs(5), || storage.recorder.stored_len() == 1).await);
    assert_eq!(app.stats().get(stats::POINTS_IN_ERR), 2);
    assert!(app.shutdown().await);
}

#[tokio::test]
async fn test_alert_rule_forwards_to_judge() {
    let (storage, judge) = (spawn_peer().await, spawn_peer().await);
    let members = HashMap::from([
        (Role::Storage, vec![instance("S", &storage.addr)]),
        (Role::Judge, vec![instance("J", &judge.addr)]),
    ]);
    let mut config = test_config(members);
    config.rules = RuleSet {
        rules: vec![Rule {
            id: 42,
            kind: RuleKind::Alert,
            filters: vec![RuleFilter {
                identity: "web-*".to_string(),
                metric: "http.5xx".to_string(),
            }],
            predicate: TagPredicate::equals("dc", &["eu"]),
        }],
        endpoints: vec!["web-1".to_string(), "web-2".to_string(), "db-1".to_string()],
    };
    let app = App::start_with(config, test_clock(), Stats::new()).await.unwrap();

    let ts = now_secs();
    app.ingestor()
        .push(vec![
            RawPoint::new("web-1", "http.5xx", 3.0, ts).with_tag("dc", "eu"),
            RawPoint::new("web-2", "http.5xx", 1.0, ts).with_tag("dc", "us"),
            RawPoint::new("db-1", "http.5xx", 1.0, ts).with_tag("dc", "eu"),
        ])
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || storage.recorder.stored_len() == 3).await);
    assert!(wait_until(Duration::from_secs(5), || judge.recorder.judged.lock().len() == 1).await);

    let judged = judge.recorder.judged.lock().clone();
    assert_eq!(judged[0].rule_id, 42);
    assert_eq!(judged[0].point.canonical(), "web-1/http.5xx/dc=eu");
    assert!(app.shutdown().await);
}

#[tokio::test]
async fn test_counters_are_reported_as_points() {
    let storage = spawn_peer().await;
    let mut config = test_config(HashMap::from([(Role::Storage, vec![instance("S", &storage.addr)])]));
    config.stats.interval = Duration::from_millis(50);
    config.stats.push_self = true;
    let app = App::start_with(config, test_clock(), Stats::new()).await.unwrap();

    app.ingestor()
        .push(vec![RawPoint::new("host-a", "cpu.idle", 1.0, now_secs())])
        .unwrap();

    let reported = wait_until(Duration::from_secs(5), || {
        storage
            .recorder
            .stored
            .lock()
            .iter()
            .any(|p| p.metric == "transfer.points.in" && p.value >= 1.0)
    })
    .await;
    assert!(reported);
    assert!(app.shutdown().await);
}

#[test]
fn test_full_queue_drops_oldest() {
    let stats = Stats::new();
    let queue = BoundedQueue::new(
        QueueConfig {
            capacity: 4,
            overflow: OverflowPolicy::DropOldest,
        },
        stats.counter(stats::STORAGE_QUEUE_DROP),
        Clock::manual(0),
    );

    for i in 0..10 {
        assert!(queue.push(i));
    }

    assert_eq!(queue.len(), 4);
    assert_eq!(queue.pop_batch(10), vec![6, 7, 8, 9]);
    assert_eq!(queue.dropped(), 6);
    assert_eq!(stats.get(stats::STORAGE_QUEUE_DROP), 6);
}

#[test]
fn test_full_queue_rejects_when_configured() {
    let stats = Stats::new();
    let queue = BoundedQueue::new(
        QueueConfig {
            capacity: 2,
            overflow: OverflowPolicy::Reject,
        },
        stats.counter(stats::STORAGE_QUEUE_DROP),
        Clock::manual(0),
    );

    assert!(queue.push("a"));
    assert!(queue.push("b"));
    assert!(!queue.push("c"));
    assert_eq!(queue.pop_batch(10), vec!["a", "b"]);
    assert_eq!(stats.get(stats::STORAGE_QUEUE_DROP), 1);
}
