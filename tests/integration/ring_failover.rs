//! Storage membership changes applied through a reload

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use metric_transfer::app::App;
use metric_transfer::cluster::Role;
use metric_transfer::point::RawPoint;
use metric_transfer::stats::Stats;
use pretty_assertions::assert_eq;

use crate::helpers::*;

fn batch(ts: i64) -> Vec<RawPoint> {
    (0..90)
        .map(|i| RawPoint::new(format!("host-{i}"), "mem.used", i as f64, ts))
        .collect()
}

fn drain(peer: &Peer) -> BTreeSet<String> {
    peer.recorder.stored.lock().drain(..).map(|p| p.canonical()).collect()
}

#[tokio::test]
async fn test_removed_node_only_moves_its_own_series() {
    let (a, b, c) = (spawn_peer().await, spawn_peer().await, spawn_peer().await);
    let mut config = test_config(HashMap::from([(
        Role::Storage,
        vec![instance("A", &a.addr), instance("B", &b.addr), instance("C", &c.addr)],
    )]));
    let app = App::start_with(config.clone(), test_clock(), Stats::new()).await.unwrap();

    let ts = now_secs();
    app.ingestor().push(batch(ts)).unwrap();
    let total = || a.recorder.stored_len() + b.recorder.stored_len() + c.recorder.stored_len();
    assert!(wait_until(Duration::from_secs(5), || total() == 90).await);
    let (before_a, before_b, before_c) = (drain(&a), drain(&b), drain(&c));
    assert!(!before_c.is_empty());

    config.discovery.members = HashMap::from([(Role::Storage, vec![instance("A", &a.addr), instance("B", &b.addr)])]);
    app.reload(&config).await.unwrap();
    assert_eq!(app.membership().storage().addrs().len(), 2);

    // the departed destination is retired with its queue
    let mut expected = vec![a.addr.clone(), b.addr.clone()];
    expected.sort();
    assert_eq!(app.dispatcher().storage().keys(), expected);

    app.ingestor().push(batch(ts + 10)).unwrap();
    assert!(wait_until(Duration::from_secs(5), || total() == 90).await);
    let (after_a, after_b) = (drain(&a), drain(&b));

    assert!(c.recorder.stored.lock().is_empty());
    assert!(after_a.is_superset(&before_a));
    assert!(after_b.is_superset(&before_b));
    assert_eq!(after_a.len() + after_b.len(), 90);
    assert!(app.shutdown().await);
}

#[tokio::test]
async fn test_empty_discovery_keeps_previous_view() {
    let a = spawn_peer().await;
    let mut config = test_config(HashMap::from([(Role::Storage, vec![instance("A", &a.addr)])]));
    let app = App::start_with(config.clone(), test_clock(), Stats::new()).await.unwrap();

    config.discovery.members = HashMap::new();
    app.reload(&config).await.unwrap();
    assert_eq!(app.membership().storage().addrs().len(), 1);

    app.ingestor()
        .push(vec![RawPoint::new("host-a", "cpu.idle", 1.0, now_secs())])
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || a.recorder.stored_len() == 1).await);
    assert!(app.shutdown().await);
}
