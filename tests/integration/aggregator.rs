//! Statsd pre-aggregation, in process and over UDP

use std::collections::HashMap;
use std::time::Duration;

use metric_transfer::app::App;
use metric_transfer::clock::Clock;
use metric_transfer::cluster::Role;
use metric_transfer::point::Point;
use metric_transfer::stats::{self, Stats};
use metric_transfer::statsd::{ROLL_SECS, StatsdAggregator, window_start};
use rand::seq::SliceRandom;
use tokio::net::UdpSocket;

use crate::helpers::*;

fn percentile(points: &[Point], tag: &str) -> f64 {
    points
        .iter()
        .find(|p| p.metric == "latency.latency" && p.tags.get("percentile").map(String::as_str) == Some(tag))
        .map(|p| p.value)
        .unwrap_or_else(|| panic!("no p{tag} in {points:?}"))
}

#[tokio::test]
async fn test_percentiles_over_a_window() {
    let stats = Stats::new();
    let aggregator = StatsdAggregator::new(Clock::manual(1_700_000_003), &stats);

    let mut values: Vec<u32> = (1..=1000).collect();
    values.shuffle(&mut rand::rng());
    for v in values {
        aggregator
            .collect_packet(&format!("{v}\ncheckout/latency\nregion=eu|p95,p99,max,cnt"))
            .unwrap();
    }

    let rolled = aggregator.roll().await;
    let points = rolled.emit("ignored");

    assert_eq!(rolled.window(), 1_700_000_000);
    assert!((percentile(&points, "95") - 950.0).abs() <= 10.0);
    assert!((percentile(&points, "99") - 990.0).abs() <= 10.0);
    assert_eq!(percentile(&points, "max"), 1000.0);
    assert_eq!(percentile(&points, "cnt"), 1000.0);

    for point in &points {
        assert_eq!(point.identity.key(), "checkout");
        assert_eq!(point.timestamp, 1_700_000_000);
        assert_eq!(point.step, ROLL_SECS as u32);
        assert_eq!(point.tags.get("region").map(String::as_str), Some("eu"));
    }
    assert_eq!(stats.get(stats::STATSD_PACKETS), 1000);
}

#[tokio::test]
async fn test_packets_after_a_roll_land_in_the_next_window() {
    let clock = Clock::manual(1_700_000_005);
    let aggregator = StatsdAggregator::new(clock.clone(), &Stats::new());

    aggregator.collect_packet("1\nq\n|c").unwrap();
    let first = aggregator.roll_at(window_start(1_700_000_010)).await;
    aggregator.collect_packet("2\nq\n|c").unwrap();
    let second = aggregator.roll_at(window_start(1_700_000_020)).await;

    assert_eq!(first.emit("h")[0].value, 1.0);
    assert_eq!(second.window(), 1_700_000_010);
    assert_eq!(second.emit("h")[0].value, 2.0);
    assert_eq!(aggregator.live_len(), 0);
}

#[tokio::test]
async fn test_udp_packets_are_flushed_on_shutdown() {
    let storage = spawn_peer().await;
    let members = HashMap::from([(Role::Storage, vec![instance("S", &storage.addr)])]);
    let mut config = test_config(members);
    config.statsd.listen = Some("127.0.0.1:0".to_string());
    config.statsd.endpoint = Some("edge-host".to_string());
    let app = App::start_with(config, test_clock(), Stats::new()).await.unwrap();
    let statsd_addr = app.statsd_addr().unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(b"5\nshop/orders\nregion=eu|c\n3\nqueue.depth\n|g", statsd_addr)
        .await
        .unwrap();

    let stats = app.stats().clone();
    assert!(wait_until(Duration::from_secs(5), || stats.get(stats::STATSD_PACKETS) == 2).await);
    assert!(app.shutdown().await);

    let mut stored: Vec<(String, String, f64)> = storage
        .recorder
        .stored
        .lock()
        .iter()
        .map(|p| (p.identity.key().into_owned(), p.metric.clone(), p.value))
        .collect();
    stored.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(
        stored,
        vec![
            ("edge-host".to_string(), "queue.depth.gauge".to_string(), 3.0),
            ("shop".to_string(), "orders.counter".to_string(), 5.0),
        ]
    );
}
