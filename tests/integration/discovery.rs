//! Membership and rules fetched from an HTTP control plane

use std::collections::HashMap;
use std::time::Duration;

use metric_transfer::app::App;
use metric_transfer::point::RawPoint;
use metric_transfer::stats::{self, Stats};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

async fn mount_instances(server: &MockServer, role: &str, instances: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/v1/n9e/instances"))
        .and(query_param("role", role))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"dat": instances, "err": ""})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_control_plane_membership_and_rules() {
    let (storage, judge) = (spawn_peer().await, spawn_peer().await);
    let now = now_secs();
    let control = MockServer::start().await;

    mount_instances(
        &control,
        "storage",
        json!([
            {"node": "S", "addr": storage.addr, "ts": now},
            {"node": "stale", "addr": "127.0.0.1:1", "ts": now - 3600}
        ]),
    )
    .await;
    mount_instances(&control, "judge", json!([{"node": "J", "addr": judge.addr, "ts": now}])).await;
    mount_instances(&control, "aggregation", json!([])).await;
    Mock::given(method("GET"))
        .and(path("/v1/n9e/rules"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "dat": {
                "rules": [{
                    "id": 7,
                    "filters": [{"endpoint": "api-1", "metric": "req.latency"}],
                    "predicate": [{"key": "method", "op": "=", "values": ["GET"]}]
                }],
                "endpoints": ["api-1"]
            },
            "err": ""
        })))
        .mount(&control)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/n9e/heartbeat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"dat": {"now_ms": now * 1000}, "err": ""})))
        .mount(&control)
        .await;

    let mut config = test_config(HashMap::new());
    config.discovery.addrs = vec![control.uri()];
    config.routing.addrs = vec![control.uri()];
    config.heartbeat.interval = Duration::from_millis(50);
    let app = App::start_with(config, test_clock(), Stats::new()).await.unwrap();

    // the stale instance is past the liveness window
    let view = app.membership().storage();
    assert_eq!(view.addrs().keys().collect::<Vec<_>>(), vec!["S"]);

    app.ingestor()
        .push(vec![
            RawPoint::new("api-1", "req.latency", 12.0, now).with_tag("method", "GET"),
            RawPoint::new("api-1", "req.latency", 30.0, now).with_tag("method", "POST"),
        ])
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || storage.recorder.stored_len() == 2).await);
    assert!(wait_until(Duration::from_secs(5), || judge.recorder.judged.lock().len() == 1).await);
    assert_eq!(judge.recorder.judged.lock()[0].rule_id, 7);

    let control_ref = &control;
    let beats = wait_until_async(Duration::from_secs(5), || async move {
        control_ref
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .any(|r| r.url.path() == "/v1/n9e/heartbeat")
    })
    .await;
    assert!(beats);

    assert!(app.shutdown().await);
}

#[tokio::test]
async fn test_unreachable_control_plane_is_counted() {
    let control = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&control)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&control)
        .await;

    let mut config = test_config(HashMap::new());
    config.discovery.addrs = vec![control.uri()];
    let app = App::start_with(config, test_clock(), Stats::new()).await.unwrap();

    assert!(app.stats().get(stats::DISCOVERY_ERR) >= 3);
    assert!(app.membership().storage().is_empty());
    assert!(app.shutdown().await);
}
