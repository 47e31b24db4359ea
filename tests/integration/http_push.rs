//! HTTP ingestion edge against a running transfer

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use flate2::{Compression, write::GzEncoder};
use metric_transfer::app::App;
use metric_transfer::cluster::Role;
use metric_transfer::stats::{self, Stats};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use crate::helpers::*;

async fn start() -> (App, Peer, String) {
    let storage = spawn_peer().await;
    let members = HashMap::from([(Role::Storage, vec![instance("S", &storage.addr)])]);
    let app = App::start_with(test_config(members), test_clock(), Stats::new()).await.unwrap();
    let base = format!("http://{}", app.http_addr().unwrap());
    (app, storage, base)
}

#[tokio::test]
async fn test_push_json_array() {
    let (app, storage, base) = start().await;
    let ts = now_secs();

    let response = reqwest::Client::new()
        .post(format!("{base}/api/transfer/push"))
        .json(&json!([
            {"endpoint": "host-a", "metric": "disk.used", "value": 10.5, "timestamp": ts, "tags": "mount=/data"},
            {"endpoint": "host-a", "metric": "disk.free", "value": "4", "timestamp": ts, "step": 30,
             "counterType": "GAUGE", "tags": {"mount": "/data"}}
        ]))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"data": "ok"}));

    assert!(wait_until(Duration::from_secs(5), || storage.recorder.stored_len() == 2).await);
    assert_eq!(
        storage.recorder.stored_canonicals(),
        vec!["host-a/disk.free/mount=/data", "host-a/disk.used/mount=/data"]
    );
    assert!(app.shutdown().await);
}

#[tokio::test]
async fn test_push_gzip_body() {
    let (app, storage, base) = start().await;
    let payload = json!([{"endpoint": "host-b", "metric": "load.1", "value": 0.7, "timestamp": now_secs()}]);

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload.to_string().as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();

    let response = reqwest::Client::new()
        .post(format!("{base}/api/transfer/push"))
        .header("Content-Encoding", "gzip")
        .header("Content-Type", "application/json")
        .body(compressed)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert!(wait_until(Duration::from_secs(5), || storage.recorder.stored_len() == 1).await);
    assert!(app.shutdown().await);
}

#[tokio::test]
async fn test_push_with_invalid_points_returns_summary() {
    let (app, _storage, base) = start().await;
    let ts = now_secs();

    let body: Value = reqwest::Client::new()
        .post(format!("{base}/api/transfer/push"))
        .json(&json!([
            {"endpoint": "host-a", "metric": "ok.metric", "value": 1, "timestamp": ts},
            {"endpoint": "", "metric": "no.identity", "value": 1, "timestamp": ts},
            {"endpoint": "host-a", "metric": "bad.tag", "value": 1, "timestamp": ts, "tags": "a.b=c"}
        ]))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let summary = body["data"].as_str().unwrap();
    assert!(summary.contains("point 1"), "{summary}");
    assert!(summary.contains("point 2"), "{summary}");
    assert!(!summary.contains("point 0"), "{summary}");
    assert_eq!(app.stats().get(stats::POINTS_IN_ERR), 2);
    assert!(app.shutdown().await);
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let (app, _storage, base) = start().await;

    let response = reqwest::Client::new()
        .post(format!("{base}/api/transfer/push"))
        .body("{\"not\": \"an array\"}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("invalid JSON"));
    assert!(app.shutdown().await);
}

#[tokio::test]
async fn test_ping_and_stats() {
    let (app, _storage, base) = start().await;
    let client = reqwest::Client::new();

    let ping: Value = client
        .get(format!("{base}/api/transfer/ping"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ping, json!({"data": "pong"}));

    client
        .post(format!("{base}/api/transfer/push"))
        .json(&json!([{"endpoint": "h", "metric": "m", "value": 1, "timestamp": now_secs()}]))
        .send()
        .await
        .unwrap();

    let report: Value = client
        .get(format!("{base}/api/transfer/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["data"]["counters"][stats::POINTS_IN], 1);
    assert_eq!(report["data"]["accepting"], true);
    assert!(report["data"]["timestamp"].is_string());
    assert!(app.shutdown().await);
}

#[tokio::test]
async fn test_query_without_storage_is_unavailable() {
    let app = App::start_with(test_config(HashMap::new()), test_clock(), Stats::new())
        .await
        .unwrap();
    let base = format!("http://{}", app.http_addr().unwrap());

    let response = reqwest::Client::new()
        .post(format!("{base}/api/transfer/data"))
        .json(&json!([{
            "start": 0, "end": 100, "consolidation": "AVERAGE",
            "endpoint": "host-a", "counter": "cpu.idle", "step": 10
        }]))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    assert!(app.shutdown().await);
}
