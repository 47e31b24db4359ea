//! Points fanned out to HTTP storage backends

use std::collections::HashMap;
use std::time::Duration;

use metric_transfer::adapters::{BackendConfig, InfluxDbConfig, M3DbConfig};
use metric_transfer::app::App;
use metric_transfer::point::RawPoint;
use metric_transfer::stats::{self, Stats};
use serde_json::Value;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_points_reach_influxdb_and_m3db() {
    let influx = MockServer::start().await;
    let m3 = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/write"))
        .and(query_param("db", "metrics"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&influx)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/json/write"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&m3)
        .await;

    let mut config = test_config(HashMap::new());
    config.storage.backends = vec![
        BackendConfig::Influxdb(InfluxDbConfig {
            name: "influx".to_string(),
            url: influx.uri(),
            database: "metrics".to_string(),
            username: None,
            password: None,
            timeout: Duration::from_secs(2),
        }),
        BackendConfig::M3db(M3DbConfig {
            name: "m3".to_string(),
            url: m3.uri(),
            timeout: Duration::from_secs(2),
        }),
    ];
    let app = App::start_with(config, test_clock(), Stats::new()).await.unwrap();

    let ts = now_secs();
    app.ingestor()
        .push(vec![
            RawPoint::new("host-a", "net.in", 100.0, ts).with_tag("iface", "eth0"),
            RawPoint::new("host-b", "net.in", 50.0, ts).with_tag("iface", "eth0"),
        ])
        .unwrap();

    let (influx_ref, m3_ref) = (&influx, &m3);
    let delivered = wait_until_async(Duration::from_secs(5), || async move {
        let influx_lines: usize = influx_ref
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|r| String::from_utf8_lossy(&r.body).lines().count())
            .sum();
        let m3_writes = m3_ref.received_requests().await.unwrap_or_default().len();
        influx_lines == 2 && m3_writes == 2
    })
    .await;
    assert!(delivered);

    let influx_body: String = influx
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .collect();
    assert!(influx_body.contains("net.in,endpoint=host-a,iface=eth0 value=100"), "{influx_body}");

    let m3_requests = m3.received_requests().await.unwrap();
    let m3_body: Value = serde_json::from_slice(&m3_requests[0].body).unwrap();
    assert_eq!(m3_body["tags"]["__name__"], "net_in");
    assert_eq!(m3_body["timestamp"], ts.to_string());

    assert!(app.shutdown().await);
}

#[tokio::test]
async fn test_failing_backend_counts_errors() {
    let influx = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/write"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database not found"))
        .mount(&influx)
        .await;

    let mut config = test_config(HashMap::new());
    config.storage.backends = vec![BackendConfig::Influxdb(InfluxDbConfig {
        name: "influx".to_string(),
        url: influx.uri(),
        database: "missing".to_string(),
        username: None,
        password: None,
        timeout: Duration::from_secs(2),
    })];
    let app = App::start_with(config, test_clock(), Stats::new()).await.unwrap();

    app.ingestor()
        .push(vec![RawPoint::new("host-a", "cpu.idle", 1.0, now_secs())])
        .unwrap();

    let stats = app.stats().clone();
    assert!(wait_until(Duration::from_secs(10), || stats.get(stats::POINTS_OUT_ERR) > 0).await);
    assert!(app.shutdown().await);
}
