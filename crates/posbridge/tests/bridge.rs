// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end bridge tests over the in-memory broker.

use posbridge::channel::ConfigChannel;
use posbridge::config::{BridgeConfig, EndpointConfig};
use posbridge::connection::ConnectionError;
use posbridge::mock::{MockBroker, MockTransport};
use posbridge::source::FileSource;
use posbridge::{Bridge, OutputUnit, Shutdown, TransformParameters};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn site_transform() -> TransformParameters {
    TransformParameters::new(23469.39, 30305.22, 0.0414, -0.4363).flipped(true, true)
}

fn two_broker_config() -> BridgeConfig {
    let mut config = BridgeConfig::new(
        EndpointConfig::new("uwb.local", "bridge-in").topic("tags/+"),
        site_transform(),
    );
    config.destination = Some(EndpointConfig::new("cloud.local", "bridge-out"));
    config.routing.stats_interval_secs = 0;
    config
}

fn published_json(broker: &MockBroker) -> Vec<(String, Value)> {
    broker
        .published()
        .into_iter()
        .map(|p| {
            let value = serde_json::from_slice(&p.payload).expect("json payload");
            (p.topic, value)
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_two_broker_round_trip() {
    let (src, src_broker) = MockTransport::new();
    let (dst, dst_broker) = MockTransport::new();
    src_broker.connect_ack();
    dst_broker.connect_ack();

    let bridge = Bridge::with_transports(two_broker_config(), src, Some(dst)).expect("bridge");
    bridge.start().await.expect("start");
    assert_eq!(src_broker.subscriptions(), vec!["tags/+".to_string()]);

    src_broker.deliver(
        "tags/raw",
        br#"{"x":4396,"y":17537,"z":1200,"tagId":"0x1234"}"#.to_vec(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let out = published_json(&dst_broker);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, "processed/0x1234");
    assert!((out[0].1["x"].as_f64().expect("x") - 11.89).abs() < 0.01);
    assert!((out[0].1["y"].as_f64().expect("y") - 19.63).abs() < 0.01);
    assert_eq!(out[0].1["z"], json!(1.2));
    assert!(src_broker.published().is_empty());

    bridge.stop().await;
    assert!(src_broker.disconnected());
    assert!(dst_broker.disconnected());
    assert_eq!(src_broker.unsubscriptions(), vec!["tags/+".to_string()]);

    let stats = bridge.stats();
    assert_eq!((stats.total, stats.success), (1, 1));
    let (src_counters, dst_counters) = bridge.connection_counters();
    assert_eq!(src_counters.received, 1);
    assert_eq!(dst_counters.map(|c| c.published), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_single_broker_publishes_on_source() {
    let (src, src_broker) = MockTransport::new();
    src_broker.connect_ack();
    let mut config = two_broker_config();
    config.destination = None;

    let bridge = Bridge::with_transports(config, src, None).expect("bridge");
    bridge.start().await.expect("start");

    src_broker.deliver("tags/7", br#"{"coordinates":{"x":1,"y":2}}"#.to_vec());
    tokio::time::sleep(Duration::from_millis(50)).await;
    bridge.stop().await;

    let out = published_json(&src_broker);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].0, "processed/7");
    assert_eq!(out[0].1["frame_id"], json!("floorplan_pixel_frame"));
}

#[tokio::test(start_paused = true)]
async fn test_transport_mismatch_rejected() {
    let (src, _) = MockTransport::new();
    assert!(Bridge::with_transports(two_broker_config(), src, None).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_fatal_source_ends_run() {
    let (src, src_broker) = MockTransport::new();
    let (dst, dst_broker) = MockTransport::new();
    dst_broker.connect_ack();
    src_broker.connect_ack();
    for _ in 0..11 {
        src_broker.fail("connection reset");
    }

    let mut config = two_broker_config();
    config.source.reconnect.max_attempts = 10;
    let bridge = Bridge::with_transports(config, src, Some(dst)).expect("bridge");
    bridge.start().await.expect("start");

    let outcome = bridge.run_until(std::future::pending()).await;
    assert!(matches!(
        outcome,
        Shutdown::Fatal(ConnectionError::ReconnectExhausted { attempts: 10, .. })
    ));
    bridge.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_requested_shutdown() {
    let (src, src_broker) = MockTransport::new();
    let (dst, dst_broker) = MockTransport::new();
    src_broker.connect_ack();
    dst_broker.connect_ack();

    let bridge = Bridge::with_transports(two_broker_config(), src, Some(dst)).expect("bridge");
    bridge.start().await.expect("start");
    let outcome = bridge
        .run_until(tokio::time::sleep(Duration::from_secs(1)))
        .await;
    assert_eq!(outcome, Shutdown::Requested);
    bridge.stop().await;

    src_broker.deliver("tags/1", br#"{"x":1,"y":2}"#.to_vec());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(dst_broker.published().is_empty());
}

#[tokio::test]
async fn test_live_transform_update() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("transform.json");
    std::fs::write(
        &path,
        json!({"origin_x": 0.0, "origin_y": 0.0, "scale": 1.0, "output_unit": "millimeters"}).to_string(),
    )
    .expect("write");

    let (src, src_broker) = MockTransport::new();
    let (dst, dst_broker) = MockTransport::new();
    src_broker.connect_ack();
    dst_broker.connect_ack();

    let bridge = Bridge::with_transports(two_broker_config(), src, Some(dst)).expect("bridge");
    bridge.start().await.expect("start");

    let source = FileSource::new(dir.path()).poll_interval(Duration::from_millis(20));
    let channel = ConfigChannel::new(Arc::new(source));
    bridge.attach_updates(&channel).await.expect("attach");

    let engine = bridge.engine();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while engine.parameters().output_unit != OutputUnit::Millimeters {
        assert!(tokio::time::Instant::now() < deadline, "update never applied");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    src_broker.deliver("tags/a", br#"{"x":100,"y":-50}"#.to_vec());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while dst_broker.published().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "nothing published");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let out = published_json(&dst_broker);
    assert_eq!(out[0].1["x"], json!(100.0));
    assert_eq!(out[0].1["y"], json!(-50.0));
    assert_eq!(out[0].1["output_unit"], json!("millimeters"));

    bridge.stop().await;
}
