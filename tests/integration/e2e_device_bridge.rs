//! End-to-end: device engine over the WebSocket bridge.
//!
//! A mock bridge server plays the cloud side. The device connects with the
//! default bridge transport, receives config as a bridge frame, and answers
//! with state, telemetry, and trace files.
//!
//! # Coverage
//! - Config gate: state only after config arrives over the bridge.
//! - Periodic tick: pointset event carries the configured set value.
//! - Trace output: config and state mirrored under `{out_dir}/{serial_no}`.
//! - Bridge drop: the device reconnects and resyncs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use udmi_conformance::pubber::{LoadedSiteModel, Pubber, PubberConfig};
use udmi_conformance::schema::{EndpointConfiguration, Metadata, PointPointsetModel, PointsetModel};
use udmi_test_utils::{MockBridgeServer, ReceivedFrame};

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

const CLIENT: &str = "projects/p/locations/us-central1/registries/ZZ/devices/AHU-1";

fn device_config(dir: &Path, server: &MockBridgeServer) -> PubberConfig {
    let mut config = PubberConfig::for_device("AHU-1");
    config.persist_dir = Some(dir.to_path_buf());
    config.out_dir = dir.join("out");
    config.report_interval = Duration::from_secs(3600);
    config.endpoint = Some(EndpointConfiguration {
        hostname: Some("127.0.0.1".to_owned()),
        port: Some(server.local_addr().port()),
        client_id: Some(CLIENT.to_owned()),
        ..EndpointConfiguration::default()
    });
    config
}

fn device_config_doc() -> serde_json::Value {
    json!({
        "timestamp": "2024-05-01T12:00:00Z",
        "system": { "min_loglevel": 300 },
        "pointset": {
            "points": { "room_temp": { "set_value": 21.5 } }
        }
    })
}

fn site_model() -> LoadedSiteModel {
    let metadata = Metadata {
        pointset: Some(PointsetModel {
            points: [("room_temp".to_owned(), PointPointsetModel::default())].into(),
        }),
        ..Default::default()
    };
    LoadedSiteModel::new().with_device("AHU-1", metadata)
}

async fn wait_for_clients(server: &MockBridgeServer, count: usize) {
    for _ in 0..400 {
        if server.client_ids().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("bridge never saw {count} client(s)");
}

/// Wait for the `nth` (0-based) frame whose topic ends with `suffix`.
async fn wait_for_topic(server: &MockBridgeServer, suffix: &str, nth: usize) -> ReceivedFrame {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let matching: Vec<ReceivedFrame> = server
            .received()
            .into_iter()
            .filter(|f| f.topic.ends_with(suffix))
            .collect();
        if let Some(frame) = matching.get(nth) {
            return frame.clone();
        }
        assert!(tokio::time::Instant::now() < deadline, "no {suffix} frame #{nth}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Start the device while the bridge pushes config to the first client.
async fn start_with_config(pubber: &Pubber, server: &MockBridgeServer) {
    let (started, ()) = tokio::join!(pubber.start(), async {
        wait_for_clients(server, 1).await;
        server.send_to_all("/devices/AHU-1/config", device_config_doc());
    });
    started.expect("device start");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn state_follows_config_over_bridge() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockBridgeServer::start().await.expect("bridge");
    let pubber = Pubber::builder(device_config(dir.path(), &server))
        .build()
        .expect("build");

    start_with_config(&pubber, &server).await;

    let state = wait_for_topic(&server, "/state", 0).await;
    assert_eq!(state.client_id, CLIENT);
    assert_eq!(state.topic, "/devices/AHU-1/state");
    let last_config: DateTime<Utc> = state.payload["system"]["last_config"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .expect("last_config");
    assert_eq!(last_config, "2024-05-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap());
    assert!(state.payload["pointset"]["points"]["room_temp"].is_object());

    pubber.stop().await.expect("stop");
}

#[tokio::test]
async fn tick_sends_pointset_event_and_traces() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockBridgeServer::start().await.expect("bridge");
    let pubber = Pubber::builder(device_config(dir.path(), &server))
        .site_model(Arc::new(site_model()))
        .build()
        .expect("build");
    start_with_config(&pubber, &server).await;

    pubber.tick().await.expect("tick");

    let event = wait_for_topic(&server, "/events/pointset", 0).await;
    assert_eq!(event.payload["points"]["room_temp"]["present_value"], 21.5);

    let trace_dir = dir.path().join("out").join("sn-AHU-1");
    assert!(trace_dir.join("config.json").exists());
    assert!(trace_dir.join("events_pointset.json").exists());

    pubber.stop().await.expect("stop");
}

#[tokio::test]
async fn dropped_bridge_connection_resyncs() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockBridgeServer::start().await.expect("bridge");
    let pubber = Pubber::builder(device_config(dir.path(), &server))
        .build()
        .expect("build");
    start_with_config(&pubber, &server).await;
    wait_for_topic(&server, "/state", 0).await;

    server.drop_clients();
    // Registrations are dropped with the clients; the reconnect adds one.
    wait_for_clients(&server, 1).await;
    server.send_to_all("/devices/AHU-1/config", device_config_doc());

    let resynced = wait_for_topic(&server, "/state", 1).await;
    assert_eq!(resynced.client_id, CLIENT);
    assert!(resynced.payload["system"]["last_config"].is_string());
    assert!(pubber.lifecycle().borrow().is_none());

    pubber.stop().await.expect("stop");
}
