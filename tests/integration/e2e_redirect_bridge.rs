//! End-to-end: endpoint redirection between two bridge servers.
//!
//! The home bridge delivers a config whose `_iot_endpoint_config` blob points
//! at a second bridge. On the next tick the device moves there, resyncs, and
//! persists the new endpoint; an unreachable target sends it back home.

use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use udmi_conformance::pubber::redirect::DATA_URL_JSON_BASE64;
use udmi_conformance::pubber::{PersistentStore, Pubber, PubberConfig};
use udmi_conformance::schema::EndpointConfiguration;
use udmi_test_utils::MockBridgeServer;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

const HOME_CLIENT: &str = "projects/p/locations/us-central1/registries/ZZ/devices/AHU-1";
const AWAY_CLIENT: &str = "projects/p/locations/us-central1/registries/YY/devices/AHU-1";

fn home_endpoint(port: u16) -> EndpointConfiguration {
    EndpointConfiguration {
        hostname: Some("127.0.0.1".to_owned()),
        port: Some(port),
        client_id: Some(HOME_CLIENT.to_owned()),
        ..EndpointConfiguration::default()
    }
}

fn device_config(dir: &Path, home_port: u16) -> PubberConfig {
    let mut config = PubberConfig::for_device("AHU-1");
    config.persist_dir = Some(dir.to_path_buf());
    config.out_dir = dir.join("out");
    config.report_interval = Duration::from_secs(3600);
    config.timing.connect_retries = 2;
    config.endpoint = Some(home_endpoint(home_port));
    config
}

/// Config carrying a final-phase endpoint blob for `port`.
fn redirect_config(port: u16) -> Value {
    let target = json!({
        "protocol": "mqtt",
        "hostname": "127.0.0.1",
        "port": port,
        "client_id": AWAY_CLIENT
    });
    let data = serde_json::to_vec(&target).unwrap();
    json!({
        "timestamp": "2024-05-01T12:00:00Z",
        "blobset": {
            "blobs": {
                "_iot_endpoint_config": {
                    "phase": "final",
                    "generation": "2024-05-01T11:00:00Z",
                    "url": format!("{DATA_URL_JSON_BASE64}{}", BASE64_STANDARD.encode(&data)),
                    "sha256": format!("{:x}", Sha256::digest(&data)),
                }
            }
        }
    })
}

async fn wait_for_clients(server: &MockBridgeServer, count: usize) {
    for _ in 0..2000 {
        if server.client_ids().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("bridge never saw {count} client(s)");
}

async fn start_with_config(pubber: &Pubber, server: &MockBridgeServer, config: Value) {
    let (started, ()) = tokio::join!(pubber.start(), async {
        wait_for_clients(server, 1).await;
        server.send_to_all("/devices/AHU-1/config", config);
    });
    started.expect("device start");
}

/// A local port with nothing listening on it.
async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn device_moves_to_redirected_bridge() {
    let dir = tempfile::tempdir().unwrap();
    let home = MockBridgeServer::start().await.expect("home bridge");
    let away = MockBridgeServer::start().await.expect("away bridge");
    let away_port = away.local_addr().port();
    let pubber = Pubber::builder(device_config(dir.path(), home.local_addr().port()))
        .build()
        .expect("build");
    start_with_config(&pubber, &home, redirect_config(away_port)).await;

    let (ticked, ()) = tokio::join!(pubber.tick(), async {
        wait_for_clients(&away, 1).await;
        away.send_to_all("/devices/AHU-1/config", redirect_config(away_port));
    });
    ticked.expect("tick");

    let endpoint = pubber.endpoint().expect("endpoint");
    assert_eq!(endpoint.client_id.as_deref(), Some(AWAY_CLIENT));
    assert_eq!(endpoint.port, Some(away_port));
    assert_eq!(away.client_ids(), [AWAY_CLIENT]);

    let store = PersistentStore::new(pubber.persistent_path());
    assert_eq!(store.load().unwrap().endpoint, Some(endpoint));

    // The apply phase was announced on the home bridge before the switch.
    let home_phases: Vec<Value> = home
        .received()
        .into_iter()
        .filter(|f| f.topic.ends_with("/state"))
        .map(|f| f.payload["blobset"]["blobs"]["_iot_endpoint_config"]["phase"].clone())
        .collect();
    assert!(home_phases.contains(&json!("apply")), "{home_phases:?}");

    pubber.stop().await.expect("stop");
}

#[tokio::test]
async fn unreachable_target_falls_back_home() {
    let dir = tempfile::tempdir().unwrap();
    let home = MockBridgeServer::start().await.expect("home bridge");
    let dead_port = closed_port().await;
    let pubber = Pubber::builder(device_config(dir.path(), home.local_addr().port()))
        .build()
        .expect("build");
    start_with_config(&pubber, &home, redirect_config(dead_port)).await;

    let (ticked, ()) = tokio::join!(pubber.tick(), async {
        wait_for_clients(&home, 2).await;
        home.send_to_all("/devices/AHU-1/config", redirect_config(dead_port));
    });
    ticked.expect("fallback");

    assert_eq!(pubber.endpoint(), Some(home_endpoint(home.local_addr().port())));
    let state = pubber.state().await;
    let blobset = state.blobset.expect("blobset");
    let blob = &blobset.blobs["_iot_endpoint_config"];
    assert!(blob.status.is_some(), "failure recorded");

    let store = PersistentStore::new(pubber.persistent_path());
    assert_eq!(
        store.load().unwrap().endpoint,
        Some(home_endpoint(home.local_addr().port()))
    );

    pubber.stop().await.expect("stop");
}
