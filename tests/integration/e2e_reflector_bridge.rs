//! End-to-end: reflector setup handshake over the WebSocket bridge.
//!
//! The mock bridge plays the cloud functions: it echoes the reflector state
//! timestamp back as `udmi.last_state`, then relays a device command.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use serde_json::json;
use udmi_conformance::reflector::{ReflectorClient, ReflectorOptions, UDMI_TOPIC};
use udmi_conformance::schema::EndpointConfiguration;
use udmi_conformance::transport::{TransportFactory, WsBridgeFactory};
use udmi_test_utils::MockBridgeServer;

const REGISTRY: &str = "ZZ-TRI-FECTA";

fn reflector_endpoint(server: &MockBridgeServer) -> EndpointConfiguration {
    EndpointConfiguration {
        hostname: Some("127.0.0.1".to_owned()),
        port: Some(server.local_addr().port()),
        client_id: Some(format!("projects/p/locations/us-central1/registries/UDMI-REFLECT/devices/{REGISTRY}")),
        ..EndpointConfiguration::default()
    }
}

/// Answer the first reflector state with a matching setup config.
async fn answer_setup(server: &MockBridgeServer) {
    let frames = server.wait_for_frames(1, Duration::from_secs(30)).await;
    let state = frames
        .iter()
        .find(|f| f.topic.ends_with("/state"))
        .expect("reflector state");
    server.send_to_all(
        &format!("/devices/{REGISTRY}/config"),
        json!({
            "udmi": {
                "last_state": state.payload["timestamp"],
                "setup": {
                    "udmi_version": "1.5.2",
                    "functions_min": 10,
                    "functions_max": 20
                }
            }
        }),
    );
}

#[tokio::test]
async fn reflector_handshake_and_command_relay() {
    let server = MockBridgeServer::start().await.expect("bridge");
    let transport = WsBridgeFactory
        .create(&reflector_endpoint(&server), REGISTRY, Arc::new(|_| {}))
        .expect("transport");
    let mut options = ReflectorOptions::new("test-project", REGISTRY, "1.5.2", 12);
    options.config_timeout = Duration::from_secs(2);

    let (client, ()) = tokio::join!(ReflectorClient::connect(transport, options), answer_setup(&server));
    let client = client.expect("handshake");
    assert!(client.is_active());
    assert_eq!(client.version_information().unwrap().functions_min, Some(10));

    server.send_to_all(
        &format!("/devices/{REGISTRY}/commands"),
        json!({
            "deviceId": "AHU-1",
            "subFolder": "system",
            "subType": "events",
            "payload": BASE64_STANDARD.encode(r#"{"event_count":3}"#),
        }),
    );
    let bundle = client
        .take_next_message(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("relayed command");
    assert_eq!(bundle.attributes["deviceId"], "AHU-1");
    assert_eq!(bundle.message["event_count"], 3);

    let transaction_id = client
        .publish("AHU-1", "config/update", r#"{"timestamp":"2024-05-01T12:00:00Z"}"#)
        .unwrap();
    let frames = server.wait_for_frames(2, Duration::from_secs(5)).await;
    let envelope = frames
        .iter()
        .find(|f| f.topic.ends_with(UDMI_TOPIC))
        .expect("udmi envelope");
    assert_eq!(envelope.topic, format!("/devices/{REGISTRY}/{UDMI_TOPIC}"));
    assert_eq!(envelope.payload["transactionId"], transaction_id.as_str());
    assert_eq!(envelope.payload["deviceRegistryId"], REGISTRY);

    client.close().await;
    assert!(!client.is_active());
}
