/// Fault injection under `empty_missing`.
use std::sync::Arc;
use std::time::Duration;

use pubber::faults::CORRUPT_STATE_MESSAGE;
use pubber::{Pubber, PubberConfig};
use serde_json::json;
use udmi_schema::EndpointConfiguration;
use udmi_transport::mock::MockTransportFactory;

const INJECTED_TOPICS: &[&str] = &[
    "events/invalid",
    "events/blobset",
    "events/discovery",
    "events/mapping",
    "state",
];

#[tokio::test(start_paused = true)]
async fn ten_ticks_emit_the_documented_faults_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = PubberConfig::for_device("AHU-1");
    config.persist_dir = Some(dir.path().to_path_buf());
    config.out_dir = dir.path().join("out");
    config.report_interval = Duration::from_secs(3600);
    config.options.empty_missing = true;
    config.timing.inject_delay = Duration::from_millis(10);
    config.endpoint = Some(EndpointConfiguration {
        hostname: Some("mqtt.example.com".to_owned()),
        client_id: Some("projects/p/locations/us-central1/registries/ZZ/devices/AHU-1".to_owned()),
        ..Default::default()
    });
    let factory = Arc::new(
        MockTransportFactory::new()
            .with_config_on_connect(json!({ "timestamp": "2024-05-01T12:00:00Z" })),
    );
    let pubber = Pubber::builder(config).factory(factory.clone()).build().unwrap();
    pubber.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let skip = factory.published().len();

    for _ in 0..10 {
        pubber.tick().await.unwrap();
    }

    let injected: Vec<(String, String)> = factory.published()[skip..]
        .iter()
        .filter_map(|p| {
            let suffix = p.topic.strip_prefix("/devices/AHU-1/")?;
            let is_fault = INJECTED_TOPICS.contains(&suffix)
                && (suffix != "state" || p.text() == CORRUPT_STATE_MESSAGE);
            is_fault.then(|| (suffix.to_owned(), p.text()))
        })
        .collect();

    let topics: Vec<&str> = injected.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(topics, INJECTED_TOPICS);

    let invalid: serde_json::Value = serde_json::from_str(&injected[0].1).unwrap();
    assert_eq!(invalid["field"], "bunny");
    assert!(invalid["version"].is_string());
    assert_eq!(injected[1].1, "\"\"");
    assert_eq!(injected[2].1, "{}");
    assert_eq!(injected[3].1, "{ NOT VALID JSON!");
    assert_eq!(injected[4].1, CORRUPT_STATE_MESSAGE);
}

#[tokio::test(start_paused = true)]
async fn faults_are_off_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = PubberConfig::for_device("AHU-1");
    config.persist_dir = Some(dir.path().to_path_buf());
    config.out_dir = dir.path().join("out");
    config.report_interval = Duration::from_secs(3600);
    config.endpoint = Some(EndpointConfiguration {
        hostname: Some("mqtt.example.com".to_owned()),
        client_id: Some("projects/p/locations/us-central1/registries/ZZ/devices/AHU-1".to_owned()),
        ..Default::default()
    });
    let factory = Arc::new(
        MockTransportFactory::new()
            .with_config_on_connect(json!({ "timestamp": "2024-05-01T12:00:00Z" })),
    );
    let pubber = Pubber::builder(config).factory(factory.clone()).build().unwrap();
    pubber.start().await.unwrap();

    for _ in 0..10 {
        pubber.tick().await.unwrap();
    }
    for topic in ["events/invalid", "events/blobset", "events/mapping"] {
        assert!(factory.published_on(topic).is_empty(), "{topic} published");
    }
}
