/// Discovery scanning: generation roll-forward, scan windows, and
/// generation revalidation when config changes mid-scan.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use pubber::{DeviceClock, LoadedSiteModel, Pubber, PubberConfig};
use serde_json::json;
use udmi_schema::{
    DiscoveryEvent, EndpointConfiguration, FamilyDiscoveryState, FamilyLocalnetModel,
    LocalnetModel, Metadata, PointPointsetModel, PointsetModel,
};
use udmi_transport::mock::MockTransportFactory;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn t0() -> DateTime<Utc> {
    "2024-05-01T12:00:00Z".parse().unwrap()
}

fn device_config(dir: &Path) -> PubberConfig {
    let mut config = PubberConfig::for_device("AHU-1");
    config.persist_dir = Some(dir.to_path_buf());
    config.out_dir = dir.join("out");
    config.report_interval = Duration::from_secs(3600);
    config.endpoint = Some(EndpointConfiguration {
        hostname: Some("mqtt.example.com".to_owned()),
        client_id: Some("projects/p/locations/us-central1/registries/ZZ/devices/AHU-1".to_owned()),
        ..Default::default()
    });
    config
}

fn bacnet_device(addr: &str) -> Metadata {
    Metadata {
        localnet: Some(LocalnetModel {
            families: [(
                "bacnet".to_owned(),
                FamilyLocalnetModel {
                    addr: Some(addr.to_owned()),
                },
            )]
            .into(),
        }),
        pointset: Some(PointsetModel {
            points: [("room_temp".to_owned(), PointPointsetModel::default())].into(),
        }),
        ..Default::default()
    }
}

fn site_model() -> LoadedSiteModel {
    LoadedSiteModel::new()
        .with_device("AHU-1", bacnet_device("0x65"))
        .with_device("FCU-2", bacnet_device("0x66"))
        .with_device("GAT-3", Metadata::default())
}

fn discovery_config(generation: DateTime<Utc>, interval: u32) -> serde_json::Value {
    json!({
        "timestamp": "2024-05-01T12:00:00Z",
        "discovery": {
            "families": {
                "bacnet": {
                    "generation": generation,
                    "scan_interval_sec": interval,
                    "enumerate": true
                }
            }
        }
    })
}

async fn started(config_on_connect: serde_json::Value, dir: &Path) -> (Pubber, Arc<MockTransportFactory>) {
    let factory = Arc::new(MockTransportFactory::new().with_config_on_connect(config_on_connect));
    let pubber = Pubber::builder(device_config(dir))
        .factory(factory.clone())
        .site_model(Arc::new(site_model()))
        .clock(DeviceClock::starting_at(t0(), false))
        .build()
        .unwrap();
    pubber.start().await.expect("start");
    (pubber, factory)
}

async fn bacnet_state(pubber: &Pubber) -> FamilyDiscoveryState {
    pubber
        .state()
        .await
        .discovery
        .and_then(|d| d.families)
        .and_then(|mut f| f.remove("bacnet"))
        .unwrap_or_default()
}

fn discovery_events(factory: &MockTransportFactory) -> Vec<DiscoveryEvent> {
    factory
        .published_on("events/discovery")
        .iter()
        .filter_map(|p| serde_json::from_slice(&p.payload).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stale_generation_rolls_forward_and_repeats() {
    let dir = tempfile::tempdir().unwrap();
    let requested = t0() - TimeDelta::seconds(90);
    let (pubber, factory) = started(discovery_config(requested, 60), dir.path()).await;
    let rolled = t0() + TimeDelta::seconds(30);

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(bacnet_state(&pubber).await.generation, None);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let family = bacnet_state(&pubber).await;
    assert_eq!(family.generation, Some(rolled));
    assert_eq!(family.active, Some(true));

    // Results go out halfway through the scan window.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let events = discovery_events(&factory);
    assert_eq!(events.len(), 2, "one event per bacnet device");
    for event in &events {
        assert_eq!(event.generation, Some(rolled));
        assert_eq!(event.scan_family.as_deref(), Some("bacnet"));
        let families = event.families.as_ref().unwrap();
        assert!(families.contains_key("bacnet"));
        assert_eq!(families["iot"].addr, event.scan_addr);
        assert!(event.uniqs.as_ref().unwrap().len() == 1);
    }
    let mut addrs: Vec<_> = events.iter().filter_map(|e| e.scan_addr.clone()).collect();
    addrs.sort();
    assert_eq!(addrs, ["AHU-1", "FCU-2"]);

    // The next cycle starts one interval after the effective generation.
    tokio::time::sleep(Duration::from_secs(50)).await;
    assert_eq!(bacnet_state(&pubber).await.generation, Some(rolled));
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        bacnet_state(&pubber).await.generation,
        Some(rolled + TimeDelta::seconds(60))
    );
}

#[tokio::test(start_paused = true)]
async fn one_shot_scan_completes_inactive() {
    let dir = tempfile::tempdir().unwrap();
    let generation = t0() + TimeDelta::seconds(5);
    let (pubber, factory) = started(discovery_config(generation, 0), dir.path()).await;

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(discovery_events(&factory).len(), 2);
    assert_eq!(bacnet_state(&pubber).await.active, Some(true));

    tokio::time::sleep(Duration::from_secs(5)).await;
    let family = bacnet_state(&pubber).await;
    assert_eq!(family.generation, Some(generation));
    assert_eq!(family.active, Some(false));
}

#[tokio::test(start_paused = true)]
async fn stale_one_shot_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let generation = t0() - TimeDelta::seconds(5);
    let (pubber, factory) = started(discovery_config(generation, 0), dir.path()).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(discovery_events(&factory).is_empty());
    assert_eq!(bacnet_state(&pubber).await.generation, None);
}

// ---------------------------------------------------------------------------
// Revalidation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn older_generation_never_regresses_state() {
    let dir = tempfile::tempdir().unwrap();
    let first = t0() + TimeDelta::seconds(5);
    let (pubber, factory) = started(discovery_config(first, 60), dir.path()).await;

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(bacnet_state(&pubber).await.generation, Some(first));

    // An older one-shot generation arrives mid-scan.
    let older = t0() + TimeDelta::seconds(1);
    let transport = factory.latest().unwrap();
    transport.deliver(
        "config",
        serde_json::to_vec(&discovery_config(older, 0)).unwrap(),
    );
    tokio::time::sleep(Duration::from_secs(60)).await;

    let family = bacnet_state(&pubber).await;
    assert_eq!(family.generation, Some(first));
    assert_eq!(family.active, Some(false), "completion saw the one-shot interval");
    assert!(
        discovery_events(&factory)
            .iter()
            .all(|e| e.generation == Some(first))
    );
}

#[tokio::test(start_paused = true)]
async fn newer_generation_retires_previous_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let first = t0() + TimeDelta::seconds(5);
    let (pubber, factory) = started(discovery_config(first, 60), dir.path()).await;

    tokio::time::sleep(Duration::from_secs(19)).await;
    let second = t0() + TimeDelta::seconds(20);
    factory
        .latest()
        .unwrap()
        .deliver("config", serde_json::to_vec(&discovery_config(second, 60)).unwrap());

    let mut seen = Vec::new();
    for _ in 0..150 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if let Some(generation) = bacnet_state(&pubber).await.generation {
            if seen.last() != Some(&generation) {
                seen.push(generation);
            }
        }
    }
    let offsets: Vec<i64> = seen.iter().map(|g| (*g - t0()).num_seconds()).collect();
    assert!(offsets.ends_with(&[20, 80, 140]), "{offsets:?}");
    assert!(offsets.iter().all(|o| [5, 20, 80, 140].contains(o)), "{offsets:?}");

    let mut event_offsets: Vec<i64> = discovery_events(&factory)
        .iter()
        .filter_map(|e| e.generation)
        .map(|g| (g - t0()).num_seconds())
        .collect();
    event_offsets.dedup();
    assert_eq!(event_offsets, [5, 20, 80, 140]);
}

#[tokio::test(start_paused = true)]
async fn family_without_generation_drops_empty_family_map() {
    let dir = tempfile::tempdir().unwrap();
    let first = t0() + TimeDelta::seconds(5);
    let (pubber, factory) = started(discovery_config(first, 60), dir.path()).await;
    assert!(pubber.state().await.discovery.unwrap().families.is_some());

    factory.latest().unwrap().deliver(
        "config",
        serde_json::to_vec(&json!({
            "timestamp": "2024-05-01T12:00:01Z",
            "discovery": { "families": { "bacnet": { "scan_interval_sec": 60 } } }
        }))
        .unwrap(),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let discovery = pubber.state().await.discovery.expect("discovery block");
    assert!(discovery.families.is_none());
    let body = serde_json::to_value(&discovery).unwrap();
    assert!(body.get("families").is_none());
}

#[tokio::test(start_paused = true)]
async fn removed_family_clears_state_and_silences_timers() {
    let dir = tempfile::tempdir().unwrap();
    let first = t0() + TimeDelta::seconds(5);
    let (pubber, factory) = started(discovery_config(first, 60), dir.path()).await;

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(bacnet_state(&pubber).await.active, Some(true));

    let transport = factory.latest().unwrap();
    transport.deliver(
        "config",
        serde_json::to_vec(&json!({
            "timestamp": "2024-05-01T12:00:06Z",
            "discovery": { "families": {} }
        }))
        .unwrap(),
    );
    tokio::time::sleep(Duration::from_secs(120)).await;

    let family = bacnet_state(&pubber).await;
    assert_eq!(family.generation, None);
    assert_eq!(family.active, None);
    assert!(discovery_events(&factory).is_empty(), "mid-window send was dropped");
}

#[tokio::test(start_paused = true)]
async fn enumeration_runs_once_per_generation() {
    let dir = tempfile::tempdir().unwrap();
    let config = json!({
        "timestamp": "2024-05-01T12:00:00Z",
        "discovery": {
            "generation": "2024-05-01T11:59:00Z",
            "enumerate": { "uniqs": true, "features": true }
        }
    });
    let (pubber, factory) = started(config.clone(), dir.path()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = discovery_events(&factory);
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert!(event.uniqs.as_ref().unwrap().contains_key(&pubber::discovery::uniq_key("room_temp")));
    assert!(event.features.as_ref().is_some_and(|f| !f.is_empty()));
    assert!(event.families.is_none());

    factory
        .latest()
        .unwrap()
        .deliver("config", serde_json::to_vec(&config).unwrap());
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(discovery_events(&factory).len(), 1);
    assert_eq!(
        pubber.state().await.discovery.unwrap().generation,
        Some("2024-05-01T11:59:00Z".parse().unwrap())
    );
}
