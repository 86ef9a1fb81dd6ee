//! Device metadata providers.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use udmi_schema::{ClientId, EndpointConfiguration, Metadata, Protocol, TransportKind};

pub const DEFAULT_CLOUD_REGION: &str = "us-central1";
pub const DEFAULT_MQTT_HOSTNAME: &str = "mqtt.googleapis.com";
pub const DEFAULT_MQTT_PORT: u16 = 8883;
const CLOUD_IOT_CONFIG: &str = "cloud_iot_config.json";

#[derive(Debug, thiserror::Error)]
pub enum SiteModelError {
    #[error("reading site model {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing metadata {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("Device ID {0} not found in site model")]
    UnknownDevice(String),
}

/// Site-wide cloud settings from `cloud_iot_config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CloudIotConfig {
    pub registry_id: String,
    #[serde(default)]
    pub cloud_region: Option<String>,
}

/// Default endpoint for `device_id` in the site's registry.
pub fn make_endpoint_config(
    iot_project: &str,
    cloud: &CloudIotConfig,
    device_id: &str,
) -> EndpointConfiguration {
    let client_id = ClientId {
        project: iot_project.to_owned(),
        region: cloud
            .cloud_region
            .clone()
            .unwrap_or_else(|| DEFAULT_CLOUD_REGION.to_owned()),
        registry: cloud.registry_id.clone(),
        device: device_id.to_owned(),
    };
    EndpointConfiguration {
        protocol: Some(Protocol::Mqtt),
        transport: Some(TransportKind::Ssl),
        hostname: Some(DEFAULT_MQTT_HOSTNAME.to_owned()),
        port: Some(DEFAULT_MQTT_PORT),
        client_id: Some(client_id.to_string()),
        ..EndpointConfiguration::default()
    }
}

/// Source of device metadata, keyed by device id.
pub trait SiteModel: Send + Sync {
    fn metadata(&self, device_id: &str) -> Option<Metadata>;

    fn device_ids(&self) -> Vec<String>;

    fn cloud_iot_config(&self) -> Option<CloudIotConfig> {
        None
    }
}

/// Site model held in memory, either built directly or read from a site
/// directory laid out as `devices/{device_id}/metadata.json`.
#[derive(Debug, Clone, Default)]
pub struct LoadedSiteModel {
    devices: BTreeMap<String, Metadata>,
    cloud: Option<CloudIotConfig>,
}

impl LoadedSiteModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device_id: &str, metadata: Metadata) -> Self {
        self.devices.insert(device_id.to_owned(), metadata);
        self
    }

    pub fn with_cloud_iot_config(mut self, cloud: CloudIotConfig) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn load_dir(site_path: &Path) -> Result<Self, SiteModelError> {
        let devices_dir = site_path.join("devices");
        let io_err = |path: &Path| {
            let path = path.display().to_string();
            move |source: std::io::Error| SiteModelError::Io { path, source }
        };
        let mut devices = BTreeMap::new();
        for entry in fs::read_dir(&devices_dir).map_err(io_err(&devices_dir))? {
            let entry = entry.map_err(io_err(&devices_dir))?;
            let metadata_path = entry.path().join("metadata.json");
            if !metadata_path.is_file() {
                continue;
            }
            let bytes = fs::read(&metadata_path).map_err(io_err(&metadata_path))?;
            let metadata: Metadata =
                serde_json::from_slice(&bytes).map_err(|source| SiteModelError::Parse {
                    path: metadata_path.display().to_string(),
                    source,
                })?;
            devices.insert(entry.file_name().to_string_lossy().into_owned(), metadata);
        }
        let cloud_path = site_path.join(CLOUD_IOT_CONFIG);
        let cloud = if cloud_path.is_file() {
            let bytes = fs::read(&cloud_path).map_err(io_err(&cloud_path))?;
            Some(
                serde_json::from_slice(&bytes).map_err(|source| SiteModelError::Parse {
                    path: cloud_path.display().to_string(),
                    source,
                })?,
            )
        } else {
            None
        };
        tracing::info!(site = %site_path.display(), devices = devices.len(), "loaded site model");
        Ok(Self { devices, cloud })
    }
}

impl SiteModel for LoadedSiteModel {
    fn metadata(&self, device_id: &str) -> Option<Metadata> {
        self.devices.get(device_id).cloned()
    }

    fn device_ids(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    fn cloud_iot_config(&self) -> Option<CloudIotConfig> {
        self.cloud.clone()
    }
}
