//! Cloud-issued config document delivered on the `config` topic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{BlobPhase, SystemMode};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SystemMode>,
    /// Requested device start time. A value later than the actual start
    /// requests a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_loglevel: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_rate_sec: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationConfig>,
}

impl SystemConfig {
    pub fn is_empty(&self) -> bool {
        self == &SystemConfig::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointPointsetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub point_ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointsetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate_sec: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_limit_sec: Option<u32>,
    #[serde(default)]
    pub points: BTreeMap<String, PointPointsetConfig>,
}

/// Which sub-lists an enumeration event carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enumerate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uniqs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub families: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FamilyDiscoveryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_interval_sec: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_duration_sec: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enumerate: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Enumeration generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enumerate: Option<Enumerate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub families: Option<BTreeMap<String, FamilyDiscoveryConfig>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobBlobsetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<BlobPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobsetConfig {
    #[serde(default)]
    pub blobs: BTreeMap<String, BlobBlobsetConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointset: Option<PointsetConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoveryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blobset: Option<BlobsetConfig>,
}

impl Config {
    pub fn scan_interval_sec(&self, family: &str) -> u32 {
        self.family_config(family)
            .and_then(|f| f.scan_interval_sec)
            .unwrap_or(0)
    }

    pub fn family_config(&self, family: &str) -> Option<&FamilyDiscoveryConfig> {
        self.discovery.as_ref()?.families.as_ref()?.get(family)
    }
}
