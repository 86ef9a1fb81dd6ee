//! Site-model metadata for a single device.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointPointsetModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writable: Option<bool>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub point_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointsetModel {
    #[serde(default)]
    pub points: BTreeMap<String, PointPointsetModel>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FamilyLocalnetModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalnetModel {
    #[serde(default)]
    pub families: BTreeMap<String, FamilyLocalnetModel>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxy_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Schema version this device should emulate, if older than current.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointset: Option<PointsetModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub localnet: Option<LocalnetModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayModel>,
}

impl Metadata {
    pub fn family_addr(&self, family: &str) -> Option<&str> {
        self.localnet.as_ref()?.families.get(family)?.addr.as_deref()
    }
}
