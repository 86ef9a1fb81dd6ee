//! Reflector setup handshake documents and the command envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupUdmiState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_to: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UdmiState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupUdmiState>,
}

/// State document the reflector client writes to announce itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectorState {
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub udmi: UdmiState,
}

/// Cloud function install details echoed back in config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetupUdmiConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udmi_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udmi_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functions_min: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functions_max: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UdmiConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_state: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup: Option<SetupUdmiConfig>,
}

/// Message wrapper used on the reflector channel. `payload` is base64.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_registry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_time: Option<DateTime<Utc>>,
}
