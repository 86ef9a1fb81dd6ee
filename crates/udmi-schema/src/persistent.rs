//! Device record that survives process restarts.

use serde::{Deserialize, Serialize};

use crate::EndpointConfiguration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevicePersistent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<EndpointConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_count: Option<u32>,
}
