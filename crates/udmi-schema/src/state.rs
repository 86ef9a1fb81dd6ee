//! Device state document published on the `state` topic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Entry;

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

/// Device lifecycle mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    #[default]
    Initial,
    Active,
    Updating,
    Restart,
    Terminate,
    Shutdown,
}

impl SystemMode {
    /// Process exit code the binary uses when leaving in this mode.
    pub fn exit_code(self) -> i32 {
        match self {
            SystemMode::Restart => 192,
            SystemMode::Terminate => 193,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SystemMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_count: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub software: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_config: Option<DateTime<Utc>>,
    #[serde(default)]
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Entry>,
}

// ---------------------------------------------------------------------------
// Pointset
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueState {
    Applied,
    Updating,
    Overridden,
    Invalid,
    Failure,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointPointsetState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_state: Option<ValueState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Entry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointsetState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Entry>,
    #[serde(default)]
    pub points: BTreeMap<String, PointPointsetState>,
}

// ---------------------------------------------------------------------------
// Blobset
// ---------------------------------------------------------------------------

/// Phase of a blob update. `Final` is the terminal phase, success or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobPhase {
    Apply,
    Final,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobBlobsetState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<BlobPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Entry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlobsetState {
    #[serde(default)]
    pub blobs: BTreeMap<String, BlobBlobsetState>,
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Per-family scan status. `generation` is a logical epoch, not wall-clock truth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FamilyDiscoveryState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Entry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryState {
    /// Generation of the last enumeration performed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub families: Option<BTreeMap<String, FamilyDiscoveryState>>,
}

// ---------------------------------------------------------------------------
// Top-level state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub system: SystemState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointset: Option<PointsetState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blobset: Option<BlobsetState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoveryState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_optional_blocks_are_omitted() {
        let json = serde_json::to_value(State::default()).unwrap();
        let obj = json.as_object().unwrap();
        assert!(obj.contains_key("system"));
        assert!(!obj.contains_key("blobset"));
        assert!(!obj.contains_key("discovery"));
    }

    #[test]
    fn blob_phase_uses_lowercase_names() {
        assert_eq!(
            serde_json::to_string(&BlobPhase::Final).unwrap(),
            "\"final\""
        );
    }

    #[test]
    fn exit_codes_follow_mode() {
        assert_eq!(SystemMode::Restart.exit_code(), 192);
        assert_eq!(SystemMode::Terminate.exit_code(), 193);
        assert_eq!(SystemMode::Shutdown.exit_code(), 0);
    }
}
