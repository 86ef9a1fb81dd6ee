//! Status/log entries and severity levels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity level, serialized as its numeric UDMI value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl Level {
    pub fn value(self) -> u32 {
        match self {
            Level::Trace => 100,
            Level::Debug => 200,
            Level::Info => 300,
            Level::Notice => 400,
            Level::Warning => 500,
            Level::Error => 600,
            Level::Critical => 700,
            Level::Alert => 800,
            Level::Emergency => 900,
        }
    }

    /// Map a numeric level onto the nearest level at or below it.
    pub fn from_value(value: u32) -> Level {
        match value {
            0..=199 => Level::Trace,
            200..=299 => Level::Debug,
            300..=399 => Level::Info,
            400..=499 => Level::Notice,
            500..=599 => Level::Warning,
            600..=699 => Level::Error,
            700..=799 => Level::Critical,
            800..=899 => Level::Alert,
            _ => Level::Emergency,
        }
    }
}

impl Serialize for Level {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.value())
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u32::deserialize(deserializer)?;
        Ok(Level::from_value(value))
    }
}

/// A single status or log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub category: String,
    pub timestamp: DateTime<Utc>,
    pub level: Level,
}

impl Entry {
    pub fn new(category: &str, level: Level, message: impl Into<String>) -> Self {
        Entry {
            message: message.into(),
            detail: None,
            category: category.to_owned(),
            timestamp: Utc::now(),
            level,
        }
    }

    pub fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Well-known entry categories.
pub mod category {
    use super::Level;

    pub const SYSTEM_CONFIG_RECEIVE: &str = "system.config.receive";
    pub const SYSTEM_CONFIG_PARSE: &str = "system.config.parse";
    pub const SYSTEM_CONFIG_APPLY: &str = "system.config.apply";
    pub const BLOBSET_BLOB_APPLY: &str = "blobset.blob.apply";
    pub const POINTSET_POINT_FAILURE: &str = "pointset.point.failure";
    pub const DEVICE_LOG: &str = "device.log";

    /// Level reported for a successful outcome in `category`.
    pub fn success_level(category: &str) -> Level {
        match category {
            SYSTEM_CONFIG_APPLY | BLOBSET_BLOB_APPLY => Level::Notice,
            SYSTEM_CONFIG_RECEIVE | SYSTEM_CONFIG_PARSE => Level::Debug,
            _ => Level::Info,
        }
    }
}
