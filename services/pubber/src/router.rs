//! Outbound message routing.
//!
//! Every device message is one [`DeviceMessage`] variant, which knows its
//! topic suffix and how to take a version and timestamp stamp. The router
//! stamps, optionally downgrades, mirrors the payload to a trace file and
//! hands it to the active transport.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use udmi_schema::{DiscoveryEvent, PointsetEvent, SchemaVersion, State, SystemEvent};
use udmi_transport::{PublishAck, Transport, TransportError};

use crate::clock::DeviceClock;

/// Version string stamped under the `bad_version` option.
pub const BROKEN_VERSION: &str = "1.4.";

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// Pointset event carrying a field the schema does not define.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtraPointsetEvent {
    #[serde(flatten)]
    pub event: PointsetEvent,
    #[serde(rename = "extraField")]
    pub extra_field: String,
}

/// Deliberately malformed event used by fault injection. When
/// `replace_message_with` is set the serialized body is discarded and the
/// raw text is sent instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InjectedMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip)]
    pub replace_topic_with: Option<String>,
    #[serde(skip)]
    pub replace_message_with: Option<String>,
}

/// Raw text sent on the state topic.
#[derive(Debug, Clone, PartialEq)]
pub struct InjectedState {
    pub replace_message_with: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    State(Box<State>),
    SystemEvent(SystemEvent),
    PointsetEvent(PointsetEvent),
    ExtraPointsetEvent(ExtraPointsetEvent),
    DiscoveryEvent(DiscoveryEvent),
    Injected(InjectedMessage),
    InjectedState(InjectedState),
}

impl DeviceMessage {
    pub fn topic_suffix(&self) -> &str {
        match self {
            DeviceMessage::State(_) | DeviceMessage::InjectedState(_) => "state",
            DeviceMessage::SystemEvent(_) => "events/system",
            DeviceMessage::PointsetEvent(_) | DeviceMessage::ExtraPointsetEvent(_) => {
                "events/pointset"
            }
            DeviceMessage::DiscoveryEvent(_) => "events/discovery",
            DeviceMessage::Injected(m) => m
                .replace_topic_with
                .as_deref()
                .unwrap_or("events/invalid"),
        }
    }

    pub fn is_state(&self) -> bool {
        matches!(
            self,
            DeviceMessage::State(_) | DeviceMessage::InjectedState(_)
        )
    }

    fn stamp(&mut self, version: &str, timestamp: DateTime<Utc>) {
        let version = Some(version.to_owned());
        let timestamp = Some(timestamp);
        match self {
            DeviceMessage::State(m) => {
                m.version = version;
                m.timestamp = timestamp;
            }
            DeviceMessage::SystemEvent(m) => {
                m.version = version;
                m.timestamp = timestamp;
            }
            DeviceMessage::PointsetEvent(m) => {
                m.version = version;
                m.timestamp = timestamp;
            }
            DeviceMessage::ExtraPointsetEvent(m) => {
                m.event.version = version;
                m.event.timestamp = timestamp;
            }
            DeviceMessage::DiscoveryEvent(m) => {
                m.version = version;
                m.timestamp = timestamp;
            }
            DeviceMessage::Injected(m) => {
                m.version = version;
                m.timestamp = timestamp;
            }
            DeviceMessage::InjectedState(_) => {}
        }
    }

    fn raw_replacement(&self) -> Option<&str> {
        match self {
            DeviceMessage::Injected(m) => m.replace_message_with.as_deref(),
            DeviceMessage::InjectedState(m) => Some(&m.replace_message_with),
            _ => None,
        }
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            DeviceMessage::State(m) => serde_json::to_value(m),
            DeviceMessage::SystemEvent(m) => serde_json::to_value(m),
            DeviceMessage::PointsetEvent(m) => serde_json::to_value(m),
            DeviceMessage::ExtraPointsetEvent(m) => serde_json::to_value(m),
            DeviceMessage::DiscoveryEvent(m) => serde_json::to_value(m),
            DeviceMessage::Injected(m) => serde_json::to_value(m),
            DeviceMessage::InjectedState(m) => Ok(Value::String(m.replace_message_with.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// Downgrading
// ---------------------------------------------------------------------------

/// Reshapes an outbound document for a device emulating an older schema.
pub trait Downgrader: Send + Sync {
    fn downgrade(&self, target: SchemaVersion, message: Value) -> Value;
}

/// Rewrites the `version` field for older targets and leaves the shape alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct VersionStamp;

impl Downgrader for VersionStamp {
    fn downgrade(&self, target: SchemaVersion, mut message: Value) -> Value {
        if target >= SchemaVersion::CURRENT {
            return message;
        }
        if let Value::Object(map) = &mut message
            && map.contains_key("version")
        {
            map.insert("version".to_owned(), Value::String(target.key()));
        }
        message
    }
}

// ---------------------------------------------------------------------------
// Trace files
// ---------------------------------------------------------------------------

/// Mirrors payloads to `{dir}/{topic_with_underscores}.json`. With
/// `message_trace` every message gets its own timestamped file.
pub struct TraceWriter {
    dir: PathBuf,
    message_trace: bool,
    counters: Mutex<HashMap<String, u32>>,
}

impl TraceWriter {
    pub fn new(dir: impl Into<PathBuf>, message_trace: bool) -> Self {
        Self {
            dir: dir.into(),
            message_trace,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(&self, base: &str, timestamp: DateTime<Utc>) -> String {
        let base = base.replace('/', "_");
        if !self.message_trace {
            return format!("{base}.json");
        }
        let count = match self.counters.lock() {
            Ok(mut counters) => {
                let counter = counters.entry(base.clone()).or_insert(0);
                *counter += 1;
                *counter
            }
            Err(_) => 0,
        };
        format!(
            "{base}_{}.{count:03}Z.json",
            timestamp.format("%Y-%m-%dT%H:%M:%S")
        )
    }

    /// Write one trace file. Failures are logged and otherwise ignored.
    pub fn write(&self, base: &str, timestamp: DateTime<Utc>, payload: &[u8]) -> Option<PathBuf> {
        let path = self.dir.join(self.file_name(base, timestamp));
        let result = std::fs::create_dir_all(&self.dir).and_then(|_| std::fs::write(&path, payload));
        match result {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to write trace file");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("encoding {topic} message: {source}")]
    Encode {
        topic: String,
        source: serde_json::Error,
    },
    #[error("publisher not active")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct MessageRouter {
    clock: DeviceClock,
    bad_version: bool,
    no_state: bool,
    target: Option<SchemaVersion>,
    downgrader: Arc<dyn Downgrader>,
    trace: TraceWriter,
}

impl MessageRouter {
    pub fn new(clock: DeviceClock, trace: TraceWriter) -> Self {
        Self {
            clock,
            bad_version: false,
            no_state: false,
            target: None,
            downgrader: Arc::new(VersionStamp),
            trace,
        }
    }

    pub fn with_bad_version(mut self, bad_version: bool) -> Self {
        self.bad_version = bad_version;
        self
    }

    pub fn with_no_state(mut self, no_state: bool) -> Self {
        self.no_state = no_state;
        self
    }

    /// Emulate a device speaking `target` through `downgrader`.
    pub fn with_target(mut self, target: Option<SchemaVersion>, downgrader: Arc<dyn Downgrader>) -> Self {
        self.target = target;
        self.downgrader = downgrader;
        self
    }

    fn version(&self) -> String {
        if self.bad_version {
            BROKEN_VERSION.to_owned()
        } else {
            SchemaVersion::CURRENT.key()
        }
    }

    /// Stamp, encode and publish `message`. Returns `None` when the message
    /// was squelched (state under `no_state`).
    pub fn route(
        &self,
        transport: Option<&dyn Transport>,
        mut message: DeviceMessage,
    ) -> Result<Option<PublishAck>, RouterError> {
        if self.no_state && message.is_state() {
            tracing::info!("Squelching state update as per no_state option");
            return Ok(None);
        }
        let transport = transport
            .filter(|t| t.is_active())
            .ok_or(RouterError::NotConnected)?;

        let now = self.clock.now();
        message.stamp(&self.version(), now);
        let topic = message.topic_suffix().to_owned();
        let payload = match message.raw_replacement() {
            Some(raw) => raw.as_bytes().to_vec(),
            None => {
                let encode = |source| RouterError::Encode {
                    topic: topic.clone(),
                    source,
                };
                let mut value = message.to_value().map_err(encode)?;
                if let Some(target) = self.target {
                    value = self.downgrader.downgrade(target, value);
                }
                serde_json::to_vec_pretty(&value).map_err(encode)?
            }
        };

        let ack = transport.publish(&topic, payload.clone())?;
        tracing::debug!(topic = %topic, bytes = payload.len(), "published device message");
        self.trace.write(&topic, now, &payload);
        Ok(Some(ack))
    }

    /// Mirror an inbound payload (e.g. `config`) to the trace directory.
    pub fn trace_inbound(&self, base: &str, payload: &[u8]) {
        self.trace.write(base, self.clock.now(), payload);
    }
}
