//! Reflector client: the validator's side of the UDMI setup handshake.
//!
//! # Protocol
//! 1. Register `config` and `commands` handlers, then connect
//! 2. Wait for an initial config (an empty config may never arrive)
//! 3. Publish reflector state and wait for a config whose `udmi.last_state`
//!    echoes the state timestamp; each timeout consumes one retry
//! 4. Check the cloud functions version range against the required version
//! 5. Queue `commands` envelopes as [`MessageBundle`]s for
//!    [`ReflectorClient::take_next_message`]
//!
//! Topics are `/devices/{registry}/{category}/...`: the reflector device
//! stands in for the whole site registry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use udmi_schema::{
    Envelope, ReflectorState, SetupUdmiConfig, SetupUdmiState, UdmiConfig, UdmiState,
};
use udmi_transport::{InboundMessage, Transport, TransportError};

pub const CONFIG_TIMEOUT: Duration = Duration::from_secs(10);
pub const UPDATE_RETRIES: u32 = 6;
pub const UDMI_TOPIC: &str = "events/udmi";

const STATE_TOPIC: &str = "state";
const MOCK_DEVICE_NUM_ID: &str = "123456789101112";

static LAST_TRANSACTION_MILLIS: AtomicI64 = AtomicI64::new(0);

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReflectorOptions {
    pub project_id: String,
    /// Site registry being reflected.
    pub registry_id: String,
    /// Local UDMI version announced in reflector state.
    pub udmi_version: String,
    /// Requested cloud install ref; enables the longer retry budget.
    pub update_to: Option<String>,
    pub required_version: i32,
    pub user: Option<String>,
    pub config_timeout: Duration,
}

impl ReflectorOptions {
    pub fn new(
        project_id: &str,
        registry_id: &str,
        udmi_version: &str,
        required_version: i32,
    ) -> Self {
        Self {
            project_id: project_id.to_owned(),
            registry_id: registry_id.to_owned(),
            udmi_version: udmi_version.to_owned(),
            update_to: None,
            required_version,
            user: std::env::var("USER").ok(),
            config_timeout: CONFIG_TIMEOUT,
        }
    }
}

/// A received device message with its envelope attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageBundle {
    pub attributes: BTreeMap<String, String>,
    pub message: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ReflectorError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Config sync timeout expired. Investigate UDMI cloud functions install.")]
    SyncTimeout { last_failure: Option<String> },
    #[error("UDMI required functions version {required} not allowed: {reason}")]
    FunctionsVersion { required: i32, reason: String },
    #[error("{0}")]
    Topic(String),
    #[error("unknown message category {0}")]
    UnknownCategory(String),
    #[error("publish topic {0} is not folder/type")]
    PublishTopic(String),
    #[error("Reflector client not active")]
    Inactive,
    #[error("udmi version information not available")]
    VersionUnavailable,
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed payload encoding: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Unique `RC:<millis>` transaction id, strictly increasing per process.
pub fn next_transaction_id() -> String {
    let now = Utc::now().timestamp_millis();
    let prev = match LAST_TRANSACTION_MILLIS.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
        Some(now.max(prev + 1))
    }) {
        Ok(prev) | Err(prev) => prev,
    };
    format!("RC:{}", now.max(prev + 1))
}

/// Reject a required functions version outside the cloud's supported range.
pub fn check_functions_range(required: i32, info: &SetupUdmiConfig) -> Result<(), ReflectorError> {
    if let Some(min) = info.functions_min.filter(|min| required < *min) {
        return Err(ReflectorError::FunctionsVersion {
            required,
            reason: format!("min supported {min}. Please update local UDMI install."),
        });
    }
    if let Some(max) = info.functions_max.filter(|max| required > *max) {
        return Err(ReflectorError::FunctionsVersion {
            required,
            reason: format!("max supported {max}. Please update cloud UDMI install."),
        });
    }
    Ok(())
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Handler-side state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SetupProgress {
    state_timestamp: Option<DateTime<Utc>>,
    state_sent: bool,
    install_valid: bool,
    sync_failure: Option<String>,
    udmi_info: Option<SetupUdmiConfig>,
}

/// Everything the transport callbacks touch.
struct Shared {
    project_id: String,
    registry_id: String,
    udmi_version: String,
    update_to: Option<String>,
    required_version: i32,
    initial_config: watch::Sender<bool>,
    valid_config: watch::Sender<bool>,
    setup: Mutex<SetupProgress>,
    messages: mpsc::UnboundedSender<MessageBundle>,
}

impl Shared {
    fn handle_message(&self, message: InboundMessage) {
        let raw = message.payload.as_slice();
        if raw.is_empty() || raw == b"null" {
            return;
        }
        let body = match decode_body(raw) {
            Ok(body) => body,
            Err(e) => return self.reject(&message, &Value::Null, e),
        };
        if let Err(e) = self.dispatch(&message.topic, &body) {
            self.reject(&message, &body, e);
        }
    }

    fn dispatch(&self, topic: &str, body: &Value) -> Result<(), ReflectorError> {
        match self.message_category(topic)? {
            "config" => {
                self.ensure_cloud_sync(body);
                Ok(())
            }
            "commands" => self.handle_command(body),
            other => Err(ReflectorError::UnknownCategory(other.to_owned())),
        }
    }

    fn message_category<'a>(&self, topic: &'a str) -> Result<&'a str, ReflectorError> {
        let mut parts = topic.strip_prefix('/').unwrap_or(topic).split('/');
        if parts.next() != Some("devices") {
            return Err(ReflectorError::Topic(format!("unknown parsed path field: {topic}")));
        }
        let parsed = parts.next().unwrap_or_default();
        if parsed != self.registry_id {
            return Err(ReflectorError::Topic(format!(
                "registry id {parsed} does not match expected {}",
                self.registry_id
            )));
        }
        parts
            .next()
            .ok_or_else(|| ReflectorError::Topic(format!("missing category: {topic}")))
    }

    /// Errors after setup become error bundles for the consumer; before
    /// setup they are the latest sync failure.
    fn reject(&self, message: &InboundMessage, body: &Value, err: ReflectorError) {
        let mut setup = locked(&self.setup);
        if !setup.install_valid {
            warn!(topic = %message.topic, error = %err, "reflector message rejected during setup");
            setup.sync_failure = Some(err.to_string());
            return;
        }
        drop(setup);
        let bundle = MessageBundle {
            attributes: self.attributes(body),
            message: json!({
                "exception": err.to_string(),
                "payload": String::from_utf8_lossy(&message.payload),
                "timestamp": Utc::now(),
            }),
        };
        let _ = self.messages.send(bundle);
    }

    fn ensure_cloud_sync(&self, body: &Value) {
        self.initial_config.send_replace(true);
        if let Err(e) = self.check_cloud_sync(body) {
            warn!(error = %e, "UDMI setup config rejected");
            locked(&self.setup).sync_failure = Some(e.to_string());
        }
    }

    fn check_cloud_sync(&self, body: &Value) -> Result<(), ReflectorError> {
        let mut setup = locked(&self.setup);
        if !setup.state_sent {
            return Ok(());
        }

        let config = match body.get("udmis") {
            Some(legacy) => {
                warn!("UDMI using LEGACY config format, function install upgrade required");
                UdmiConfig {
                    last_state: legacy
                        .get("last_state")
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse().ok()),
                    setup: Some(serde_json::from_value(legacy.clone())?),
                }
            }
            None => body
                .get("udmi")
                .cloned()
                .map(serde_json::from_value::<UdmiConfig>)
                .transpose()?
                .unwrap_or_default(),
        };
        setup.udmi_info = config.setup.clone();
        let info = config.setup.unwrap_or_default();

        let timestamp_match = matches!(
            (config.last_state, setup.state_timestamp),
            (Some(last), Some(sent)) if last.timestamp() == sent.timestamp()
        );
        let version_match = self
            .update_to
            .as_ref()
            .is_none_or(|to| info.udmi_ref.as_ref() == Some(to));

        if !version_match {
            info!(udmi_ref = ?info.udmi_ref, "UDMI update version mismatch, waiting for retry");
            return Ok(());
        }
        if !timestamp_match {
            debug!(last_state = ?config.last_state, "UDMI ignoring mismatching timestamp");
            return Ok(());
        }
        if info.udmi_version.as_deref() != Some(self.udmi_version.as_str()) {
            warn!(
                local = %self.udmi_version,
                cloud = ?info.udmi_version,
                "UDMI version mismatch"
            );
        }
        info!(
            functions_min = ?info.functions_min,
            functions_max = ?info.functions_max,
            required = self.required_version,
            "UDMI functions support"
        );
        check_functions_range(self.required_version, &info)?;

        setup.install_valid = true;
        drop(setup);
        self.valid_config.send_replace(true);
        Ok(())
    }

    fn handle_command(&self, body: &Value) -> Result<(), ReflectorError> {
        if !locked(&self.setup).install_valid {
            return Ok(());
        }
        let attributes = self.attributes(body);
        let payload = body.get("payload").and_then(Value::as_str).unwrap_or_default();
        let message = serde_json::from_slice(&BASE64_STANDARD.decode(payload)?)?;
        let _ = self.messages.send(MessageBundle { attributes, message });
        Ok(())
    }

    fn attributes(&self, body: &Value) -> BTreeMap<String, String> {
        let mut attributes = BTreeMap::from([
            ("projectId".to_owned(), self.project_id.clone()),
            ("deviceRegistryId".to_owned(), self.registry_id.clone()),
            ("deviceNumId".to_owned(), MOCK_DEVICE_NUM_ID.to_owned()),
        ]);
        for key in ["deviceId", "subType", "subFolder", "transactionId", "publishTime"] {
            if let Some(value) = body.get(key).and_then(Value::as_str) {
                attributes.insert(key.to_owned(), value.to_owned());
            }
        }
        attributes
    }
}

/// Payloads starting with `{` are raw JSON; anything else is base64.
fn decode_body(raw: &[u8]) -> Result<Value, ReflectorError> {
    if raw.first() == Some(&b'{') {
        Ok(serde_json::from_slice(raw)?)
    } else {
        Ok(serde_json::from_slice(&BASE64_STANDARD.decode(raw)?)?)
    }
}

// ---------------------------------------------------------------------------
// ReflectorClient
// ---------------------------------------------------------------------------

pub struct ReflectorClient {
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    messages: tokio::sync::Mutex<mpsc::UnboundedReceiver<MessageBundle>>,
    active: AtomicBool,
    user: Option<String>,
    config_timeout: Duration,
}

impl ReflectorClient {
    /// Connect `transport` and run the setup handshake. The transport is
    /// closed again when setup fails.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        options: ReflectorOptions,
    ) -> Result<Self, ReflectorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            project_id: options.project_id,
            registry_id: options.registry_id,
            udmi_version: options.udmi_version,
            update_to: options.update_to,
            required_version: options.required_version,
            initial_config: watch::Sender::new(false),
            valid_config: watch::Sender::new(false),
            setup: Mutex::new(SetupProgress::default()),
            messages: tx,
        });
        for topic in ["config", "commands"] {
            let handler_shared = Arc::clone(&shared);
            transport.register_handler(
                topic,
                Arc::new(move |message: InboundMessage| handler_shared.handle_message(message)),
            );
        }

        let client = ReflectorClient {
            transport,
            shared,
            messages: tokio::sync::Mutex::new(rx),
            active: AtomicBool::new(false),
            user: options.user,
            config_timeout: options.config_timeout,
        };
        if let Err(e) = client.setup().await {
            client.transport.close().await;
            return Err(e);
        }
        client.active.store(true, Ordering::SeqCst);
        info!(registry_id = %client.shared.registry_id, "reflector setup complete");
        Ok(client)
    }

    async fn setup(&self) -> Result<(), ReflectorError> {
        let mut initial = self.shared.initial_config.subscribe();
        let mut valid = self.shared.valid_config.subscribe();
        self.transport.connect().await?;

        info!("Starting initial UDMI setup process");
        if tokio::time::timeout(self.config_timeout, initial.wait_for(|r| *r))
            .await
            .is_err()
        {
            info!("Ignoring initial config received timeout (config likely empty)");
        }

        let mut retries = if self.shared.update_to.is_some() {
            UPDATE_RETRIES
        } else {
            1
        };
        loop {
            self.publish_reflector_state()?;
            if matches!(
                tokio::time::timeout(self.config_timeout, valid.wait_for(|v| *v)).await,
                Ok(Ok(_))
            ) {
                return Ok(());
            }
            retries -= 1;
            if retries == 0 {
                let last_failure = locked(&self.shared.setup).sync_failure.clone();
                return Err(ReflectorError::SyncTimeout { last_failure });
            }
            debug!(retries, "UDMI setup config not received, retrying");
        }
    }

    fn publish_reflector_state(&self) -> Result<(), ReflectorError> {
        let timestamp = Utc::now();
        let state = ReflectorState {
            timestamp,
            version: self.shared.udmi_version.clone(),
            udmi: UdmiState {
                setup: Some(SetupUdmiState {
                    user: self.user.clone(),
                    update_to: self.shared.update_to.clone(),
                }),
            },
        };
        let payload = serde_json::to_vec(&state)?;
        locked(&self.shared.setup).state_timestamp = Some(timestamp);
        info!(version = %state.version, %timestamp, "setting reflector state");
        self.transport.publish(STATE_TOPIC, payload)?;
        locked(&self.shared.setup).state_sent = true;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.transport.is_active()
    }

    pub fn registry_id(&self) -> &str {
        &self.shared.registry_id
    }

    /// Next queued message, or `None` if nothing arrives within `timeout`.
    pub async fn take_next_message(
        &self,
        timeout: Duration,
    ) -> Result<Option<MessageBundle>, ReflectorError> {
        if !self.is_active() {
            return Err(ReflectorError::Inactive);
        }
        let mut rx = self.messages.lock().await;
        Ok(tokio::time::timeout(timeout, rx.recv()).await.ok().flatten())
    }

    /// Send `data` for `device_id` through the reflector. `topic` is
    /// `{subFolder}/{subType}`. Returns the transaction id.
    pub fn publish(&self, device_id: &str, topic: &str, data: &str) -> Result<String, ReflectorError> {
        let (sub_folder, sub_type) = topic
            .split_once('/')
            .ok_or_else(|| ReflectorError::PublishTopic(topic.to_owned()))?;
        let transaction_id = next_transaction_id();
        let envelope = Envelope {
            device_registry_id: Some(self.shared.registry_id.clone()),
            device_id: Some(device_id.to_owned()),
            sub_folder: Some(sub_folder.to_owned()),
            sub_type: Some(sub_type.to_owned()),
            payload: Some(BASE64_STANDARD.encode(data)),
            transaction_id: Some(transaction_id.clone()),
            publish_time: Some(Utc::now()),
            ..Envelope::default()
        };
        self.transport
            .publish(UDMI_TOPIC, serde_json::to_vec(&envelope)?)?;
        debug!(device_id, topic, transaction_id = %transaction_id, "reflector publish");
        Ok(transaction_id)
    }

    /// Cloud install details from the accepted setup config.
    pub fn version_information(&self) -> Result<SetupUdmiConfig, ReflectorError> {
        locked(&self.shared.setup)
            .udmi_info
            .clone()
            .ok_or(ReflectorError::VersionUnavailable)
    }

    pub async fn close(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.transport.close().await;
    }
}
