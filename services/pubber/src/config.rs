//! Pubber configuration loading.
//!
//! TOML is the config source for the `--config` form; the positional CLI
//! form builds the same structure through [`PubberConfig::from_args`].
//!
//! # Required fields
//! - `schema_version = 1`
//! - `device_id`
//!
//! # Endpoint
//! `[endpoint].protocol` defaults to `mqtt`; any other protocol is rejected.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use udmi_schema::{EndpointConfiguration, Protocol, TransportKind};

pub const DEFAULT_OUT_DIR: &str = "pubber/out";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level device emulator configuration.
#[derive(Debug, Clone)]
pub struct PubberConfig {
    pub schema_version: u32,
    pub device_id: String,
    pub serial_no: String,
    pub iot_project: Option<String>,
    pub site_path: Option<PathBuf>,
    pub out_dir: PathBuf,
    pub persist_dir: Option<PathBuf>,
    pub report_interval: Duration,
    /// Endpoint from the config file. The persistent store may override it.
    pub endpoint: Option<EndpointConfiguration>,
    pub options: PubberOptions,
    pub timing: TimingConfig,
}

/// Behavior switches used to exercise cloud-side validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PubberOptions {
    pub no_persist: bool,
    pub no_state: bool,
    pub bad_version: bool,
    pub bad_category: bool,
    pub barf_config: bool,
    pub config_state_delay: bool,
    pub empty_missing: bool,
    pub smoke_check: bool,
    pub skew_clock: bool,
    pub message_trace: bool,
    /// Value for the out-of-schema `extraField` on pointset events.
    pub extra_field: Option<String>,
    pub redirect_registry: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    pub state_throttle: Duration,
    pub connect_retries: u32,
    pub retry_backoff: Duration,
    pub config_wait: Duration,
    pub scan_duration: Duration,
    pub publish_wait: Duration,
    pub inject_delay: Duration,
    pub forced_state_time: Duration,
    pub shutdown_wait: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            state_throttle: Duration::from_millis(2000),
            connect_retries: 10,
            retry_backoff: Duration::from_millis(1000),
            config_wait: Duration::from_secs(10),
            scan_duration: Duration::from_secs(10),
            publish_wait: Duration::from_secs(10),
            inject_delay: Duration::from_millis(2000),
            forced_state_time: Duration::from_millis(10000),
            shutdown_wait: Duration::from_secs(10),
        }
    }
}

impl PubberConfig {
    /// Config for the positional `project site_path device_id serial_no` form.
    pub fn from_args(iot_project: &str, site_path: &str, device_id: &str, serial_no: &str) -> Self {
        Self {
            schema_version: 1,
            device_id: device_id.to_owned(),
            serial_no: serial_no.to_owned(),
            iot_project: Some(iot_project.to_owned()),
            site_path: Some(PathBuf::from(site_path)),
            out_dir: PathBuf::from(DEFAULT_OUT_DIR),
            persist_dir: None,
            report_interval: Duration::from_secs(10),
            endpoint: None,
            options: PubberOptions::default(),
            timing: TimingConfig::default(),
        }
    }

    /// Minimal config for a device; everything else defaulted.
    pub fn for_device(device_id: &str) -> Self {
        Self {
            schema_version: 1,
            device_id: device_id.to_owned(),
            serial_no: format!("sn-{device_id}"),
            iot_project: None,
            site_path: None,
            out_dir: PathBuf::from(DEFAULT_OUT_DIR),
            persist_dir: None,
            report_interval: Duration::from_secs(10),
            endpoint: None,
            options: PubberOptions::default(),
            timing: TimingConfig::default(),
        }
    }

    /// Directory receiving trace files.
    pub fn trace_dir(&self) -> PathBuf {
        self.out_dir.join(&self.serial_no)
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    device_id: Option<String>,
    serial_no: Option<String>,
    iot_project: Option<String>,
    site_path: Option<String>,
    out_dir: Option<String>,
    persist_dir: Option<String>,
    report_interval_sec: Option<u64>,
    endpoint: Option<RawEndpointConfig>,
    options: Option<RawOptions>,
    timing: Option<RawTimingConfig>,
}

#[derive(Debug, Deserialize)]
struct RawEndpointConfig {
    protocol: Option<String>,
    hostname: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    transport: Option<String>,
    topic_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawOptions {
    no_persist: Option<bool>,
    no_state: Option<bool>,
    bad_version: Option<bool>,
    bad_category: Option<bool>,
    barf_config: Option<bool>,
    config_state_delay: Option<bool>,
    empty_missing: Option<bool>,
    smoke_check: Option<bool>,
    skew_clock: Option<bool>,
    message_trace: Option<bool>,
    extra_field: Option<String>,
    redirect_registry: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTimingConfig {
    state_throttle_ms: Option<u64>,
    connect_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    config_wait_sec: Option<u64>,
    scan_duration_sec: Option<u64>,
    publish_wait_sec: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<PubberConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<PubberConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let device_id = raw
        .device_id
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingField("device_id".to_owned()))?;

    let endpoint = raw.endpoint.map(parse_endpoint).transpose()?;

    let o = raw.options.unwrap_or_default();
    let options = PubberOptions {
        no_persist: o.no_persist.unwrap_or(false),
        no_state: o.no_state.unwrap_or(false),
        bad_version: o.bad_version.unwrap_or(false),
        bad_category: o.bad_category.unwrap_or(false),
        barf_config: o.barf_config.unwrap_or(false),
        config_state_delay: o.config_state_delay.unwrap_or(false),
        empty_missing: o.empty_missing.unwrap_or(false),
        smoke_check: o.smoke_check.unwrap_or(false),
        skew_clock: o.skew_clock.unwrap_or(false),
        message_trace: o.message_trace.unwrap_or(false),
        extra_field: o.extra_field,
        redirect_registry: o.redirect_registry,
    };

    let t = raw.timing.unwrap_or_default();
    let defaults = TimingConfig::default();
    let timing = TimingConfig {
        state_throttle: t
            .state_throttle_ms
            .map_or(defaults.state_throttle, Duration::from_millis),
        connect_retries: t.connect_retries.unwrap_or(defaults.connect_retries),
        retry_backoff: t
            .retry_backoff_ms
            .map_or(defaults.retry_backoff, Duration::from_millis),
        config_wait: t
            .config_wait_sec
            .map_or(defaults.config_wait, Duration::from_secs),
        scan_duration: t
            .scan_duration_sec
            .map_or(defaults.scan_duration, Duration::from_secs),
        publish_wait: t
            .publish_wait_sec
            .map_or(defaults.publish_wait, Duration::from_secs),
        ..defaults
    };
    if timing.connect_retries == 0 {
        return Err(ConfigError::InvalidValue(
            "timing.connect_retries must be at least 1".to_owned(),
        ));
    }

    let report_interval_sec = raw.report_interval_sec.unwrap_or(10);
    if report_interval_sec == 0 {
        return Err(ConfigError::InvalidValue(
            "report_interval_sec must be positive".to_owned(),
        ));
    }

    Ok(PubberConfig {
        schema_version,
        serial_no: raw.serial_no.unwrap_or_else(|| format!("sn-{device_id}")),
        device_id,
        iot_project: raw.iot_project,
        site_path: raw.site_path.map(PathBuf::from),
        out_dir: PathBuf::from(raw.out_dir.unwrap_or_else(|| DEFAULT_OUT_DIR.to_owned())),
        persist_dir: raw.persist_dir.map(PathBuf::from),
        report_interval: Duration::from_secs(report_interval_sec),
        endpoint,
        options,
        timing,
    })
}

fn parse_endpoint(raw: RawEndpointConfig) -> Result<EndpointConfiguration, ConfigError> {
    match raw.protocol.as_deref() {
        None | Some("mqtt") => {}
        Some(other) => {
            return Err(ConfigError::InvalidValue(format!(
                "protocol mismatch: expected mqtt, got {}",
                other
            )));
        }
    }
    let transport = match raw.transport.as_deref() {
        None => None,
        Some("ssl") => Some(TransportKind::Ssl),
        Some("tcp") => Some(TransportKind::Tcp),
        Some(other) => {
            return Err(ConfigError::InvalidValue(format!(
                "endpoint.transport must be ssl or tcp, got {}",
                other
            )));
        }
    };
    Ok(EndpointConfiguration {
        protocol: Some(Protocol::Mqtt),
        transport,
        hostname: raw.hostname,
        port: raw.port,
        client_id: raw.client_id,
        topic_prefix: raw.topic_prefix,
        generation: None,
        error: None,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
