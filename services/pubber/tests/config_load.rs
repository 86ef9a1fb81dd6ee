/// Integration tests for pubber config loading.
///
/// Tests required field validation, default values, endpoint parsing,
/// and option switches.
use pubber::config::{ConfigError, load_config_from_path, load_config_from_str};
use std::io::Write;
use std::time::Duration;
use udmi_schema::{Protocol, TransportKind};

// ---------------------------------------------------------------------------
// Required fields
// ---------------------------------------------------------------------------

#[test]
fn valid_minimal_config_loads_ok() {
    let toml = r#"
schema_version = 1
device_id = "AHU-1"
"#;
    let cfg = load_config_from_str(toml).expect("should load");
    assert_eq!(cfg.schema_version, 1);
    assert_eq!(cfg.device_id, "AHU-1");
    assert_eq!(cfg.serial_no, "sn-AHU-1");
    assert!(cfg.endpoint.is_none());
}

#[test]
fn missing_schema_version_fails() {
    let err = load_config_from_str(r#"device_id = "AHU-1""#).unwrap_err();
    assert!(
        matches!(err, ConfigError::MissingField(ref f) if f == "schema_version"),
        "got: {}",
        err
    );
}

#[test]
fn unsupported_schema_version_fails() {
    let toml = r#"
schema_version = 2
device_id = "AHU-1"
"#;
    let err = load_config_from_str(toml).unwrap_err();
    assert!(err.to_string().contains("schema_version must be 1"), "got: {}", err);
}

#[test]
fn blank_device_id_fails() {
    let toml = r#"
schema_version = 1
device_id = "   "
"#;
    let err = load_config_from_str(toml).unwrap_err();
    assert!(matches!(err, ConfigError::MissingField(ref f) if f == "device_id"));
}

#[test]
fn malformed_toml_is_a_parse_error() {
    let err = load_config_from_str("schema_version = ").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

#[test]
fn timing_defaults_apply() {
    let cfg = load_config_from_str("schema_version = 1\ndevice_id = \"AHU-1\"").unwrap();
    assert_eq!(cfg.report_interval, Duration::from_secs(10));
    assert_eq!(cfg.timing.state_throttle, Duration::from_millis(2000));
    assert_eq!(cfg.timing.connect_retries, 10);
    assert_eq!(cfg.timing.config_wait, Duration::from_secs(10));
    assert_eq!(cfg.timing.scan_duration, Duration::from_secs(10));
    assert_eq!(cfg.out_dir.to_str(), Some("pubber/out"));
    assert_eq!(cfg.options, Default::default());
}

#[test]
fn timing_overrides_apply() {
    let toml = r#"
schema_version = 1
device_id = "AHU-1"
report_interval_sec = 30

[timing]
state_throttle_ms = 500
connect_retries = 3
retry_backoff_ms = 250
config_wait_sec = 4
"#;
    let cfg = load_config_from_str(toml).unwrap();
    assert_eq!(cfg.report_interval, Duration::from_secs(30));
    assert_eq!(cfg.timing.state_throttle, Duration::from_millis(500));
    assert_eq!(cfg.timing.connect_retries, 3);
    assert_eq!(cfg.timing.retry_backoff, Duration::from_millis(250));
    assert_eq!(cfg.timing.config_wait, Duration::from_secs(4));
    // Untouched fields keep defaults.
    assert_eq!(cfg.timing.publish_wait, Duration::from_secs(10));
}

#[test]
fn zero_connect_retries_fails() {
    let toml = r#"
schema_version = 1
device_id = "AHU-1"

[timing]
connect_retries = 0
"#;
    let err = load_config_from_str(toml).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue(_)));
}

#[test]
fn zero_report_interval_fails() {
    let toml = r#"
schema_version = 1
device_id = "AHU-1"
report_interval_sec = 0
"#;
    assert!(load_config_from_str(toml).is_err());
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

#[test]
fn endpoint_section_is_parsed() {
    let toml = r#"
schema_version = 1
device_id = "AHU-1"

[endpoint]
hostname = "mqtt.example.com"
port = 8883
transport = "ssl"
client_id = "projects/p/locations/us-central1/registries/ZZ/devices/AHU-1"
"#;
    let cfg = load_config_from_str(toml).unwrap();
    let endpoint = cfg.endpoint.expect("endpoint");
    assert_eq!(endpoint.protocol, Some(Protocol::Mqtt));
    assert_eq!(endpoint.transport, Some(TransportKind::Ssl));
    assert_eq!(endpoint.port, Some(8883));
    assert_eq!(endpoint.hostname.as_deref(), Some("mqtt.example.com"));
}

#[test]
fn non_mqtt_protocol_is_rejected() {
    let toml = r#"
schema_version = 1
device_id = "AHU-1"

[endpoint]
protocol = "amqp"
hostname = "broker"
"#;
    let err = load_config_from_str(toml).unwrap_err();
    assert!(err.to_string().contains("protocol mismatch"), "got: {}", err);
}

#[test]
fn unknown_transport_is_rejected() {
    let toml = r#"
schema_version = 1
device_id = "AHU-1"

[endpoint]
hostname = "broker"
transport = "udp"
"#;
    assert!(matches!(
        load_config_from_str(toml).unwrap_err(),
        ConfigError::InvalidValue(_)
    ));
}

// ---------------------------------------------------------------------------
// Options and file loading
// ---------------------------------------------------------------------------

#[test]
fn option_switches_are_read() {
    let toml = r#"
schema_version = 1
device_id = "AHU-1"

[options]
no_persist = true
empty_missing = true
extra_field = "sneaky"
redirect_registry = "YY"
"#;
    let cfg = load_config_from_str(toml).unwrap();
    assert!(cfg.options.no_persist);
    assert!(cfg.options.empty_missing);
    assert!(!cfg.options.barf_config);
    assert_eq!(cfg.options.extra_field.as_deref(), Some("sneaky"));
    assert_eq!(cfg.options.redirect_registry.as_deref(), Some("YY"));
}

#[test]
fn load_from_path_reads_file() {
    let mut f = tempfile::NamedTempFile::new().expect("create temp file");
    write!(f, "schema_version = 1\ndevice_id = \"FCU-2\"\nserial_no = \"X-77\"\n").unwrap();
    let cfg = load_config_from_path(f.path()).unwrap();
    assert_eq!(cfg.device_id, "FCU-2");
    assert_eq!(cfg.serial_no, "X-77");
    assert_eq!(cfg.trace_dir(), cfg.out_dir.join("X-77"));
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_config_from_path(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}
