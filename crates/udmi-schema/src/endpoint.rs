//! Transport connection parameters and client id handling.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Mqtt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Ssl,
    Tcp,
}

/// Parameters for one transport connection.
///
/// Two endpoints are the same redirection target iff they compare equal
/// field by field, `generation` and `error` included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<DateTime<Utc>>,
    /// Set when the cloud reports it could not produce an endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EndpointConfiguration {
    pub fn from_error(error: impl Into<String>) -> Self {
        EndpointConfiguration {
            error: Some(error.into()),
            ..EndpointConfiguration::default()
        }
    }
}

/// Parsed `projects/{p}/locations/{r}/registries/{reg}/devices/{d}` client id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId {
    pub project: String,
    pub region: String,
    pub registry: String,
    pub device: String,
}

impl ClientId {
    pub fn parse(raw: &str) -> Option<ClientId> {
        let parts: Vec<&str> = raw.split('/').collect();
        match parts.as_slice() {
            ["projects", project, "locations", region, "registries", registry, "devices", device] => {
                Some(ClientId {
                    project: (*project).to_owned(),
                    region: (*region).to_owned(),
                    registry: (*registry).to_owned(),
                    device: (*device).to_owned(),
                })
            }
            _ => None,
        }
    }

    pub fn with_registry(&self, registry: &str) -> ClientId {
        ClientId {
            registry: registry.to_owned(),
            ..self.clone()
        }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.project, self.region, self.registry, self.device
        )
    }
}
