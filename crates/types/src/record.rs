use std::fmt;

use serde::{Deserialize, Serialize};

/// Persisted devnet state, used to reconnect to the same node between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevnetRecord {
    /// Container to restart. Absent until the first container was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    /// Chain id that was set when the devnet was created.
    pub chain_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Port on which the devnet listens.
    pub port: RecordPort,
}

impl DevnetRecord {
    pub fn new(chain_id: impl Into<String>, port: u16) -> Self {
        Self {
            container_id: None,
            chain_id: chain_id.into(),
            host: None,
            port: RecordPort::Number(port),
        }
    }

    pub fn with_container_id(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

/// Older records stored the port as a string; both forms are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordPort {
    Number(u16),
    Text(String),
}

impl RecordPort {
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Self::Number(port) => Some(*port),
            Self::Text(port) => port.trim().parse().ok(),
        }
    }
}

impl From<u16> for RecordPort {
    fn from(port: u16) -> Self {
        Self::Number(port)
    }
}

impl fmt::Display for RecordPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(port) => write!(f, "{port}"),
            Self::Text(port) => f.write_str(port),
        }
    }
}
