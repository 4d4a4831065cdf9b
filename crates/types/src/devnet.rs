use std::{collections::BTreeSet, fmt, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_DEVNET_CHAIN_ID: &str = "fadroma-devnet";
pub const DEFAULT_DEVNET_HOST: &str = "localhost";
pub const DEFAULT_STATE_PARENT_DIR: &str = "state";
pub const DEFAULT_GENESIS_IDENTITIES: [&str; 5] = ["Admin", "Alice", "Bob", "Charlie", "Mallory"];
pub const DEFAULT_LAUNCH_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_POST_LAUNCH_WAIT_SECS: u64 = 7;
pub const DEFAULT_READY_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_CONTAINER_UID: u32 = 1000;
pub const DEFAULT_CONTAINER_GID: u32 = 1000;

/// Which devnet strategy backs a state directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DevnetBackend {
    /// A node container driven directly through the local container engine.
    #[default]
    Container,
    /// A node spawned on request by a remote devnet manager over HTTP.
    Managed,
}

/// Which of the node's network services is published on the devnet port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortMode {
    /// The light client proxy (REST) API.
    Lcp,
    /// The gRPC-web endpoint.
    GrpcWeb,
}

impl fmt::Display for PortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lcp => f.write_str("lcp"),
            Self::GrpcWeb => f.write_str("grpc_web"),
        }
    }
}

/// Known node images and the defaults that go with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DevnetPlatform {
    #[serde(rename = "scrt_1.2")]
    Scrt1_2,
    #[serde(rename = "scrt_1.3")]
    Scrt1_3,
    #[serde(rename = "scrt_1.4")]
    Scrt1_4,
    #[serde(rename = "scrt_1.5")]
    Scrt1_5,
    #[serde(rename = "scrt_1.6")]
    Scrt1_6,
    #[serde(rename = "scrt_1.7")]
    Scrt1_7,
    #[serde(rename = "scrt_1.8")]
    Scrt1_8,
}

impl DevnetPlatform {
    pub const ALL: [DevnetPlatform; 7] = [
        Self::Scrt1_2,
        Self::Scrt1_3,
        Self::Scrt1_4,
        Self::Scrt1_5,
        Self::Scrt1_6,
        Self::Scrt1_7,
        Self::Scrt1_8,
    ];

    pub const fn version(self) -> &'static str {
        match self {
            Self::Scrt1_2 => "1.2",
            Self::Scrt1_3 => "1.3",
            Self::Scrt1_4 => "1.4",
            Self::Scrt1_5 => "1.5",
            Self::Scrt1_6 => "1.6",
            Self::Scrt1_7 => "1.7",
            Self::Scrt1_8 => "1.8",
        }
    }

    pub const fn default_port_mode(self) -> PortMode {
        match self {
            Self::Scrt1_3 | Self::Scrt1_4 => PortMode::GrpcWeb,
            _ => PortMode::Lcp,
        }
    }

    pub fn default_image(self) -> String {
        format!(
            "ghcr.io/hackbg/fadroma-devnet-scrt-{}:master",
            self.version()
        )
    }

    pub const fn ready_phrase(self) -> &'static str {
        match self {
            Self::Scrt1_8 => "Done verifying block height",
            _ => "indexed block",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let version = value.strip_prefix("scrt_").unwrap_or(value);
        Self::ALL
            .into_iter()
            .find(|platform| platform.version() == version)
    }
}

impl fmt::Display for DevnetPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scrt_{}", self.version())
    }
}

/// User-facing devnet configuration. Resolved once at the application
/// boundary, then handed to the orchestrator as plain data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevnetConfig {
    #[serde(default)]
    pub backend: DevnetBackend,
    #[serde(default = "default_chain_id")]
    pub chain_id: String,
    #[serde(default = "default_identities")]
    pub identities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_root: Option<PathBuf>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_mode: Option<PortMode>,
    #[serde(default = "default_platform", skip_serializing_if = "Option::is_none")]
    pub platform: Option<DevnetPlatform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_phrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_script: Option<PathBuf>,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,
    #[serde(default = "default_post_launch_wait_secs")]
    pub post_launch_wait_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub no_state_mount: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_url: Option<String>,
    #[serde(default = "default_ready_poll_interval_ms")]
    pub ready_poll_interval_ms: u64,
}

impl Default for DevnetConfig {
    fn default() -> Self {
        Self {
            backend: DevnetBackend::default(),
            chain_id: default_chain_id(),
            identities: default_identities(),
            state_root: None,
            host: default_host(),
            port: None,
            port_mode: None,
            platform: default_platform(),
            image: None,
            ready_phrase: None,
            init_script: None,
            ephemeral: false,
            launch_timeout_secs: default_launch_timeout_secs(),
            post_launch_wait_secs: default_post_launch_wait_secs(),
            uid: None,
            gid: None,
            verbose: false,
            no_state_mount: false,
            manager_url: None,
            ready_poll_interval_ms: default_ready_poll_interval_ms(),
        }
    }
}

impl DevnetConfig {
    pub fn validate(&self) -> Result<(), DevnetConfigError> {
        if self.chain_id.trim().is_empty() {
            return Err(DevnetConfigError::EmptyChainId);
        }
        if self.host.trim().is_empty() {
            return Err(DevnetConfigError::EmptyHost);
        }

        let mut seen = BTreeSet::new();
        for (index, identity) in self.identities.iter().enumerate() {
            if identity.trim().is_empty() || identity.contains(char::is_whitespace) {
                return Err(DevnetConfigError::InvalidIdentity { index });
            }
            if !seen.insert(identity.as_str()) {
                return Err(DevnetConfigError::DuplicateIdentity {
                    name: identity.clone(),
                });
            }
        }

        if self.launch_timeout_secs == 0 {
            return Err(DevnetConfigError::InvalidTimeout {
                field: "launch_timeout_secs",
            });
        }

        match self.backend {
            DevnetBackend::Container => {
                self.resolved_port_mode()?;
                self.resolved_image()?;
                self.resolved_ready_phrase()?;
            }
            DevnetBackend::Managed => {
                if self
                    .manager_url
                    .as_deref()
                    .is_none_or(|url| url.trim().is_empty())
                {
                    return Err(DevnetConfigError::MissingManagerUrl);
                }
                if self.ready_poll_interval_ms == 0 {
                    return Err(DevnetConfigError::InvalidTimeout {
                        field: "ready_poll_interval_ms",
                    });
                }
            }
        }

        Ok(())
    }

    /// An explicit port mode wins over the platform default.
    pub fn resolved_port_mode(&self) -> Result<PortMode, DevnetConfigError> {
        self.port_mode
            .or_else(|| self.platform.map(DevnetPlatform::default_port_mode))
            .ok_or(DevnetConfigError::MissingPortMode)
    }

    pub fn resolved_image(&self) -> Result<String, DevnetConfigError> {
        match self.image.as_deref().map(str::trim) {
            Some("") => Err(DevnetConfigError::MissingImage),
            Some(image) => Ok(image.to_owned()),
            None => self
                .platform
                .map(DevnetPlatform::default_image)
                .ok_or(DevnetConfigError::MissingImage),
        }
    }

    pub fn resolved_ready_phrase(&self) -> Result<String, DevnetConfigError> {
        match self.ready_phrase.as_deref() {
            Some(phrase) if phrase.trim().is_empty() => Err(DevnetConfigError::MissingReadyPhrase),
            Some(phrase) => Ok(phrase.to_owned()),
            None => self
                .platform
                .map(|platform| platform.ready_phrase().to_owned())
                .ok_or(DevnetConfigError::MissingReadyPhrase),
        }
    }

    /// `state/<chain_id>` unless a state root was configured.
    pub fn resolved_state_root(&self) -> PathBuf {
        self.state_root.clone().unwrap_or_else(|| {
            PathBuf::from(DEFAULT_STATE_PARENT_DIR).join(self.chain_id.trim())
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DevnetConfigError {
    #[error("refusing to manage a devnet with an empty chain id")]
    EmptyChainId,
    #[error("devnet host must not be empty")]
    EmptyHost,
    #[error("genesis identity #{index} must be a non-empty name without whitespace")]
    InvalidIdentity { index: usize },
    #[error("genesis identity `{name}` is listed more than once")]
    DuplicateIdentity { name: String },
    #[error("devnet port mode is not set and no platform default applies")]
    MissingPortMode,
    #[error("devnet image is not set and no platform default applies")]
    MissingImage,
    #[error("devnet ready phrase is not set and no platform default applies")]
    MissingReadyPhrase,
    #[error("managed devnet requires `manager_url`")]
    MissingManagerUrl,
    #[error("devnet `{field}` must be greater than zero")]
    InvalidTimeout { field: &'static str },
}

fn default_chain_id() -> String {
    DEFAULT_DEVNET_CHAIN_ID.to_owned()
}

fn default_identities() -> Vec<String> {
    DEFAULT_GENESIS_IDENTITIES
        .iter()
        .map(|name| (*name).to_owned())
        .collect()
}

fn default_host() -> String {
    DEFAULT_DEVNET_HOST.to_owned()
}

fn default_platform() -> Option<DevnetPlatform> {
    Some(DevnetPlatform::Scrt1_8)
}

fn default_launch_timeout_secs() -> u64 {
    DEFAULT_LAUNCH_TIMEOUT_SECS
}

fn default_post_launch_wait_secs() -> u64 {
    DEFAULT_POST_LAUNCH_WAIT_SECS
}

fn default_ready_poll_interval_ms() -> u64 {
    DEFAULT_READY_POLL_INTERVAL_MS
}
