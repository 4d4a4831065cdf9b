use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use types::{
    DEFAULT_CONTAINER_GID, DEFAULT_CONTAINER_UID, DevnetConfig, DevnetConfigError, PortMode,
};

/// Fully resolved, immutable inputs of a container devnet. Built once from a
/// validated [`DevnetConfig`]; nothing downstream reads the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevnetSettings {
    pub chain_id: String,
    pub identities: Vec<String>,
    pub state_root: PathBuf,
    pub host: String,
    /// Pinned host port. `None` lets the allocator pick one.
    pub port: Option<u16>,
    pub port_mode: PortMode,
    pub image: String,
    pub ready_phrase: String,
    pub init_script: Option<PathBuf>,
    pub ephemeral: bool,
    pub launch_timeout: Duration,
    pub post_launch_wait: Duration,
    pub uid: u32,
    pub gid: u32,
    pub verbose: bool,
    /// Whether the state directory is bind-mounted into the node.
    pub mount_state: bool,
}

impl DevnetSettings {
    pub fn from_config(config: &DevnetConfig) -> Result<Self, DevnetConfigError> {
        config.validate()?;
        Ok(Self {
            chain_id: config.chain_id.trim().to_owned(),
            identities: config.identities.clone(),
            state_root: config.resolved_state_root(),
            host: config.host.trim().to_owned(),
            port: config.port.filter(|port| *port != 0),
            port_mode: config.resolved_port_mode()?,
            image: config.resolved_image()?,
            ready_phrase: config.resolved_ready_phrase()?,
            init_script: config.init_script.clone(),
            ephemeral: config.ephemeral,
            launch_timeout: Duration::from_secs(config.launch_timeout_secs),
            post_launch_wait: Duration::from_secs(config.post_launch_wait_secs),
            uid: config.uid.unwrap_or(DEFAULT_CONTAINER_UID),
            gid: config.gid.unwrap_or(DEFAULT_CONTAINER_GID),
            verbose: config.verbose,
            mount_state: !config.no_state_mount,
        })
    }

    /// Environment the node image reads on boot.
    pub fn node_environment(&self, port: u16) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            (
                "Verbose".to_owned(),
                if self.verbose { "yes" } else { "" }.to_owned(),
            ),
            ("ChainID".to_owned(), self.chain_id.clone()),
            ("GenesisAccounts".to_owned(), self.identities.join(" ")),
            ("_UID".to_owned(), self.uid.to_string()),
            ("_GID".to_owned(), self.gid.to_string()),
        ]);
        match self.port_mode {
            PortMode::Lcp => env.insert("lcpPort".to_owned(), port.to_string()),
            PortMode::GrpcWeb => env.insert("grpcWebAddr".to_owned(), format!("0.0.0.0:{port}")),
        };
        env
    }

    /// `<chain_id>-<port>`, reduced to characters container names accept.
    pub fn container_name(&self, port: Option<u16>) -> String {
        let chain = sanitize_container_component(&self.chain_id);
        match port {
            Some(port) => format!("{chain}-{port}"),
            None => chain,
        }
    }
}

fn sanitize_container_component(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '_' | '.' | '-') {
                ch
            } else {
                '-'
            }
        })
        .collect();
    let sanitized = sanitized.trim_start_matches(['_', '.', '-']);
    if sanitized.is_empty() {
        "devnet".to_owned()
    } else {
        sanitized.to_owned()
    }
}
