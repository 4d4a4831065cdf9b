//! Resolves the devnet configuration at the application boundary.
//!
//! Layering, lowest precedence first: built-in defaults, the TOML file,
//! `DEVNET_*` environment variables, command-line overrides. This is the only
//! place that reads the process environment.

use std::{
    env, io,
    path::{Path, PathBuf},
};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::Serialize;
use thiserror::Error;
use types::{
    DEFAULT_CONTAINER_GID, DEFAULT_CONTAINER_UID, DevnetConfig, DevnetConfigError, DevnetPlatform,
};

pub const DEFAULT_CONFIG_FILE_NAME: &str = "devnet.toml";
const CONFIG_ENV_PREFIX: &str = "DEVNET_";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CliOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<DevnetPlatform>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("failed to resolve configuration path: {0}")]
    Io(#[from] io::Error),
    #[error("failed to load configuration: {0}")]
    ConfigExtract(#[source] Box<figment::Error>),
    #[error(transparent)]
    ConfigValidation(#[from] DevnetConfigError),
}

impl From<figment::Error> for BootstrapError {
    fn from(value: figment::Error) -> Self {
        Self::ConfigExtract(Box::new(value))
    }
}

/// Loads `config_path`, or `./devnet.toml` when it exists, and applies the
/// environment and `overrides` on top.
pub fn load_devnet_config(
    config_path: Option<&Path>,
    overrides: CliOverrides,
) -> Result<DevnetConfig, BootstrapError> {
    let working_dir = env::current_dir()?;
    let config_path = match config_path {
        Some(path) => Some(path.to_path_buf()),
        None => Some(working_dir.join(DEFAULT_CONFIG_FILE_NAME)).filter(|path| path.is_file()),
    };
    let mut config = load_devnet_config_from(config_path.as_deref(), overrides)?;
    apply_owner_defaults(&mut config, &working_dir);
    Ok(config)
}

/// Same layering as [`load_devnet_config`] without touching the working
/// directory. A missing file is skipped.
pub fn load_devnet_config_from(
    config_path: Option<&Path>,
    overrides: CliOverrides,
) -> Result<DevnetConfig, BootstrapError> {
    let mut figment = Figment::from(Serialized::defaults(DevnetConfig::default()));
    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }
    figment = figment.merge(Env::prefixed(CONFIG_ENV_PREFIX));
    figment = figment.merge(Serialized::defaults(overrides));

    let config: DevnetConfig = figment.extract()?;
    config.validate()?;
    Ok(config)
}

/// Container processes run as the owner of the working directory unless a
/// UID/GID was configured, so files they write stay removable.
///
/// This deliberately uses the directory owner rather than the uid/gid of the
/// managing process: under `sudo` the process is root, but the state
/// directory still has to be deletable by the user who owns the checkout.
pub fn apply_owner_defaults(config: &mut DevnetConfig, working_dir: &Path) {
    let (uid, gid) = directory_owner(working_dir);
    config.uid.get_or_insert(uid);
    config.gid.get_or_insert(gid);
}

#[cfg(unix)]
fn directory_owner(path: &Path) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;

    match std::fs::metadata(path) {
        Ok(metadata) => (metadata.uid(), metadata.gid()),
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "cannot read directory owner, using default uid/gid");
            (DEFAULT_CONTAINER_UID, DEFAULT_CONTAINER_GID)
        }
    }
}

#[cfg(not(unix))]
fn directory_owner(_path: &Path) -> (u32, u32) {
    (DEFAULT_CONTAINER_UID, DEFAULT_CONTAINER_GID)
}
