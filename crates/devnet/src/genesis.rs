//! Credentials of the pre-funded accounts a devnet creates at genesis.
//!
//! The node writes one JSON file per identity into its wallet directory on
//! first boot. Only `mnemonic` and `address` are relied upon; anything else
//! the node adds is kept verbatim.

use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DevnetError;

const CONTAINER_STATE_DIR: &str = "/state";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAccount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub mnemonic: String,
    pub address: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Rejects names outside the configured identity list before any I/O.
pub fn ensure_known_identity(identities: &[String], name: &str) -> Result<(), DevnetError> {
    if identities.iter().any(|identity| identity == name) {
        Ok(())
    } else {
        Err(DevnetError::missing_identity(
            name,
            "not one of the configured genesis identities",
        ))
    }
}

pub fn account_file_name(name: &str) -> String {
    format!("{name}.json")
}

/// Where the node keeps the wallet file inside its own filesystem.
pub fn container_account_path(chain_id: &str, name: &str) -> String {
    format!(
        "{CONTAINER_STATE_DIR}/{chain_id}/wallet/{}",
        account_file_name(name)
    )
}

pub fn read_account_file(wallet_dir: &Path, name: &str) -> Result<GenesisAccount, DevnetError> {
    let path = wallet_dir.join(account_file_name(name));
    let raw = fs::read_to_string(&path).map_err(|error| {
        let reason = if error.kind() == io::ErrorKind::NotFound {
            format!("`{}` does not exist", path.display())
        } else {
            format!("failed to read `{}`: {error}", path.display())
        };
        DevnetError::missing_identity(name, reason)
    })?;
    parse_account(name, &raw)
}

/// Parses a wallet file. Blank credentials count as missing.
pub fn parse_account(name: &str, raw: &str) -> Result<GenesisAccount, DevnetError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DevnetError::missing_identity(name, "credentials are empty"));
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|error| DevnetError::missing_identity(name, error))?;
    account_from_value(name, value)
}

pub(crate) fn account_from_value(name: &str, value: Value) -> Result<GenesisAccount, DevnetError> {
    let mut account: GenesisAccount = serde_json::from_value(value)
        .map_err(|error| DevnetError::missing_identity(name, error))?;
    if account.mnemonic.trim().is_empty() || account.address.trim().is_empty() {
        return Err(DevnetError::missing_identity(
            name,
            "credentials have no mnemonic or address",
        ));
    }
    account.name.get_or_insert_with(|| name.to_owned());
    Ok(account)
}
