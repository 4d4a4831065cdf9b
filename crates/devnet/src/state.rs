//! Persisted devnet record under the per-chain state directory.
//!
//! The state directory is the identity of a devnet: one directory, one node.
//! Corrupted records are never partially trusted; callers are expected to
//! discard the whole directory.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use types::DevnetRecord;

pub const RECORD_FILE_NAME: &str = "devnet.json";
pub const WALLET_DIR_NAME: &str = "wallet";
const RECORD_TMP_SUFFIX: &str = "tmp";

/// Removes a directory tree. Swappable so permission failures can be staged.
pub type DirRemover = fn(&Path) -> io::Result<()>;

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
    remover: DirRemover,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            remover: remove_dir_tree,
        }
    }

    pub fn with_remover(mut self, remover: DirRemover) -> Self {
        self.remover = remover;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self) -> PathBuf {
        self.root.join(RECORD_FILE_NAME)
    }

    /// Directory into which the node writes one credential file per identity.
    pub fn wallet_dir(&self) -> PathBuf {
        self.root.join(WALLET_DIR_NAME)
    }

    pub fn record_exists(&self) -> bool {
        self.record_path().is_file()
    }

    pub fn ensure_root(&self) -> Result<(), StateError> {
        fs::create_dir_all(&self.root).map_err(|source| StateError::Io {
            action: "create",
            path: self.root.clone(),
            source,
        })
    }

    /// Reads the record. A missing file is `Ok(None)`; this never touches the
    /// filesystem beyond reading.
    pub fn load(&self) -> Result<Option<DevnetRecord>, StateError> {
        let path = self.record_path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    action: "read",
                    path,
                    source,
                });
            }
        };

        let record: DevnetRecord =
            serde_json::from_str(&contents).map_err(|source| StateError::Corrupt {
                path: path.clone(),
                message: source.to_string(),
            })?;
        if record.chain_id.trim().is_empty() {
            return Err(StateError::Corrupt {
                path,
                message: "record has an empty chain id".to_owned(),
            });
        }
        Ok(Some(record))
    }

    /// Atomically replaces the record, creating the state directory if needed.
    pub fn save(&self, record: &DevnetRecord) -> Result<(), StateError> {
        self.ensure_root()?;
        let path = self.record_path();
        let tmp_path = path.with_extension(RECORD_TMP_SUFFIX);
        let payload = serde_json::to_vec_pretty(record).map_err(|source| StateError::Corrupt {
            path: path.clone(),
            message: source.to_string(),
        })?;
        fs::write(&tmp_path, payload).map_err(|source| StateError::Io {
            action: "write",
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, &path).map_err(|source| StateError::Io {
            action: "replace",
            path,
            source,
        })
    }

    /// Deletes the whole state directory. Absent directories are not an error.
    pub fn remove_all(&self) -> io::Result<()> {
        if !self.root.exists() {
            return Ok(());
        }
        (self.remover)(&self.root)
    }
}

fn remove_dir_tree(path: &Path) -> io::Result<()> {
    fs::remove_dir_all(path)
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("devnet state `{path}` is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("failed to {action} devnet state `{path}`: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StateError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}
