use std::{io, path::PathBuf};

use thiserror::Error;
use types::DevnetConfigError;

use crate::{engine::EngineError, readiness::ReadinessError, state::StateError};

/// Errors surfaced by devnet operations.
///
/// Recoverable conditions met during `respawn` (corrupt state, a container
/// that no longer exists, a stopped container) are handled in place and only
/// logged. `ContainerNotFound` reaches the caller only from operations that
/// cannot recover, such as exporting a recorded container.
#[derive(Debug, Error)]
pub enum DevnetError {
    #[error(transparent)]
    Configuration(#[from] DevnetConfigError),
    #[error("devnet state `{path}` is corrupt: {message}")]
    StateCorrupt { path: PathBuf, message: String },
    #[error("failed to {action} devnet state `{path}`: {source}")]
    State {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("container `{container_id}` of devnet `{chain_id}` no longer exists")]
    ContainerNotFound {
        chain_id: String,
        container_id: String,
    },
    #[error("devnet `{chain_id}` did not become ready: {source}")]
    ReadinessTimeout {
        chain_id: String,
        #[source]
        source: ReadinessError,
    },
    #[error("devnet `{chain_id}` stopped producing output before it became ready: {source}")]
    LogStreamEnded {
        chain_id: String,
        #[source]
        source: ReadinessError,
    },
    #[error("container engine `{operation}` failed for devnet `{chain_id}`: {source}")]
    Engine {
        chain_id: String,
        operation: &'static str,
        #[source]
        source: EngineError,
    },
    #[error("failed to erase devnet state `{path}`: {source}")]
    EraseFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cleanup container could not erase devnet state `{path}`: {message}")]
    CleanupFailed { path: PathBuf, message: String },
    #[error("genesis account `{name}` is unavailable: {reason}")]
    MissingIdentity { name: String, reason: String },
    #[error("failed to allocate a devnet port: {source}")]
    PortAllocation {
        #[source]
        source: io::Error,
    },
    #[error("devnet manager request `{operation}` to `{endpoint}` failed: {message}")]
    Manager {
        operation: &'static str,
        endpoint: String,
        message: String,
    },
    #[error("`{operation}` is not supported by {backend}")]
    Unsupported {
        operation: &'static str,
        backend: String,
    },
}

impl DevnetError {
    pub(crate) fn engine(
        chain_id: impl Into<String>,
        operation: &'static str,
        source: EngineError,
    ) -> Self {
        Self::Engine {
            chain_id: chain_id.into(),
            operation,
            source,
        }
    }

    pub(crate) fn missing_identity(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::MissingIdentity {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Sorts a failed readiness wait into the caller-facing taxonomy.
    pub(crate) fn from_readiness(chain_id: impl Into<String>, source: ReadinessError) -> Self {
        let chain_id = chain_id.into();
        match source {
            ReadinessError::StreamEnded { .. } => Self::LogStreamEnded { chain_id, source },
            ReadinessError::Logs(source) => Self::Engine {
                chain_id,
                operation: "logs",
                source,
            },
            source => Self::ReadinessTimeout { chain_id, source },
        }
    }
}

impl From<StateError> for DevnetError {
    fn from(value: StateError) -> Self {
        match value {
            StateError::Corrupt { path, message } => Self::StateCorrupt { path, message },
            StateError::Io {
                action,
                path,
                source,
            } => Self::State {
                action,
                path,
                source,
            },
        }
    }
}
