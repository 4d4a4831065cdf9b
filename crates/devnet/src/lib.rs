//! Lifecycle management for a single disposable local blockchain node.
//!
//! One state directory holds one devnet. [`Devnet`] is the common surface;
//! [`ContainerDevnet`] runs the node in a local container and
//! [`ManagedDevnet`] delegates it to a remote HTTP manager. Pick one with
//! [`build_devnet`].
//!
//! Neither implementation is safe for concurrent callers against the same
//! state directory. Operations take `&mut self` and assume they are the only
//! writer; no file lock is held.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use types::{DevnetBackend, DevnetConfig};
use url::Url;

pub mod bootstrap;
mod container;
pub mod docker;
pub mod engine;
mod error;
pub mod genesis;
mod managed;
pub mod port;
pub mod readiness;
mod settings;
mod shutdown;
pub mod state;

pub use container::ContainerDevnet;
pub use docker::{DockerEndpoint, DockerEngine};
pub use engine::{BindMount, ContainerEngine, ContainerHandle, ContainerSpec, EngineError};
pub use error::DevnetError;
pub use genesis::GenesisAccount;
pub use managed::ManagedDevnet;
pub use port::{OsPortProbe, PortProbe, allocate_port};
pub use readiness::{LineFilter, ReadinessDetector, ReadinessError};
pub use settings::DevnetSettings;
pub use shutdown::{DEFAULT_HOOK_TIMEOUT, ShutdownHooks};
pub use state::{StateError, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevnetPhase {
    Unspawned,
    Spawning,
    /// Only entered while `respawn` validates persisted state.
    Recovering,
    Running,
    Stopped,
    Erased,
}

impl fmt::Display for DevnetPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unspawned => "unspawned",
            Self::Spawning => "spawning",
            Self::Recovering => "recovering",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Erased => "erased",
        };
        f.write_str(label)
    }
}

#[async_trait]
pub trait Devnet: Send + Sync + fmt::Debug {
    fn chain_id(&self) -> &str;

    fn phase(&self) -> DevnetPhase;

    /// Base URL of the node's published service, once a port is known.
    fn url(&self) -> Option<Url>;

    /// Creates a fresh node and waits until it is ready.
    async fn spawn(&mut self) -> Result<(), DevnetError>;

    /// Ensures a running node exists for this state directory, reusing
    /// persisted state when it is still valid.
    async fn respawn(&mut self) -> Result<(), DevnetError>;

    /// Stops the node. Stopping a node that cannot be found succeeds.
    async fn kill(&mut self) -> Result<(), DevnetError>;

    /// Deletes the whole state directory.
    async fn erase(&mut self) -> Result<(), DevnetError>;

    async fn terminate(&mut self) -> Result<(), DevnetError> {
        self.kill().await?;
        self.erase().await
    }

    async fn genesis_account(&self, name: &str) -> Result<GenesisAccount, DevnetError>;
}

/// Builds the devnet selected by `config.backend`. Container devnets connect
/// to the local Docker daemon and register their exit hook into `hooks`.
pub fn build_devnet(
    config: &DevnetConfig,
    hooks: ShutdownHooks,
) -> Result<Box<dyn Devnet>, DevnetError> {
    let probe: Arc<dyn PortProbe> = Arc::new(OsPortProbe);
    match config.backend {
        DevnetBackend::Container => {
            let settings = DevnetSettings::from_config(config)?;
            let engine = DockerEngine::connect(DockerEndpoint::Local)
                .map_err(|source| DevnetError::engine(&settings.chain_id, "connect", source))?;
            Ok(Box::new(
                ContainerDevnet::new(settings, Arc::new(engine), probe).with_shutdown_hooks(hooks),
            ))
        }
        DevnetBackend::Managed => Ok(Box::new(ManagedDevnet::from_config(config, probe)?)),
    }
}

#[cfg(test)]
mod tests;
