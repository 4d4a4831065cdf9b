//! The narrow surface the devnet core uses against a container engine.
//!
//! Everything the orchestrator needs from the engine goes through
//! [`ContainerEngine`] and [`ContainerHandle`], so the lifecycle logic can be
//! exercised against an in-memory engine in tests. Errors crossing this
//! boundary are only ever distinguished by [`EngineError::is_not_found`].

use std::{collections::BTreeMap, fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// Raw output of a running container, in arbitrarily sized chunks.
pub type LogStream = BoxStream<'static, Result<String, EngineError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl BindMount {
    pub fn read_write(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }

    pub fn read_only(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: true,
        }
    }

    /// `host:container:mode`, as understood by the engine's bind syntax.
    pub fn to_bind(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!(
            "{}:{}:{mode}",
            self.host_path.to_string_lossy(),
            self.container_path
        )
    }
}

/// Everything needed to create and start one container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Host port published for the same container port over TCP.
    pub published_ports: Vec<u16>,
    pub mounts: Vec<BindMount>,
    pub entrypoint: Option<Vec<String>>,
    pub command: Vec<String>,
    pub hostname: Option<String>,
    pub tty: bool,
    pub privileged: bool,
    pub auto_remove: bool,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait ContainerEngine: Send + Sync + fmt::Debug {
    /// Human-readable label for log lines and error context.
    fn label(&self) -> String;

    /// Creates the container described by `spec` and starts it. A leftover
    /// container with the same name is replaced.
    async fn create_and_run(
        &self,
        spec: ContainerSpec,
    ) -> Result<Arc<dyn ContainerHandle>, EngineError>;

    /// Looks up an existing container, running or not.
    async fn resolve(&self, container_id: &str) -> Result<Arc<dyn ContainerHandle>, EngineError>;
}

#[async_trait]
pub trait ContainerHandle: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    async fn is_running(&self) -> Result<bool, EngineError>;

    async fn start(&self) -> Result<(), EngineError>;

    /// Stops the container. Killing a container that is not running succeeds.
    async fn kill(&self) -> Result<(), EngineError>;

    /// Follows the container output from its start.
    async fn logs(&self) -> Result<LogStream, EngineError>;

    /// Blocks until the container exits and returns its exit code.
    async fn wait_exit(&self) -> Result<i64, EngineError>;

    /// Runs a one-off command in the running container and returns its
    /// standard output.
    async fn exec(&self, command: &[String]) -> Result<String, EngineError>;

    /// Snapshots the container filesystem into an image and returns its id.
    async fn commit(&self, repository: &str, tag: &str) -> Result<String, EngineError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("container `{container}` not found")]
    NotFound { container: String },
    #[error("container engine connection to `{endpoint}` failed: {message}")]
    Connect { endpoint: String, message: String },
    #[error("container engine operation `{operation}` for `{target}` failed: {message}")]
    Operation {
        operation: &'static str,
        target: String,
        message: String,
    },
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn operation(
        operation: &'static str,
        target: impl Into<String>,
        message: impl fmt::Display,
    ) -> Self {
        Self::Operation {
            operation,
            target: target.into(),
            message: message.to_string(),
        }
    }
}
