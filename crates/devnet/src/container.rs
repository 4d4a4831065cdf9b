use std::{
    collections::BTreeMap,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use types::DevnetRecord;
use url::Url;

use crate::{
    Devnet, DevnetPhase,
    engine::{BindMount, ContainerEngine, ContainerHandle, ContainerSpec},
    error::DevnetError,
    genesis::{self, GenesisAccount},
    port::{PortProbe, allocate_port},
    readiness::{LineFilter, ReadinessDetector},
    settings::DevnetSettings,
    shutdown::ShutdownHooks,
    state::{StateError, StateStore},
};

const CHAIN_LABEL: &str = "devnet.chain_id";
const ROLE_LABEL: &str = "devnet.role";
const NODE_ROLE: &str = "node";
const CLEANUP_ROLE: &str = "cleanup";
const CLEANUP_MOUNT_POINT: &str = "/state";
const DEFAULT_EXPORT_TAG: &str = "latest";

/// Outcome of validating persisted state against the engine.
enum Recovery {
    Resumed,
    Respawn,
}

/// Container currently driven by a [`ContainerDevnet`], shared with its exit
/// hook so the hook acts on whichever node is live when it fires.
#[derive(Debug, Clone, Default)]
struct LiveContainer(Arc<Mutex<Option<Arc<dyn ContainerHandle>>>>);

impl LiveContainer {
    fn get(&self) -> Option<Arc<dyn ContainerHandle>> {
        self.0.lock().unwrap_or_else(|error| error.into_inner()).clone()
    }

    fn set(&self, container: Option<Arc<dyn ContainerHandle>>) {
        *self.0.lock().unwrap_or_else(|error| error.into_inner()) = container;
    }
}

/// A devnet whose node runs in a local container.
///
/// Not safe for concurrent callers against one state directory: every
/// operation assumes it is the only writer.
pub struct ContainerDevnet {
    settings: DevnetSettings,
    state: StateStore,
    engine: Arc<dyn ContainerEngine>,
    probe: Arc<dyn PortProbe>,
    detector: ReadinessDetector,
    hooks: Option<ShutdownHooks>,
    container: LiveContainer,
    port: Option<u16>,
    phase: DevnetPhase,
    exit_hook_registered: bool,
}

impl ContainerDevnet {
    pub fn new(
        settings: DevnetSettings,
        engine: Arc<dyn ContainerEngine>,
        probe: Arc<dyn PortProbe>,
    ) -> Self {
        let detector = ReadinessDetector::new(settings.ready_phrase.clone())
            .with_timeout(settings.launch_timeout)
            .with_grace_period(settings.post_launch_wait);
        Self {
            state: StateStore::new(settings.state_root.clone()),
            port: settings.port,
            settings,
            engine,
            probe,
            detector,
            hooks: None,
            container: LiveContainer::default(),
            phase: DevnetPhase::Unspawned,
            exit_hook_registered: false,
        }
    }

    pub fn with_shutdown_hooks(mut self, hooks: ShutdownHooks) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_state_store(mut self, state: StateStore) -> Self {
        self.state = state;
        self
    }

    pub fn with_line_filter(mut self, filter: LineFilter) -> Self {
        self.detector = self.detector.with_filter(filter);
        self
    }

    pub fn settings(&self) -> &DevnetSettings {
        &self.settings
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn container_id(&self) -> Option<String> {
        self.container
            .get()
            .map(|container| container.id().to_owned())
    }

    /// Reads the persisted record without touching the engine.
    pub fn record(&self) -> Result<Option<DevnetRecord>, DevnetError> {
        Ok(self.state.load()?)
    }

    /// Snapshots the node container into an image and returns its id. Falls
    /// back to the recorded container when none is held.
    pub async fn export(
        &self,
        repository: Option<&str>,
        tag: Option<&str>,
    ) -> Result<String, DevnetError> {
        let container = match self.container.get() {
            Some(container) => container,
            None => self.recorded_container().await?,
        };
        let repository = repository
            .map(str::to_owned)
            .unwrap_or_else(|| self.settings.container_name(None));
        let tag = tag.unwrap_or(DEFAULT_EXPORT_TAG);
        info!(
            chain_id = %self.settings.chain_id,
            container_id = container.id(),
            image = %format!("{repository}:{tag}"),
            "exporting devnet container"
        );
        container
            .commit(&repository, tag)
            .await
            .map_err(|source| DevnetError::engine(&self.settings.chain_id, "commit", source))
    }

    async fn recorded_container(&self) -> Result<Arc<dyn ContainerHandle>, DevnetError> {
        let chain_id = &self.settings.chain_id;
        let Some(container_id) = self.state.load()?.and_then(|record| record.container_id) else {
            return Err(DevnetError::Unsupported {
                operation: "export",
                backend: "a devnet without a live container".to_owned(),
            });
        };
        self.engine
            .resolve(&container_id)
            .await
            .map_err(|source| {
                if source.is_not_found() {
                    DevnetError::ContainerNotFound {
                        chain_id: chain_id.clone(),
                        container_id,
                    }
                } else {
                    DevnetError::engine(chain_id, "resolve", source)
                }
            })
    }

    async fn spawn_node(&mut self) -> Result<(), DevnetError> {
        self.phase = DevnetPhase::Spawning;
        self.container.set(None);
        let chain_id = self.settings.chain_id.clone();

        let port = allocate_port(self.probe.as_ref(), self.port)
            .map_err(|source| DevnetError::PortAllocation { source })?;
        self.port = Some(port);
        info!(
            chain_id = %chain_id,
            port,
            image = %self.settings.image,
            engine = %self.engine.label(),
            "spawning devnet node"
        );

        self.state.ensure_root()?;
        self.save_record(port)?;

        let spec = self.node_container_spec(port)?;
        let container = self
            .engine
            .create_and_run(spec)
            .await
            .map_err(|source| DevnetError::engine(&chain_id, "create_and_run", source))?;
        self.container.set(Some(Arc::clone(&container)));
        // Persist before waiting so an interrupted launch is still recoverable.
        self.save_record(port)?;
        info!(chain_id = %chain_id, container_id = container.id(), port, "devnet container started");

        let logs = container
            .logs()
            .await
            .map_err(|source| DevnetError::engine(&chain_id, "logs", source))?;
        self.detector
            .await_ready(logs, self.probe.as_ref(), &self.settings.host, port)
            .await
            .map_err(|source| {
                warn!(
                    chain_id = %chain_id,
                    container_id = container.id(),
                    "devnet did not become ready, leaving its container running"
                );
                DevnetError::from_readiness(&chain_id, source)
            })?;

        self.phase = DevnetPhase::Running;
        info!(chain_id = %chain_id, port, container_id = container.id(), "devnet is ready");
        Ok(())
    }

    /// Validates persisted state against the engine. Every failure except
    /// fatal state I/O turns into a request for a fresh node.
    async fn recover(&mut self) -> Result<Recovery, DevnetError> {
        let chain_id = self.settings.chain_id.clone();
        let record = match self.state.load() {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(Recovery::Respawn),
            Err(StateError::Corrupt { path, message }) => {
                warn!(
                    chain_id = %chain_id,
                    path = %path.display(),
                    %message,
                    "devnet state is corrupt, discarding it"
                );
                self.erase().await?;
                return Ok(Recovery::Respawn);
            }
            Err(error) => return Err(error.into()),
        };

        if record.chain_id != chain_id {
            warn!(
                chain_id = %chain_id,
                recorded_chain_id = %record.chain_id,
                "devnet state belongs to a different chain id"
            );
        }
        match record.port.as_u16() {
            Some(port) => self.port = Some(port),
            None => warn!(chain_id = %chain_id, port = %record.port, "ignoring unusable recorded port"),
        }

        let Some(container_id) = record.container_id else {
            warn!(chain_id = %chain_id, "devnet state has no container id, spawning a new node");
            return Ok(Recovery::Respawn);
        };

        let container = match self.engine.resolve(&container_id).await {
            Ok(container) => container,
            Err(error) if error.is_not_found() => {
                let error = DevnetError::ContainerNotFound {
                    chain_id: chain_id.clone(),
                    container_id: container_id.clone(),
                };
                warn!(%error, "discarding outdated devnet state");
                self.erase().await?;
                return Ok(Recovery::Respawn);
            }
            Err(error) => {
                warn!(
                    chain_id = %chain_id,
                    container_id = %container_id,
                    %error,
                    "failed to resolve devnet container, spawning a new node"
                );
                return Ok(Recovery::Respawn);
            }
        };

        let running = match container.is_running().await {
            Ok(running) => running,
            Err(error) => {
                warn!(
                    chain_id = %chain_id,
                    container_id = %container_id,
                    %error,
                    "failed to inspect devnet container, discarding outdated state"
                );
                self.erase().await?;
                return Ok(Recovery::Respawn);
            }
        };

        if running {
            info!(chain_id = %chain_id, container_id = %container_id, port = self.port, "reusing running devnet");
        } else {
            info!(chain_id = %chain_id, container_id = %container_id, "restarting stopped devnet container");
            if let Err(error) = container.start().await {
                warn!(
                    chain_id = %chain_id,
                    container_id = %container_id,
                    %error,
                    "failed to restart devnet container, spawning a new node"
                );
                return Ok(Recovery::Respawn);
            }
        }

        self.container.set(Some(container));
        Ok(Recovery::Resumed)
    }

    /// Registers the exit hook at most once per instance. The hook resolves
    /// the live container when it runs, not when it is registered.
    fn register_exit_hook(&mut self) {
        if self.exit_hook_registered {
            return;
        }
        let Some(hooks) = &self.hooks else {
            return;
        };
        let chain_id = self.settings.chain_id.clone();
        let ephemeral = self.settings.ephemeral;
        let live = self.container.clone();
        hooks.register(format!("devnet {chain_id}"), move || async move {
            let Some(container) = live.get() else {
                debug!(chain_id = %chain_id, "no devnet container to stop at exit");
                return;
            };
            if !ephemeral {
                info!(
                    chain_id = %chain_id,
                    container_id = container.id(),
                    "devnet keeps running"
                );
                return;
            }
            match container.kill().await {
                Ok(()) => info!(
                    chain_id = %chain_id,
                    container_id = container.id(),
                    "stopped ephemeral devnet"
                ),
                Err(error) => warn!(
                    chain_id = %chain_id,
                    container_id = container.id(),
                    %error,
                    "failed to stop ephemeral devnet"
                ),
            }
        });
        self.exit_hook_registered = true;
    }

    fn save_record(&self, port: u16) -> Result<(), DevnetError> {
        let mut record =
            DevnetRecord::new(&self.settings.chain_id, port).with_host(&self.settings.host);
        if let Some(container) = self.container.get() {
            record = record.with_container_id(container.id());
        }
        self.state.save(&record)?;
        debug!(path = %self.state.record_path().display(), "saved devnet record");
        Ok(())
    }

    fn node_container_spec(&self, port: u16) -> Result<ContainerSpec, DevnetError> {
        let mut spec = ContainerSpec::new(
            self.settings.container_name(Some(port)),
            self.settings.image.clone(),
        );
        spec.env = self.settings.node_environment(port);
        spec.labels = self.labels(NODE_ROLE);
        spec.published_ports = vec![port];
        spec.hostname = Some(self.settings.chain_id.clone());
        spec.tty = true;

        if let Some(script) = &self.settings.init_script {
            let file_name = script
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| DevnetError::State {
                    action: "mount",
                    path: script.clone(),
                    source: io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "init script path has no file name",
                    ),
                })?;
            let mount_point = format!("/{file_name}");
            spec.mounts
                .push(BindMount::read_only(absolute(script)?, mount_point.clone()));
            spec.command = vec![mount_point];
        }

        if self.settings.mount_state {
            spec.mounts.push(BindMount::read_write(
                absolute(self.state.root())?,
                format!("/state/{}", self.settings.chain_id),
            ));
        }
        Ok(spec)
    }

    fn labels(&self, role: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (CHAIN_LABEL.to_owned(), self.settings.chain_id.clone()),
            (ROLE_LABEL.to_owned(), role.to_owned()),
        ])
    }

    /// Deletes state owned by the node's user from inside a privileged
    /// throwaway container, then removes the emptied mount point.
    async fn erase_with_cleanup_container(&self, path: &Path) -> Result<(), DevnetError> {
        let cleanup_failed = |message: String| DevnetError::CleanupFailed {
            path: path.to_path_buf(),
            message,
        };
        let host_path = std::path::absolute(path).map_err(|error| cleanup_failed(error.to_string()))?;

        let mut spec = ContainerSpec::new(
            format!("{}-cleanup", self.settings.container_name(self.port)),
            self.settings.image.clone(),
        );
        spec.entrypoint = Some(vec!["find".to_owned()]);
        spec.command = [CLEANUP_MOUNT_POINT, "-mindepth", "1", "-delete"]
            .map(str::to_owned)
            .to_vec();
        spec.mounts = vec![BindMount::read_write(host_path, CLEANUP_MOUNT_POINT)];
        spec.labels = self.labels(CLEANUP_ROLE);
        spec.privileged = true;
        spec.auto_remove = true;

        info!(
            chain_id = %self.settings.chain_id,
            path = %path.display(),
            container = %spec.name,
            "starting cleanup container"
        );
        let container = self
            .engine
            .create_and_run(spec)
            .await
            .map_err(|error| cleanup_failed(error.to_string()))?;

        info!(container_id = container.id(), "waiting for cleanup container to exit");
        let exit_code = container
            .wait_exit()
            .await
            .map_err(|error| cleanup_failed(error.to_string()))?;
        if exit_code != 0 {
            return Err(cleanup_failed(format!(
                "cleanup container exited with status {exit_code}"
            )));
        }

        if path.exists() {
            fs::remove_dir(path).map_err(|error| cleanup_failed(error.to_string()))?;
        }
        info!(path = %path.display(), "cleanup container erased devnet state");
        Ok(())
    }
}

/// Whether a failed deletion is the kind a privileged container can fix.
fn needs_cleanup_container(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::DirectoryNotEmpty
    )
}

fn absolute(path: &Path) -> Result<PathBuf, DevnetError> {
    std::path::absolute(path).map_err(|source| DevnetError::State {
        action: "resolve",
        path: path.to_path_buf(),
        source,
    })
}

#[async_trait]
impl Devnet for ContainerDevnet {
    fn chain_id(&self) -> &str {
        &self.settings.chain_id
    }

    fn phase(&self) -> DevnetPhase {
        self.phase
    }

    fn url(&self) -> Option<Url> {
        let port = self.port?;
        Url::parse(&format!("http://{}:{port}", self.settings.host)).ok()
    }

    async fn spawn(&mut self) -> Result<(), DevnetError> {
        self.spawn_node().await
    }

    async fn respawn(&mut self) -> Result<(), DevnetError> {
        if self.state.record_exists() {
            self.phase = DevnetPhase::Recovering;
            if let Recovery::Respawn = self.recover().await? {
                self.spawn_node().await?;
            }
        } else {
            info!(
                chain_id = %self.settings.chain_id,
                path = %self.state.record_path().display(),
                "no devnet state found, spawning a new node"
            );
            self.spawn_node().await?;
        }
        self.register_exit_hook();
        self.phase = DevnetPhase::Running;
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), DevnetError> {
        let chain_id = self.settings.chain_id.clone();
        if let Some(container) = self.container.get() {
            match container.kill().await {
                Ok(()) => info!(chain_id = %chain_id, container_id = container.id(), "stopped devnet container"),
                Err(error) if error.is_not_found() => {
                    info!(chain_id = %chain_id, container_id = container.id(), "devnet container is already gone");
                }
                Err(source) => return Err(DevnetError::engine(chain_id, "kill", source)),
            }
            self.phase = DevnetPhase::Stopped;
            return Ok(());
        }

        let container_id = match self.state.load() {
            Ok(Some(DevnetRecord {
                container_id: Some(container_id),
                ..
            })) => container_id,
            Ok(_) => {
                info!(chain_id = %chain_id, "no devnet container recorded, didn't stop any container");
                return Ok(());
            }
            Err(error) => {
                info!(chain_id = %chain_id, %error, "devnet state unreadable, didn't stop any container");
                return Ok(());
            }
        };

        let container = match self.engine.resolve(&container_id).await {
            Ok(container) => container,
            Err(error) => {
                info!(chain_id = %chain_id, container_id = %container_id, %error, "didn't stop any container");
                return Ok(());
            }
        };
        match container.kill().await {
            Ok(()) => {
                info!(chain_id = %chain_id, container_id = %container_id, "stopped devnet container");
                self.container.set(Some(container));
                self.phase = DevnetPhase::Stopped;
            }
            Err(error) => {
                info!(chain_id = %chain_id, container_id = %container_id, %error, "didn't stop any container");
            }
        }
        Ok(())
    }

    async fn erase(&mut self) -> Result<(), DevnetError> {
        let path = self.state.root().to_path_buf();
        if path.exists() {
            info!(chain_id = %self.settings.chain_id, path = %path.display(), "deleting devnet state");
            match self.state.remove_all() {
                Ok(()) => {}
                Err(error) if needs_cleanup_container(&error) => {
                    warn!(
                        path = %path.display(),
                        %error,
                        "failed to delete devnet state directly, falling back to a cleanup container"
                    );
                    self.erase_with_cleanup_container(&path).await?;
                }
                Err(source) => return Err(DevnetError::EraseFailed { path, source }),
            }
        }
        self.phase = DevnetPhase::Erased;
        Ok(())
    }

    async fn genesis_account(&self, name: &str) -> Result<GenesisAccount, DevnetError> {
        genesis::ensure_known_identity(&self.settings.identities, name)?;
        if self.settings.mount_state {
            return genesis::read_account_file(&self.state.wallet_dir(), name);
        }

        let container = match self.container.get() {
            Some(container) => container,
            None => {
                let container_id = self
                    .state
                    .load()
                    .map_err(|error| DevnetError::missing_identity(name, error))?
                    .and_then(|record| record.container_id)
                    .ok_or_else(|| DevnetError::missing_identity(name, "no devnet container is recorded"))?;
                self.engine
                    .resolve(&container_id)
                    .await
                    .map_err(|error| DevnetError::missing_identity(name, error))?
            }
        };
        let path = genesis::container_account_path(&self.settings.chain_id, name);
        debug!(container_id = container.id(), %path, "reading genesis account inside devnet container");
        let output = container
            .exec(&["cat".to_owned(), path])
            .await
            .map_err(|error| DevnetError::missing_identity(name, error))?;
        genesis::parse_account(name, &output)
    }
}

impl fmt::Debug for ContainerDevnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerDevnet")
            .field("chain_id", &self.settings.chain_id)
            .field("state_root", &self.state.root())
            .field("engine", &self.engine.label())
            .field("container_id", &self.container_id())
            .field("port", &self.port)
            .field("phase", &self.phase)
            .finish()
    }
}
