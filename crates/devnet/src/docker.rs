use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bollard::{
    API_DEFAULT_VERSION, Docker,
    container::LogOutput,
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecResults},
    models::{ContainerConfig, ContainerCreateBody, HostConfig, PortBinding},
    query_parameters::{
        CommitContainerOptionsBuilder, CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
        InspectContainerOptions, KillContainerOptions, LogsOptionsBuilder,
        RemoveContainerOptionsBuilder, StartContainerOptions, WaitContainerOptions,
    },
};
use futures_util::{StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::engine::{ContainerEngine, ContainerHandle, ContainerSpec, EngineError, LogStream};

const DEFAULT_DOCKER_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    Local,
    UnixSocket(String),
}

impl DockerEndpoint {
    pub fn label(&self) -> String {
        match self {
            Self::Local => "local-docker-daemon".to_owned(),
            Self::UnixSocket(path) => format!("unix://{path}"),
        }
    }
}

/// [`ContainerEngine`] backed by a Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
    endpoint: DockerEndpoint,
}

impl DockerEngine {
    pub fn connect(endpoint: DockerEndpoint) -> Result<Self, EngineError> {
        let docker = match &endpoint {
            DockerEndpoint::Local => Docker::connect_with_local_defaults(),
            DockerEndpoint::UnixSocket(path) => {
                Docker::connect_with_socket(path, DEFAULT_DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
        }
        .map_err(|source| EngineError::Connect {
            endpoint: endpoint.label(),
            message: source.to_string(),
        })?;
        Ok(Self { docker, endpoint })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(error) if is_not_found_error(&error) => {}
            Err(error) => return Err(EngineError::operation("inspect_image", image, error)),
        }

        info!(image, endpoint = %self.endpoint.label(), "pulling devnet image");
        self.docker
            .create_image(
                Some(CreateImageOptionsBuilder::new().from_image(image).build()),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|source| EngineError::operation("create_image", image, source))?;
        Ok(())
    }

    async fn remove_container_if_exists(&self, container_name: &str) -> Result<(), EngineError> {
        match self
            .docker
            .remove_container(
                container_name,
                Some(
                    RemoveContainerOptionsBuilder::new()
                        .force(true)
                        .v(true)
                        .link(false)
                        .build(),
                ),
            )
            .await
        {
            Ok(_) => {
                debug!(container = container_name, "removed leftover container");
                Ok(())
            }
            Err(error) if is_not_found_error(&error) => Ok(()),
            Err(error) => Err(EngineError::operation(
                "remove_container",
                container_name,
                error,
            )),
        }
    }

    fn handle(&self, id: String) -> Arc<dyn ContainerHandle> {
        Arc::new(DockerContainer {
            docker: self.docker.clone(),
            id,
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn label(&self) -> String {
        self.endpoint.label()
    }

    async fn create_and_run(
        &self,
        spec: ContainerSpec,
    ) -> Result<Arc<dyn ContainerHandle>, EngineError> {
        self.ensure_image(&spec.image).await?;
        self.remove_container_if_exists(&spec.name).await?;

        let name = spec.name.clone();
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&name).build()),
                container_create_body(spec),
            )
            .await
            .map_err(|source| EngineError::operation("create_container", &name, source))?;

        self.docker
            .start_container(&response.id, None::<StartContainerOptions>)
            .await
            .map_err(|source| EngineError::operation("start_container", &name, source))?;

        info!(container = %name, container_id = %response.id, "container started");
        Ok(self.handle(response.id))
    }

    async fn resolve(&self, container_id: &str) -> Result<Arc<dyn ContainerHandle>, EngineError> {
        let inspected = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
            .map_err(|source| container_error("inspect_container", container_id, source))?;
        let id = inspected.id.unwrap_or_else(|| container_id.to_owned());
        Ok(self.handle(id))
    }
}

fn container_create_body(spec: ContainerSpec) -> ContainerCreateBody {
    let exposed_ports = spec
        .published_ports
        .iter()
        .map(|port| (format!("{port}/tcp"), HashMap::new()))
        .collect::<HashMap<_, _>>();
    let port_bindings = spec
        .published_ports
        .iter()
        .map(|port| {
            (
                format!("{port}/tcp"),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(port.to_string()),
                }]),
            )
        })
        .collect::<HashMap<_, _>>();
    let binds = spec.mounts.iter().map(|mount| mount.to_bind()).collect();
    let env = spec
        .env
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    ContainerCreateBody {
        image: Some(spec.image),
        env: Some(env),
        labels: Some(spec.labels.into_iter().collect()),
        entrypoint: spec.entrypoint,
        cmd: (!spec.command.is_empty()).then_some(spec.command),
        hostname: spec.hostname.clone(),
        domainname: spec.hostname,
        tty: Some(spec.tty),
        attach_stdin: Some(spec.tty),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            network_mode: Some("bridge".to_owned()),
            binds: Some(binds),
            port_bindings: Some(port_bindings),
            privileged: Some(spec.privileged),
            auto_remove: Some(spec.auto_remove),
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

#[derive(Debug, Clone)]
struct DockerContainer {
    docker: Docker,
    id: String,
}

#[async_trait]
impl ContainerHandle for DockerContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_running(&self) -> Result<bool, EngineError> {
        let inspected = self
            .docker
            .inspect_container(&self.id, None::<InspectContainerOptions>)
            .await
            .map_err(|source| container_error("inspect_container", &self.id, source))?;
        Ok(inspected
            .state
            .and_then(|state| state.running)
            .unwrap_or(false))
    }

    async fn start(&self) -> Result<(), EngineError> {
        self.docker
            .start_container(&self.id, None::<StartContainerOptions>)
            .await
            .map_err(|source| container_error("start_container", &self.id, source))
    }

    async fn kill(&self) -> Result<(), EngineError> {
        match self
            .docker
            .kill_container(&self.id, None::<KillContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            // 409: the container exists but is not running.
            Err(BollardError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(error) => Err(container_error("kill_container", &self.id, error)),
        }
    }

    async fn logs(&self) -> Result<LogStream, EngineError> {
        let id = self.id.clone();
        let stream = self
            .docker
            .logs(
                &self.id,
                Some(
                    LogsOptionsBuilder::new()
                        .follow(true)
                        .stdout(true)
                        .stderr(true)
                        .build(),
                ),
            )
            .map(move |chunk| match chunk {
                Ok(
                    LogOutput::StdOut { message }
                    | LogOutput::StdErr { message }
                    | LogOutput::Console { message },
                ) => Ok(String::from_utf8_lossy(&message).into_owned()),
                Ok(LogOutput::StdIn { .. }) => Ok(String::new()),
                Err(error) => Err(container_error("logs", &id, error)),
            });
        Ok(stream.boxed())
    }

    async fn wait_exit(&self) -> Result<i64, EngineError> {
        let mut responses = self
            .docker
            .wait_container(&self.id, None::<WaitContainerOptions>);
        let mut status_code = 0;
        while let Some(response) = responses.next().await {
            match response {
                Ok(response) => status_code = response.status_code,
                Err(BollardError::DockerContainerWaitError { code, .. }) => return Ok(code),
                // Auto-removed containers may vanish before the wait resolves.
                Err(error) if is_not_found_error(&error) => return Ok(status_code),
                Err(error) => return Err(container_error("wait_container", &self.id, error)),
            }
        }
        Ok(status_code)
    }

    async fn exec(&self, command: &[String]) -> Result<String, EngineError> {
        let exec = self
            .docker
            .create_exec(
                &self.id,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|source| container_error("create_exec", &self.id, source))?;

        let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|source| container_error("start_exec", &self.id, source))?
        else {
            return Err(EngineError::operation(
                "start_exec",
                &self.id,
                "exec started detached",
            ));
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = output.next().await {
            match chunk.map_err(|source| container_error("exec_output", &self.id, source))? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdErr { message } => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                LogOutput::StdIn { .. } => {}
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|source| container_error("inspect_exec", &self.id, source))?;
        match inspected.exit_code {
            Some(0) | None => Ok(stdout),
            Some(code) => Err(EngineError::operation(
                "exec",
                &self.id,
                format!("`{}` exited with {code}: {}", command.join(" "), stderr.trim()),
            )),
        }
    }

    async fn commit(&self, repository: &str, tag: &str) -> Result<String, EngineError> {
        let response = self
            .docker
            .commit_container(
                CommitContainerOptionsBuilder::new()
                    .container(&self.id)
                    .repo(repository)
                    .tag(tag)
                    .build(),
                ContainerConfig::default(),
            )
            .await
            .map_err(|source| container_error("commit_container", &self.id, source))?;
        Ok(response.id)
    }
}

fn is_not_found_error(error: &BollardError) -> bool {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => *status_code == 404,
        _ => false,
    }
}

fn container_error(operation: &'static str, container: &str, source: BollardError) -> EngineError {
    if is_not_found_error(&source) {
        EngineError::NotFound {
            container: container.to_owned(),
        }
    } else {
        EngineError::operation(operation, container, source)
    }
}
