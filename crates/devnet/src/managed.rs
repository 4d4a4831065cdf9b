use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, info, warn};
use types::{DevnetConfig, DevnetRecord};
use url::Url;

use crate::{
    Devnet, DevnetPhase,
    error::DevnetError,
    genesis::{self, GenesisAccount},
    port::{PortProbe, allocate_port},
    readiness::ReadinessError,
    state::{StateError, StateStore},
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ReadyResponse {
    #[serde(default)]
    ready: bool,
}

/// A devnet whose node is owned by a remote manager reached over HTTP. The
/// manager decides the node's lifetime; this side only asks for it and keeps
/// the local record.
///
/// Not safe for concurrent callers against one state directory.
#[derive(Debug)]
pub struct ManagedDevnet {
    chain_id: String,
    identities: Vec<String>,
    host: String,
    manager: Url,
    client: reqwest::Client,
    state: StateStore,
    probe: Arc<dyn PortProbe>,
    port: Option<u16>,
    launch_timeout: Duration,
    poll_interval: Duration,
    phase: DevnetPhase,
}

impl ManagedDevnet {
    pub fn from_config(
        config: &DevnetConfig,
        probe: Arc<dyn PortProbe>,
    ) -> Result<Self, DevnetError> {
        config.validate()?;
        let raw_url = config.manager_url.as_deref().unwrap_or_default().trim();
        let manager = Url::parse(raw_url).map_err(|error| DevnetError::Manager {
            operation: "parse_url",
            endpoint: raw_url.to_owned(),
            message: error.to_string(),
        })?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| DevnetError::Manager {
                operation: "build_client",
                endpoint: manager.to_string(),
                message: error.to_string(),
            })?;

        Ok(Self {
            chain_id: config.chain_id.trim().to_owned(),
            identities: config.identities.clone(),
            host: config.host.trim().to_owned(),
            manager,
            client,
            state: StateStore::new(config.resolved_state_root()),
            probe,
            port: config.port.filter(|port| *port != 0),
            launch_timeout: Duration::from_secs(config.launch_timeout_secs),
            poll_interval: Duration::from_millis(config.ready_poll_interval_ms),
            phase: DevnetPhase::Unspawned,
        })
    }

    pub fn manager_url(&self) -> &Url {
        &self.manager
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.manager.clone();
        let base = url.path().trim_end_matches('/').to_owned();
        url.set_path(&format!("{base}/{path}"));
        url
    }

    async fn request(
        &self,
        operation: &'static str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, DevnetError> {
        let url = self.endpoint(path);
        debug!(%url, operation, "calling devnet manager");
        self.client
            .get(url.clone())
            .query(query)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|error| DevnetError::Manager {
                operation,
                endpoint: url.to_string(),
                message: error.to_string(),
            })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, DevnetError> {
        let response = self.request(operation, path, query).await?;
        let endpoint = response.url().to_string();
        response
            .json::<T>()
            .await
            .map_err(|error| DevnetError::Manager {
                operation,
                endpoint,
                message: error.to_string(),
            })
    }

    async fn wait_until_ready(&self) -> Result<(), DevnetError> {
        let poll = async {
            loop {
                let status: ReadyResponse = self.get_json("ready", "ready", &[]).await?;
                if status.ready {
                    return Ok::<(), DevnetError>(());
                }
                info!(chain_id = %self.chain_id, "waiting for managed devnet to become ready");
                tokio::time::sleep(self.poll_interval).await;
            }
        };
        tokio::time::timeout(self.launch_timeout, poll)
            .await
            .map_err(|_| DevnetError::ReadinessTimeout {
                chain_id: self.chain_id.clone(),
                source: ReadinessError::PhraseTimeout {
                    phrase: "ready".to_owned(),
                    timeout_secs: self.launch_timeout.as_secs(),
                },
            })?
    }
}

#[async_trait]
impl Devnet for ManagedDevnet {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    fn phase(&self) -> DevnetPhase {
        self.phase
    }

    fn url(&self) -> Option<Url> {
        let port = self.port?;
        Url::parse(&format!("http://{}:{port}", self.host)).ok()
    }

    async fn spawn(&mut self) -> Result<(), DevnetError> {
        self.phase = DevnetPhase::Spawning;
        let port = allocate_port(self.probe.as_ref(), self.port)
            .map_err(|source| DevnetError::PortAllocation { source })?;
        self.port = Some(port);
        info!(chain_id = %self.chain_id, port, manager = %self.manager, "asking manager to spawn devnet");

        let query = [
            ("id", self.chain_id.clone()),
            ("genesis", self.identities.join(",")),
            ("port", port.to_string()),
        ];
        self.request("spawn", "spawn", &query).await?;
        self.wait_until_ready().await?;

        let record = DevnetRecord::new(&self.chain_id, port).with_host(&self.host);
        self.state.save(&record)?;
        self.phase = DevnetPhase::Running;
        info!(chain_id = %self.chain_id, port, "managed devnet is ready");
        Ok(())
    }

    async fn respawn(&mut self) -> Result<(), DevnetError> {
        self.phase = DevnetPhase::Recovering;
        let record = match self.state.load() {
            Ok(Some(record)) => record,
            Ok(None) => {
                info!(chain_id = %self.chain_id, "no managed devnet state found, spawning");
                return self.spawn().await;
            }
            Err(StateError::Corrupt { path, message }) => {
                warn!(path = %path.display(), %message, "managed devnet state is corrupt, discarding it");
                self.erase().await?;
                return self.spawn().await;
            }
            Err(error) => return Err(error.into()),
        };

        if record.chain_id != self.chain_id {
            warn!(
                chain_id = %self.chain_id,
                recorded_chain_id = %record.chain_id,
                "managed devnet state belongs to a different chain id"
            );
        }
        if let Some(port) = record.port.as_u16() {
            self.port = Some(port);
        }
        if let Some(host) = record.host {
            self.host = host;
        }
        info!(chain_id = %self.chain_id, port = self.port, "reusing managed devnet");
        self.phase = DevnetPhase::Running;
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), DevnetError> {
        info!(
            chain_id = %self.chain_id,
            manager = %self.manager,
            "managed devnet lifetime belongs to its manager, nothing to stop"
        );
        Ok(())
    }

    async fn erase(&mut self) -> Result<(), DevnetError> {
        let path = self.state.root().to_path_buf();
        info!(chain_id = %self.chain_id, path = %path.display(), "deleting managed devnet state");
        self.state
            .remove_all()
            .map_err(|source| DevnetError::EraseFailed { path, source })?;
        self.phase = DevnetPhase::Erased;
        Ok(())
    }

    async fn genesis_account(&self, name: &str) -> Result<GenesisAccount, DevnetError> {
        genesis::ensure_known_identity(&self.identities, name)?;
        let value: Value = self
            .get_json("identity", "identity", &[("name", name.to_owned())])
            .await
            .map_err(|error| DevnetError::missing_identity(name, error))?;
        if let Some(error) = value.get("error") {
            let reason = error
                .as_str()
                .map(str::to_owned)
                .unwrap_or_else(|| error.to_string());
            return Err(DevnetError::missing_identity(name, reason));
        }
        genesis::account_from_value(name, value)
    }
}
