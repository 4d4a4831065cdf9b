use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use devnet::{
    ContainerDevnet, Devnet, DevnetError, DevnetSettings, DockerEndpoint, DockerEngine,
    OsPortProbe, ShutdownHooks, StateStore,
    bootstrap::{self, BootstrapError, CliOverrides},
    build_devnet,
};
use thiserror::Error;
use types::{DevnetBackend, DevnetConfig, DevnetPlatform, init_tracing};

#[derive(Debug, Clone, Subcommand, PartialEq, Eq)]
enum CliCommand {
    /// Create a fresh devnet node
    Spawn,
    /// Reuse the devnet recorded in the state directory, or create one
    Respawn,
    /// Stop the devnet node
    Kill,
    /// Delete the devnet state directory
    Erase,
    /// Stop the node and delete its state
    Terminate,
    /// Print the persisted devnet record
    Status,
    /// Print the credentials of a genesis account
    Account { name: String },
    /// Snapshot the running devnet container into an image
    Export {
        #[arg(long)]
        repository: Option<String>,
        #[arg(long)]
        tag: Option<String>,
    },
}

#[derive(Debug, Clone, Parser, PartialEq, Eq)]
#[command(name = "devnet", about = "Local devnet lifecycle manager")]
struct CliArgs {
    #[arg(short = 'c', long = "config", global = true)]
    config_path: Option<PathBuf>,
    #[arg(long = "chain-id", global = true)]
    chain_id: Option<String>,
    #[arg(long = "state-root", global = true)]
    state_root: Option<PathBuf>,
    #[arg(long, global = true)]
    port: Option<u16>,
    #[arg(long, global = true, value_parser = parse_platform)]
    platform: Option<DevnetPlatform>,
    #[arg(long, global = true)]
    ephemeral: bool,
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: CliCommand,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            chain_id: self.chain_id.clone(),
            state_root: self.state_root.clone(),
            port: self.port,
            platform: self.platform,
            ephemeral: self.ephemeral.then_some(true),
            verbose: self.verbose.then_some(true),
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Devnet(#[from] DevnetError),
    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("failed to render output: {0}")]
    Render(#[from] serde_json::Error),
}

fn parse_platform(value: &str) -> Result<DevnetPlatform, String> {
    DevnetPlatform::parse(value).ok_or_else(|| {
        let known: Vec<String> = DevnetPlatform::ALL.iter().map(ToString::to_string).collect();
        format!("unknown platform `{value}`, expected one of: {}", known.join(", "))
    })
}

fn main() -> ExitCode {
    if let Err(error) = run() {
        eprintln!("devnet error: {error}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn run() -> Result<(), CliError> {
    let args = CliArgs::parse();
    let config = bootstrap::load_devnet_config(args.config_path.as_deref(), args.overrides())?;
    init_tracing(config.verbose);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;
    runtime.block_on(async {
        let hooks = ShutdownHooks::new();
        let result = execute(args.command, &config, hooks.clone()).await;
        hooks.run().await;
        result
    })
}

async fn execute(
    command: CliCommand,
    config: &DevnetConfig,
    hooks: ShutdownHooks,
) -> Result<(), CliError> {
    match command {
        CliCommand::Status => {
            let state = StateStore::new(config.resolved_state_root());
            match state.load().map_err(DevnetError::from)? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("no devnet at {}", state.root().display()),
            }
            Ok(())
        }
        CliCommand::Export { repository, tag } => {
            let mut devnet = container_devnet(config, hooks)?;
            devnet.respawn().await?;
            let image = devnet
                .export(repository.as_deref(), tag.as_deref())
                .await?;
            println!("{image}");
            Ok(())
        }
        command => {
            let mut devnet = build_devnet(config, hooks)?;
            match command {
                CliCommand::Spawn => devnet.spawn().await?,
                CliCommand::Respawn => devnet.respawn().await?,
                CliCommand::Kill => devnet.kill().await?,
                CliCommand::Erase => devnet.erase().await?,
                CliCommand::Terminate => devnet.terminate().await?,
                CliCommand::Account { name } => {
                    let account = devnet.genesis_account(&name).await?;
                    println!("{}", serde_json::to_string_pretty(&account)?);
                    return Ok(());
                }
                CliCommand::Status | CliCommand::Export { .. } => {}
            }
            match devnet.url() {
                Some(url) => println!("{} {} at {url}", devnet.chain_id(), devnet.phase()),
                None => println!("{} {}", devnet.chain_id(), devnet.phase()),
            }
            Ok(())
        }
    }
}

fn container_devnet(config: &DevnetConfig, hooks: ShutdownHooks) -> Result<ContainerDevnet, CliError> {
    if config.backend != DevnetBackend::Container {
        return Err(DevnetError::Unsupported {
            operation: "export",
            backend: "the managed devnet".to_owned(),
        }
        .into());
    }
    let settings = DevnetSettings::from_config(config).map_err(DevnetError::from)?;
    let engine = DockerEngine::connect(DockerEndpoint::Local)
        .map_err(|source| DevnetError::Engine {
            chain_id: settings.chain_id.clone(),
            operation: "connect",
            source,
        })?;
    Ok(ContainerDevnet::new(settings, Arc::new(engine), Arc::new(OsPortProbe)).with_shutdown_hooks(hooks))
}
