mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kraken_agent_core::auth::AuthTokenManager;
use kraken_agent_core::control_plane::ControlPlaneClient;
use kraken_agent_core::{AgentRuntime, RuntimePaths};
use kraken_agent_domain::config;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
const PLATFORM_TAG: &str = "linux-x64";
#[cfg(windows)]
const PLATFORM_TAG: &str = "windows-x64";

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = cli::Cli::parse();
    match cli.command.unwrap_or(cli::Command::Run { environment: None }) {
        cli::Command::Version => {
            println!("kraken-agent {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        cli::Command::Run { environment } => run(environment).await,
    }
}

async fn run(environment: Option<String>) -> anyhow::Result<()> {
    let working_dir = std::env::current_dir().context("failed to resolve working directory")?;
    let settings_path = working_dir.join("agentsettings.json");
    let settings = config::load_settings(&settings_path, environment.as_deref())
        .with_context(|| format!("failed to load {}", settings_path.display()))?;

    let identity = settings.identity();
    let endpoints = settings.endpoints();

    tracing::info!(agent_id = %identity.agent_id, workspace_id = %identity.workspace_id, "starting kraken-agent");

    let root_path = working_dir.clone();
    let auth = Arc::new(AuthTokenManager::new(&identity, endpoints.clone(), root_path, PLATFORM_TAG));
    let control_plane = Arc::new(ControlPlaneClient::new(identity.clone(), endpoints, auth));

    let paths = RuntimePaths {
        base_install_root: PathBuf::from(kraken_agent_core::script_runner::BASE_INSTALL_ROOT),
        artifacts_root: PathBuf::from(kraken_agent_core::deploy::ARTIFACTS_ROOT),
        installations_root: PathBuf::from(kraken_agent_core::script_runner::BASE_INSTALL_ROOT),
        update_work_dir: std::env::temp_dir().join("kraken-agent-update"),
        working_dir,
    };

    let runtime = AgentRuntime::new(identity, control_plane, paths).context("failed to initialize runtime")?;

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("ctrl-c received, shutting down");
        shutdown_clone.cancel();
    });

    runtime.run(shutdown).await;
    tracing::info!("kraken-agent exited cleanly");
    Ok(())
}
