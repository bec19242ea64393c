//! AgentFleet Agent Daemon
//!
//! Runs on every node. Clones workspaces on request, launches one worker per
//! started agent session, and reports back to the control plane.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use agentfleet_core::NodeId;

mod agent;
mod callback;
mod config;
mod launcher;
mod server;
mod sessions;
mod workspace;

use agent::Agent;
use callback::ControlPlaneClient;
use config::Config;
use launcher::ProcessLauncher;
use workspace::GitFetcher;

/// AgentFleet node agent
#[derive(Parser, Debug)]
#[command(name = "agentfleet-agent")]
#[command(about = "Hosts workspaces and coding-agent sessions on a node", long_about = None)]
struct Cli {
    /// HTTP bind address
    #[arg(long, env = "AGENTFLEET_AGENT_BIND_ADDR", default_value = "0.0.0.0:7070")]
    bind_addr: String,

    /// Control plane base URL
    #[arg(long, env = "AGENTFLEET_CONTROL_PLANE_URL", default_value = "http://127.0.0.1:8080")]
    control_plane_url: String,

    /// Directory for workspace checkouts
    #[arg(
        long,
        env = "AGENTFLEET_WORKSPACES_ROOT",
        default_value = "/var/lib/agentfleet/workspaces"
    )]
    workspaces_root: PathBuf,

    /// Git executable
    #[arg(long, env = "AGENTFLEET_GIT", default_value = "git")]
    git: String,

    /// Worker executable; receives the instruction as its last argument
    #[arg(long, env = "AGENTFLEET_AGENT_COMMAND", default_value = "claude")]
    agent_command: String,

    /// Worker arguments placed before the instruction
    #[arg(
        long = "agent-arg",
        env = "AGENTFLEET_AGENT_ARGS",
        value_delimiter = ',',
        default_value = "--print"
    )]
    agent_args: Vec<String>,

    /// Node id reported by the health endpoint
    #[arg(long, env = "AGENTFLEET_NODE_ID")]
    node_id: Option<String>,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            bind_addr: self.bind_addr,
            control_plane_url: self.control_plane_url,
            workspaces_root: self.workspaces_root,
            git_binary: self.git,
            agent_command: self.agent_command,
            agent_args: self.agent_args,
            node_id: self.node_id.map(NodeId::new),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config = Arc::new(Cli::parse().into_config());
    let addr: SocketAddr = config.bind_addr.parse()?;
    tokio::fs::create_dir_all(&config.workspaces_root).await?;

    let callbacks = Arc::new(ControlPlaneClient::new(
        &config.control_plane_url,
        config.http_client_timeout,
        config.callback_attempts,
        config.callback_retry_delay,
    )?);
    let fetcher = Arc::new(GitFetcher::new(config.git_binary.clone()));
    let launcher = Arc::new(ProcessLauncher::new(
        config.agent_command.clone(),
        config.agent_args.clone(),
        config.output_tail_bytes,
    ));
    let agent = Arc::new(Agent::new(config.clone(), fetcher, launcher, callbacks));

    info!(
        addr = %addr,
        node_id = ?config.node_id,
        control_plane = %config.control_plane_url,
        workspaces_root = %config.workspaces_root.display(),
        "Starting AgentFleet agent"
    );

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, server::create_router(agent.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    agent.shutdown().await;
    info!("Agent stopped");
    Ok(())
}
