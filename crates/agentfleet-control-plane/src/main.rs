//! AgentFleet Control Plane Server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use agentfleet_control_plane::agent_client::HttpAgentClient;
use agentfleet_control_plane::provisioner::HttpProvisioner;
use agentfleet_control_plane::store::{MemoryStore, SqliteStore, Store};
use agentfleet_control_plane::{http, AppState, Config};
use agentfleet_core::NodeSpec;

/// AgentFleet control plane
#[derive(Parser, Debug)]
#[command(name = "agentfleet-control-plane")]
#[command(about = "Orchestrates coding agents across a pool of remote nodes", long_about = None)]
struct Cli {
    /// HTTP bind address
    #[arg(long, env = "AGENTFLEET_BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind_addr: String,

    /// Base URL remote agents use for callbacks
    #[arg(long, env = "AGENTFLEET_PUBLIC_URL", default_value = "http://127.0.0.1:8080")]
    public_url: String,

    /// SQLite database path (records are kept in memory when unset)
    #[arg(long, env = "AGENTFLEET_DATABASE")]
    database: Option<PathBuf>,

    /// Resource provisioner base URL
    #[arg(long, env = "AGENTFLEET_PROVISIONER_URL", default_value = "http://127.0.0.1:9090")]
    provisioner_url: String,

    /// Default node size
    #[arg(long, env = "AGENTFLEET_NODE_SIZE", default_value = "standard")]
    node_size: String,

    /// Default node location
    #[arg(long, env = "AGENTFLEET_NODE_LOCATION", default_value = "default")]
    node_location: String,

    /// Workspaces per node
    #[arg(long, env = "AGENTFLEET_NODE_CAPACITY", default_value_t = 4)]
    node_capacity: u32,

    /// Seconds a node stays warm before it is reclaimed
    #[arg(long, env = "AGENTFLEET_WARM_IDLE_SECS", default_value_t = 600)]
    warm_idle_secs: u64,

    /// Absolute lifetime of an auto-provisioned node, in seconds
    #[arg(long, env = "AGENTFLEET_NODE_MAX_LIFETIME_SECS", default_value_t = 4 * 60 * 60)]
    node_max_lifetime_secs: u64,

    /// Extra seconds past the warm timeout before the sweep reclaims a node
    #[arg(long, env = "AGENTFLEET_WARM_GRACE_SECS", default_value_t = 120)]
    warm_grace_secs: u64,

    /// Node health poll interval in seconds
    #[arg(long, env = "AGENTFLEET_NODE_HEALTH_POLL_SECS", default_value_t = 5)]
    node_health_poll_secs: u64,

    /// Seconds to wait for a new node's agent to become healthy
    #[arg(long, env = "AGENTFLEET_NODE_HEALTH_TIMEOUT_SECS", default_value_t = 300)]
    node_health_timeout_secs: u64,

    /// First workspace readiness poll interval in seconds
    #[arg(long, env = "AGENTFLEET_WORKSPACE_POLL_INITIAL_SECS", default_value_t = 2)]
    workspace_poll_initial_secs: u64,

    /// Longest workspace readiness poll interval in seconds
    #[arg(long, env = "AGENTFLEET_WORKSPACE_POLL_MAX_SECS", default_value_t = 10)]
    workspace_poll_max_secs: u64,

    /// Seconds a run waits for its workspace to become ready
    #[arg(long, env = "AGENTFLEET_WORKSPACE_READY_TIMEOUT_SECS", default_value_t = 300)]
    workspace_ready_timeout_secs: u64,

    /// Seconds before the sweep marks a `creating` workspace as failed
    #[arg(long, env = "AGENTFLEET_WORKSPACE_CREATING_TIMEOUT_SECS", default_value_t = 600)]
    workspace_creating_timeout_secs: u64,

    /// Seconds a run may sit in `queued` before the sweep fails it
    #[arg(long, env = "AGENTFLEET_QUEUED_TIMEOUT_SECS", default_value_t = 15 * 60)]
    queued_timeout_secs: u64,

    /// Seconds a run may sit in `delegated` before the sweep fails it
    #[arg(long, env = "AGENTFLEET_DELEGATED_TIMEOUT_SECS", default_value_t = 20 * 60)]
    delegated_timeout_secs: u64,

    /// Seconds a run may sit in `in_progress` before the sweep fails it
    #[arg(long, env = "AGENTFLEET_IN_PROGRESS_TIMEOUT_SECS", default_value_t = 4 * 60 * 60)]
    in_progress_timeout_secs: u64,

    /// Recovery sweep interval in seconds
    #[arg(long, env = "AGENTFLEET_SWEEP_INTERVAL_SECS", default_value_t = 300)]
    sweep_interval_secs: u64,

    /// Reclamation timer tick in seconds
    #[arg(long, env = "AGENTFLEET_TIMER_TICK_SECS", default_value_t = 1)]
    timer_tick_secs: u64,

    /// Callback token lifetime in seconds
    #[arg(long, env = "AGENTFLEET_CALLBACK_TOKEN_TTL_SECS", default_value_t = 12 * 60 * 60)]
    callback_token_ttl_secs: u64,

    /// Timeout for calls to the provisioner and node agents, in seconds
    #[arg(long, env = "AGENTFLEET_HTTP_CLIENT_TIMEOUT_SECS", default_value_t = 30)]
    http_client_timeout_secs: u64,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            http_bind_addr: self.bind_addr,
            public_url: self.public_url.trim_end_matches('/').to_string(),
            database_path: self.database,
            provisioner_url: self.provisioner_url,
            default_node: NodeSpec::new(self.node_size, self.node_location),
            node_capacity: self.node_capacity,
            warm_idle_timeout: Duration::from_secs(self.warm_idle_secs),
            warm_grace: Duration::from_secs(self.warm_grace_secs),
            node_max_lifetime: Duration::from_secs(self.node_max_lifetime_secs),
            node_health_poll_interval: Duration::from_secs(self.node_health_poll_secs),
            node_health_timeout: Duration::from_secs(self.node_health_timeout_secs),
            workspace_poll_initial: Duration::from_secs(self.workspace_poll_initial_secs),
            workspace_poll_max: Duration::from_secs(self.workspace_poll_max_secs),
            workspace_ready_timeout: Duration::from_secs(self.workspace_ready_timeout_secs),
            workspace_creating_timeout: Duration::from_secs(self.workspace_creating_timeout_secs),
            queued_timeout: Duration::from_secs(self.queued_timeout_secs),
            delegated_timeout: Duration::from_secs(self.delegated_timeout_secs),
            in_progress_timeout: Duration::from_secs(self.in_progress_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            timer_tick: Duration::from_secs(self.timer_tick_secs),
            callback_token_ttl: Duration::from_secs(self.callback_token_ttl_secs),
            http_client_timeout: Duration::from_secs(self.http_client_timeout_secs),
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

    let config = Cli::parse().into_config();
    let http_addr: SocketAddr = config.http_bind_addr.parse()?;

    let store: Arc<dyn Store> = match &config.database_path {
        Some(path) => {
            info!(path = %path.display(), "Opening SQLite store");
            Arc::new(SqliteStore::open(path)?)
        }
        None => {
            info!("No database configured, records are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };
    let provisioner = Arc::new(HttpProvisioner::new(
        &config.provisioner_url,
        config.http_client_timeout,
    )?);
    let agents = Arc::new(HttpAgentClient::new(config.http_client_timeout)?);

    let state = AppState::new(config, store, provisioner, agents);
    state.nodes.restore_timers().await?;

    let shutdown = CancellationToken::new();
    let timers = tokio::spawn(state.nodes.clone().run_timers(shutdown.clone()));
    let sweep = tokio::spawn(state.recovery.clone().run(shutdown.clone()));

    info!(http_addr = %http_addr, public_url = %state.config.public_url, "Starting AgentFleet control plane");

    let http_router = http::create_router(state.clone());
    let http_listener = TcpListener::bind(http_addr).await?;
    let server_shutdown = shutdown.clone();
    let result = axum::serve(http_listener, http_router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await;
    if let Err(e) = &result {
        error!(error = %e, "HTTP server error");
    }

    shutdown.cancel();
    let _ = tokio::join!(timers, sweep);
    state.orchestrator.drain().await;
    info!("Control plane stopped");

    result.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_config_defaults() {
        let config = Cli::try_parse_from(["agentfleet-control-plane"])
            .unwrap()
            .into_config();
        let defaults = Config::default();
        assert_eq!(config.warm_grace, defaults.warm_grace);
        assert_eq!(config.node_health_timeout, defaults.node_health_timeout);
        assert_eq!(config.workspace_poll_max, defaults.workspace_poll_max);
        assert_eq!(config.workspace_ready_timeout, defaults.workspace_ready_timeout);
        assert_eq!(config.queued_timeout, defaults.queued_timeout);
        assert_eq!(config.delegated_timeout, defaults.delegated_timeout);
        assert_eq!(config.in_progress_timeout, defaults.in_progress_timeout);
        assert_eq!(config.callback_token_ttl, defaults.callback_token_ttl);
        assert_eq!(config.http_client_timeout, defaults.http_client_timeout);
    }

    #[test]
    fn test_timeouts_are_configurable() {
        let config = Cli::try_parse_from([
            "agentfleet-control-plane",
            "--warm-grace-secs",
            "30",
            "--delegated-timeout-secs",
            "90",
            "--callback-token-ttl-secs",
            "3600",
            "--http-client-timeout-secs",
            "5",
        ])
        .unwrap()
        .into_config();
        assert_eq!(config.warm_grace, Duration::from_secs(30));
        assert_eq!(config.delegated_timeout, Duration::from_secs(90));
        assert_eq!(config.callback_token_ttl, Duration::from_secs(3600));
        assert_eq!(config.http_client_timeout, Duration::from_secs(5));
    }
}
