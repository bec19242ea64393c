//! Control plane configuration.

use std::path::PathBuf;
use std::time::Duration;

use agentfleet_core::{NodeSpec, RunStatus};

/// Control plane configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server bind address.
    pub http_bind_addr: String,

    /// Base URL remote agents use to reach the callback routes.
    pub public_url: String,

    /// SQLite database path; `None` keeps records in memory.
    pub database_path: Option<PathBuf>,

    /// Base URL of the resource provisioning API.
    pub provisioner_url: String,

    /// Node size/location used when a run does not constrain them.
    pub default_node: NodeSpec,

    /// Workspaces a single node may host.
    pub node_capacity: u32,

    /// How long a node stays warm before its reclamation timer fires.
    pub warm_idle_timeout: Duration,

    /// Extra time the idle sweep allows past `warm_idle_timeout`.
    pub warm_grace: Duration,

    /// Absolute lifetime of an auto-provisioned node, whatever its phase.
    pub node_max_lifetime: Duration,

    /// Interval between node health probes while a node boots.
    pub node_health_poll_interval: Duration,

    /// Give up waiting for a freshly provisioned node after this long.
    pub node_health_timeout: Duration,

    /// First workspace readiness poll interval.
    pub workspace_poll_initial: Duration,

    /// Readiness poll interval ceiling.
    pub workspace_poll_max: Duration,

    /// Give up waiting for workspace readiness after this long.
    pub workspace_ready_timeout: Duration,

    /// Workspaces stuck in `creating` longer than this are marked `error`.
    pub workspace_creating_timeout: Duration,

    /// Stuck-run thresholds, measured from the run's last update.
    pub queued_timeout: Duration,
    pub delegated_timeout: Duration,
    pub in_progress_timeout: Duration,

    /// Recovery sweep period.
    pub sweep_interval: Duration,

    /// Timer service tick.
    pub timer_tick: Duration,

    /// Lifetime of per-workspace callback tokens.
    pub callback_token_ttl: Duration,

    /// Request timeout for provisioner and remote agent calls.
    pub http_client_timeout: Duration,
}

impl Config {
    /// Stuck threshold for an executing run status.
    pub fn stuck_timeout(&self, status: RunStatus) -> Option<Duration> {
        match status {
            RunStatus::Queued => Some(self.queued_timeout),
            RunStatus::Delegated => Some(self.delegated_timeout),
            RunStatus::InProgress => Some(self.in_progress_timeout),
            _ => None,
        }
    }

    /// URL the agent posts readiness callbacks to.
    pub fn workspace_callback_base(&self) -> String {
        format!("{}/workspaces", self.public_url.trim_end_matches('/'))
    }

    /// URL the agent posts the run's terminal status to.
    pub fn status_callback_url(&self, run_id: &agentfleet_core::RunId) -> String {
        format!(
            "{}/tasks/{}/status/callback",
            self.public_url.trim_end_matches('/'),
            run_id
        )
    }
}

/// Convert for arithmetic on `chrono` timestamps; absurdly long durations
/// saturate at a century.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_bind_addr: "0.0.0.0:8080".to_string(),
            public_url: "http://127.0.0.1:8080".to_string(),
            database_path: None,
            provisioner_url: "http://127.0.0.1:9090".to_string(),
            default_node: NodeSpec::new("standard", "default"),
            node_capacity: 4,
            warm_idle_timeout: Duration::from_secs(10 * 60),
            warm_grace: Duration::from_secs(2 * 60),
            node_max_lifetime: Duration::from_secs(4 * 60 * 60),
            node_health_poll_interval: Duration::from_secs(5),
            node_health_timeout: Duration::from_secs(5 * 60),
            workspace_poll_initial: Duration::from_secs(2),
            workspace_poll_max: Duration::from_secs(10),
            workspace_ready_timeout: Duration::from_secs(5 * 60),
            workspace_creating_timeout: Duration::from_secs(10 * 60),
            queued_timeout: Duration::from_secs(15 * 60),
            delegated_timeout: Duration::from_secs(20 * 60),
            in_progress_timeout: Duration::from_secs(4 * 60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            timer_tick: Duration::from_secs(1),
            callback_token_ttl: Duration::from_secs(12 * 60 * 60),
            http_client_timeout: Duration::from_secs(30),
        }
    }
}
