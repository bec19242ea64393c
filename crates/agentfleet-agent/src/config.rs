//! Agent configuration.

use std::path::PathBuf;
use std::time::Duration;

use agentfleet_core::NodeId;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address.
    pub bind_addr: String,

    /// Control plane base URL; relative callback URLs are resolved against it.
    pub control_plane_url: String,

    /// Directory holding one checkout per workspace.
    pub workspaces_root: PathBuf,

    /// Git executable used for clones.
    pub git_binary: String,

    /// Worker executable; the instruction is passed as its last argument.
    pub agent_command: String,

    /// Arguments placed before the instruction.
    pub agent_args: Vec<String>,

    /// Node this agent runs on, reported by `/health`.
    pub node_id: Option<NodeId>,

    /// Bytes of worker output kept for the status callback summary.
    pub output_tail_bytes: usize,

    /// Attempts per callback before giving up.
    pub callback_attempts: u32,

    /// Delay between callback attempts; grows linearly.
    pub callback_retry_delay: Duration,

    /// Request timeout for callbacks.
    pub http_client_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7070".to_string(),
            control_plane_url: "http://127.0.0.1:8080".to_string(),
            workspaces_root: PathBuf::from("/var/lib/agentfleet/workspaces"),
            git_binary: "git".to_string(),
            agent_command: "claude".to_string(),
            agent_args: vec!["--print".to_string()],
            node_id: None,
            output_tail_bytes: 4096,
            callback_attempts: 3,
            callback_retry_delay: Duration::from_millis(500),
            http_client_timeout: Duration::from_secs(30),
        }
    }
}
