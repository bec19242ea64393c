//! AgentFleet Control Plane Library
//!
//! This crate provides the control plane for AgentFleet: the task-run
//! orchestrator, the warm node pool with its reclamation timers, the recovery
//! sweep, and the HTTP API remote agents and users talk to.

pub mod agent_client;
pub mod config;
pub mod crypto;
pub mod http;
pub mod metrics;
pub mod node_lifecycle;
pub mod orchestrator;
pub mod provisioner;
pub mod recovery;
pub mod state;
pub mod store;
pub mod timer;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use node_lifecycle::NodeLifecycleManager;
pub use orchestrator::Orchestrator;
pub use recovery::RecoverySweep;
pub use state::AppState;
