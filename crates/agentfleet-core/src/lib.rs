//! AgentFleet Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Database
//! - Runtime specifics
//!
//! Task runs, nodes, workspaces and agent sessions are described here together
//! with the state machines that govern them. Every persisted transition in the
//! control plane is checked against the tables in [`status`].

pub mod error;
pub mod ids;
pub mod node;
pub mod protocol;
pub mod run;
pub mod status;
pub mod workspace;

// Re-export commonly used types
pub use error::CoreError;
pub use ids::{NodeId, RunId, SessionId, WorkspaceId};
pub use node::{Node, NodeSpec};
pub use run::{NewRun, TaskRun};
pub use status::{
    ExecutionStep, LifecyclePhase, NodeStatus, RunStatus, SessionStatus, WorkspaceStatus,
};
pub use workspace::{AgentSession, Workspace};
