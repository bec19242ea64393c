//! HTTP request handlers.

mod callbacks;
mod health;
mod nodes;
mod tasks;

pub use callbacks::{status_callback, workspace_provisioning_failed, workspace_ready};
pub use health::{health_check, metrics_handler};
pub use nodes::list_nodes;
pub use tasks::{cancel_task, get_task, list_tasks, retry_task, start_task, submit_task};
