//! In-process wake-ups for executions waiting on workspace readiness.
//!
//! Polling the workspace record stays the source of truth; a callback only
//! cuts the current poll interval short. A notification that lands before
//! the waiter sleeps is kept as a permit, so it is never lost.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use agentfleet_core::WorkspaceId;

#[derive(Default)]
pub(crate) struct ReadinessWaiters {
    waiters: Mutex<HashMap<WorkspaceId, Arc<Notify>>>,
}

impl ReadinessWaiters {
    pub(crate) async fn register(&self, workspace_id: &WorkspaceId) -> Arc<Notify> {
        self.waiters
            .lock()
            .await
            .entry(workspace_id.clone())
            .or_default()
            .clone()
    }

    pub(crate) async fn notify(&self, workspace_id: &WorkspaceId) {
        if let Some(waiter) = self.waiters.lock().await.get(workspace_id) {
            waiter.notify_one();
        }
    }

    pub(crate) async fn remove(&self, workspace_id: &WorkspaceId) {
        self.waiters.lock().await.remove(workspace_id);
    }
}
