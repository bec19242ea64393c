//! Reclamation timers.
//!
//! A sorted set of `(due, node)` pairs with a reverse index so a node has at
//! most one pending timer. The set is volatile: the scheduler loop in
//! [`crate::node_lifecycle`] drains it, and after a restart timers are rebuilt
//! from the durable `warm_since` timestamps.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use agentfleet_core::NodeId;

#[derive(Default)]
struct TimerQueue {
    due: BTreeSet<(DateTime<Utc>, NodeId)>,
    index: HashMap<NodeId, DateTime<Utc>>,
}

/// Pending per-node timers.
#[derive(Default)]
pub struct TimerService {
    queue: Mutex<TimerQueue>,
}

impl TimerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the timer for `node_id`.
    pub async fn arm(&self, node_id: &NodeId, due: DateTime<Utc>) {
        let mut queue = self.queue.lock().await;
        if let Some(previous) = queue.index.insert(node_id.clone(), due) {
            queue.due.remove(&(previous, node_id.clone()));
        }
        queue.due.insert((due, node_id.clone()));
    }

    /// Cancel a pending timer; returns whether one was armed.
    pub async fn cancel(&self, node_id: &NodeId) -> bool {
        let mut queue = self.queue.lock().await;
        match queue.index.remove(node_id) {
            Some(due) => {
                queue.due.remove(&(due, node_id.clone()));
                true
            }
            None => false,
        }
    }

    /// Remove and return every timer due at or before `now`, earliest first.
    pub async fn pop_due(&self, now: DateTime<Utc>) -> Vec<NodeId> {
        let mut queue = self.queue.lock().await;
        let mut fired = Vec::new();
        while let Some((due, _)) = queue.due.first() {
            if *due > now {
                break;
            }
            if let Some((_, node_id)) = queue.due.pop_first() {
                queue.index.remove(&node_id);
                fired.push(node_id);
            }
        }
        fired
    }

    pub async fn due_at(&self, node_id: &NodeId) -> Option<DateTime<Utc>> {
        self.queue.lock().await.index.get(node_id).copied()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.index.len()
    }
}
