//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format,
//! computed from the durable records on every scrape.

use std::fmt::Write;
use std::sync::Arc;

use agentfleet_core::{LifecyclePhase, RunStatus, WorkspaceStatus};

use crate::state::AppState;
use crate::store::StoreError;

/// Collect all metrics from the store and format as Prometheus text.
pub async fn collect_metrics(state: &Arc<AppState>) -> Result<String, StoreError> {
    let mut output = String::new();

    collect_run_metrics(state, &mut output).await?;
    collect_node_metrics(state, &mut output).await?;
    collect_workspace_metrics(state, &mut output).await?;

    Ok(output)
}

fn write_gauge<'a>(
    output: &mut String,
    name: &str,
    help: &str,
    label: &str,
    counts: impl Iterator<Item = (&'a str, usize)>,
) {
    if !output.is_empty() {
        writeln!(output).ok();
    }
    writeln!(output, "# HELP {name} {help}").ok();
    writeln!(output, "# TYPE {name} gauge").ok();
    for (value, count) in counts {
        writeln!(output, "{name}{{{label}=\"{value}\"}} {count}").ok();
    }
}

/// Task runs by status.
async fn collect_run_metrics(state: &Arc<AppState>, output: &mut String) -> Result<(), StoreError> {
    let runs = state.store.list_runs(&[]).await?;
    let counts = RunStatus::ALL
        .iter()
        .map(|status| (status.as_str(), runs.iter().filter(|r| r.status == *status).count()));

    write_gauge(
        output,
        "agentfleet_task_runs",
        "Number of task runs by status",
        "status",
        counts,
    );
    Ok(())
}

/// Nodes by lifecycle phase.
async fn collect_node_metrics(
    state: &Arc<AppState>,
    output: &mut String,
) -> Result<(), StoreError> {
    let nodes = state.store.list_nodes(None).await?;
    let counts = LifecyclePhase::ALL
        .iter()
        .map(|phase| (phase.as_str(), nodes.iter().filter(|n| n.phase == *phase).count()));

    write_gauge(
        output,
        "agentfleet_nodes",
        "Number of nodes by lifecycle phase",
        "phase",
        counts,
    );

    let slots: u32 = nodes.iter().map(|n| n.active_workspaces).sum();
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP agentfleet_node_workspace_slots_used Workspace slots in use across all nodes"
    )
    .ok();
    writeln!(output, "# TYPE agentfleet_node_workspace_slots_used gauge").ok();
    writeln!(output, "agentfleet_node_workspace_slots_used {slots}").ok();
    Ok(())
}

/// Workspaces by status.
async fn collect_workspace_metrics(
    state: &Arc<AppState>,
    output: &mut String,
) -> Result<(), StoreError> {
    let workspaces = state.store.list_workspaces(None).await?;
    let counts = WorkspaceStatus::ALL.iter().map(|status| {
        (
            status.as_str(),
            workspaces.iter().filter(|w| w.status == *status).count(),
        )
    });

    write_gauge(
        output,
        "agentfleet_workspaces",
        "Number of workspaces by status",
        "status",
        counts,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use agentfleet_core::{NewRun, NodeSpec, TaskRun};

    use super::*;
    use crate::testing::{insert_running_node, test_state};

    #[tokio::test]
    async fn test_collect_metrics_empty_state() {
        let state = test_state().0;
        let output = collect_metrics(&state).await.unwrap();

        assert!(output.contains("# TYPE agentfleet_task_runs gauge"));
        assert!(output.contains("agentfleet_task_runs{status=\"in_progress\"} 0"));
        assert!(output.contains("agentfleet_nodes{phase=\"warm\"} 0"));
        assert!(output.contains("agentfleet_workspaces{status=\"creating\"} 0"));
        assert!(output.contains("agentfleet_node_workspace_slots_used 0"));
    }

    #[tokio::test]
    async fn test_collect_metrics_counts() {
        let state = test_state().0;
        state
            .store
            .insert_run(&TaskRun::new(NewRun::new("fix bug X", "repo")))
            .await
            .unwrap();
        let node =
            insert_running_node(state.store.as_ref(), NodeSpec::new("small", "fra"), true).await;
        state.store.reserve_node_slot(&node.id).await.unwrap();

        let output = collect_metrics(&state).await.unwrap();
        assert!(output.contains("agentfleet_task_runs{status=\"ready\"} 1"));
        assert!(output.contains("agentfleet_nodes{phase=\"active\"} 1"));
        assert!(output.contains("agentfleet_node_workspace_slots_used 1"));
    }
}
