//! Workspaces and sessions hosted by this agent.
//!
//! Records are in memory only; a restarted agent knows no workspaces and the
//! control plane's recovery sweep takes care of whatever was in flight.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use agentfleet_core::protocol::{
    CreateSessionRequest, CreateWorkspaceRequest, StartSessionRequest, StartSessionResponse,
    StatusCallbackRequest,
};
use agentfleet_core::{NodeId, RunStatus, SessionId, WorkspaceId};

use crate::callback::ControlPlaneClient;
use crate::config::Config;
use crate::launcher::{LaunchError, WorkerJob, WorkerLauncher, WorkerOutcome};
use crate::sessions::{SessionEntry, SessionState, StartDecision};
use crate::workspace::{workspace_dir, RepoFetcher};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("workspace not found: {0}")]
    WorkspaceNotFound(WorkspaceId),

    #[error("agent session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("{0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceState {
    Provisioning,
    Ready,
    Failed(String),
}

struct WorkspaceEntry {
    dir: PathBuf,
    state: WorkspaceState,
    sessions: HashMap<SessionId, SessionEntry>,
    /// Stops the clone and every worker of this workspace.
    cancel: CancellationToken,
}

pub struct Agent {
    config: Arc<Config>,
    fetcher: Arc<dyn RepoFetcher>,
    launcher: Arc<dyn WorkerLauncher>,
    callbacks: Arc<ControlPlaneClient>,
    workspaces: Mutex<HashMap<WorkspaceId, WorkspaceEntry>>,
    jobs: TaskTracker,
}

impl Agent {
    pub fn new(
        config: Arc<Config>,
        fetcher: Arc<dyn RepoFetcher>,
        launcher: Arc<dyn WorkerLauncher>,
        callbacks: Arc<ControlPlaneClient>,
    ) -> Self {
        Self {
            config,
            fetcher,
            launcher,
            callbacks,
            workspaces: Mutex::new(HashMap::new()),
            jobs: TaskTracker::new(),
        }
    }

    pub fn node_id(&self) -> Option<&NodeId> {
        self.config.node_id.as_ref()
    }

    #[cfg(test)]
    pub async fn workspace_state(&self, id: &WorkspaceId) -> Option<WorkspaceState> {
        self.workspaces.lock().await.get(id).map(|w| w.state.clone())
    }

    /// Accept a workspace and clone it in the background. Returns `false` for
    /// a workspace that is already known; nothing is cloned twice.
    pub async fn create_workspace(
        self: &Arc<Self>,
        request: CreateWorkspaceRequest,
    ) -> Result<bool, AgentError> {
        let dir = workspace_dir(&self.config.workspaces_root, &request.workspace_id).ok_or_else(
            || AgentError::InvalidInput(format!("bad workspace id '{}'", request.workspace_id)),
        )?;

        let cancel = {
            let mut workspaces = self.workspaces.lock().await;
            if workspaces.contains_key(&request.workspace_id) {
                info!(workspace_id = %request.workspace_id, "Workspace already known");
                return Ok(false);
            }
            let cancel = CancellationToken::new();
            workspaces.insert(
                request.workspace_id.clone(),
                WorkspaceEntry {
                    dir: dir.clone(),
                    state: WorkspaceState::Provisioning,
                    sessions: HashMap::new(),
                    cancel: cancel.clone(),
                },
            );
            cancel
        };

        info!(
            workspace_id = %request.workspace_id,
            repository = %request.repository,
            branch = %request.branch,
            "Provisioning workspace"
        );
        self.jobs
            .spawn(self.clone().provision(request, dir, cancel));
        Ok(true)
    }

    async fn provision(
        self: Arc<Self>,
        request: CreateWorkspaceRequest,
        dir: PathBuf,
        cancel: CancellationToken,
    ) {
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                info!(workspace_id = %request.workspace_id, "Provisioning abandoned");
                return;
            }
            result = self.fetcher.fetch(&request.repository, &request.branch, &dir) => result,
        };

        let state = match &result {
            Ok(()) => WorkspaceState::Ready,
            Err(e) => WorkspaceState::Failed(e.to_string()),
        };
        {
            let mut workspaces = self.workspaces.lock().await;
            match workspaces.get_mut(&request.workspace_id) {
                Some(entry) if !entry.cancel.is_cancelled() => entry.state = state.clone(),
                _ => return,
            }
        }

        let callback = match &state {
            WorkspaceState::Failed(reason) => {
                warn!(workspace_id = %request.workspace_id, reason = %reason, "Workspace provisioning failed");
                self.callbacks
                    .provisioning_failed(
                        &request.callback_url,
                        &request.workspace_id,
                        &request.callback_token,
                        reason,
                    )
                    .await
            }
            _ => {
                info!(workspace_id = %request.workspace_id, "Workspace ready");
                self.callbacks
                    .workspace_ready(
                        &request.callback_url,
                        &request.workspace_id,
                        &request.callback_token,
                    )
                    .await
            }
        };
        if let Err(e) = callback {
            error!(workspace_id = %request.workspace_id, error = %e, "Workspace callback failed");
        }
    }

    /// Stop every worker of the workspace and delete its directory.
    pub async fn stop_workspace(&self, id: &WorkspaceId) -> Result<(), AgentError> {
        let entry = self
            .workspaces
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| AgentError::WorkspaceNotFound(id.clone()))?;

        entry.cancel.cancel();
        let running = entry.sessions.values().filter(|s| s.is_running()).count();
        match tokio::fs::remove_dir_all(&entry.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(workspace_id = %id, error = %e, "Failed to remove workspace directory"),
        }
        info!(workspace_id = %id, stopped_sessions = running, "Workspace stopped");
        Ok(())
    }

    /// Record a session. Nothing is launched. Returns `false` if the session
    /// was already registered.
    pub async fn register_session(
        &self,
        workspace_id: &WorkspaceId,
        request: CreateSessionRequest,
    ) -> Result<bool, AgentError> {
        let mut workspaces = self.workspaces.lock().await;
        let entry = workspaces
            .get_mut(workspace_id)
            .ok_or_else(|| AgentError::WorkspaceNotFound(workspace_id.clone()))?;
        if entry.sessions.contains_key(&request.session_id) {
            return Ok(false);
        }
        if entry.state != WorkspaceState::Ready {
            return Err(AgentError::Conflict(format!(
                "workspace {} is not ready",
                workspace_id
            )));
        }

        info!(workspace_id = %workspace_id, session_id = %request.session_id, label = %request.label, "Agent session registered");
        entry
            .sessions
            .insert(request.session_id, SessionEntry::new(request.label));
        Ok(true)
    }

    /// Launch the worker for a registered session, at most once.
    pub async fn start_session(
        self: &Arc<Self>,
        workspace_id: &WorkspaceId,
        session_id: &SessionId,
        request: StartSessionRequest,
    ) -> Result<StartSessionResponse, AgentError> {
        let mut workspaces = self.workspaces.lock().await;
        let entry = workspaces
            .get_mut(workspace_id)
            .ok_or_else(|| AgentError::WorkspaceNotFound(workspace_id.clone()))?;
        let dir = entry.dir.clone();
        let cancel = entry.cancel.child_token();
        let ready = entry.state == WorkspaceState::Ready;
        let session = entry
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AgentError::SessionNotFound(session_id.clone()))?;

        match session.decide_start(&request.instruction) {
            StartDecision::AlreadyStarted => {
                info!(session_id = %session_id, "Agent session already started");
                return Ok(StartSessionResponse {
                    session_id: session_id.clone(),
                    already_started: true,
                });
            }
            StartDecision::Conflict => {
                return Err(AgentError::Conflict(format!(
                    "agent session {} was started with a different instruction",
                    session_id
                )));
            }
            StartDecision::Launch if !ready => {
                return Err(AgentError::Conflict(format!(
                    "workspace {} is not ready",
                    workspace_id
                )));
            }
            StartDecision::Launch => {}
        }

        let handle = self.launcher.launch(WorkerJob {
            session_id: session_id.clone(),
            workspace_id: workspace_id.clone(),
            run_id: request.run_id.clone(),
            instruction: request.instruction.clone(),
            working_dir: dir,
            cancel,
        })?;
        session.state = SessionState::Running {
            instruction: request.instruction.clone(),
        };
        info!(
            workspace_id = %workspace_id,
            session_id = %session_id,
            label = %session.label,
            run_id = %request.run_id,
            "Agent session started"
        );
        drop(workspaces);

        self.jobs.spawn(self.clone().monitor(
            workspace_id.clone(),
            session_id.clone(),
            request,
            handle,
        ));

        Ok(StartSessionResponse {
            session_id: session_id.clone(),
            already_started: false,
        })
    }

    /// Wait for the worker and report the run's terminal status.
    async fn monitor(
        self: Arc<Self>,
        workspace_id: WorkspaceId,
        session_id: SessionId,
        request: StartSessionRequest,
        handle: JoinHandle<WorkerOutcome>,
    ) {
        let outcome = handle.await.unwrap_or_else(|e| {
            error!(session_id = %session_id, error = %e, "Worker task failed");
            WorkerOutcome {
                success: false,
                exit_code: None,
                output_tail: String::new(),
                stopped: false,
            }
        });

        if let Some(session) = self
            .workspaces
            .lock()
            .await
            .get_mut(&workspace_id)
            .and_then(|w| w.sessions.get_mut(&session_id))
        {
            session.state = SessionState::Exited {
                instruction: request.instruction.clone(),
            };
        }

        if outcome.stopped {
            info!(session_id = %session_id, "Worker stopped with its workspace");
            return;
        }

        let callback = status_report(&outcome);
        info!(session_id = %session_id, run_id = %request.run_id, status = %callback.to_status, "Reporting run status");
        if let Err(e) = self
            .callbacks
            .report_status(&request.callback_url, &request.callback_token, &callback)
            .await
        {
            error!(run_id = %request.run_id, error = %e, "Status callback failed");
        }
    }

    /// Stop all workspaces and wait for background jobs.
    pub async fn shutdown(&self) {
        for entry in self.workspaces.lock().await.values() {
            entry.cancel.cancel();
        }
        self.jobs.close();
        self.jobs.wait().await;
    }
}

fn status_report(outcome: &WorkerOutcome) -> StatusCallbackRequest {
    let tail = outcome.output_tail.trim();
    let summary = if !tail.is_empty() {
        Some(tail.to_string())
    } else if outcome.success {
        None
    } else {
        Some(match outcome.exit_code {
            Some(code) => format!("worker exited with code {code}"),
            None => "worker terminated abnormally".to_string(),
        })
    };

    StatusCallbackRequest {
        to_status: if outcome.success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        },
        output_summary: summary,
        output_branch: None,
    }
}
