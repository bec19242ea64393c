//! Workspace checkouts.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use agentfleet_core::WorkspaceId;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

/// Populates a workspace directory from a repository.
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    async fn fetch(&self, repository: &str, branch: &str, dest: &Path) -> Result<(), FetchError>;
}

/// Shallow single-branch `git clone`.
pub struct GitFetcher {
    git_binary: String,
}

impl GitFetcher {
    pub fn new(git_binary: impl Into<String>) -> Self {
        Self {
            git_binary: git_binary.into(),
        }
    }
}

#[async_trait]
impl RepoFetcher for GitFetcher {
    async fn fetch(&self, repository: &str, branch: &str, dest: &Path) -> Result<(), FetchError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // A leftover directory from an earlier attempt would make git refuse.
        if tokio::fs::try_exists(dest).await? {
            tokio::fs::remove_dir_all(dest).await?;
        }

        debug!(repository = %repository, branch = %branch, dest = %dest.display(), "Cloning");
        let output = Command::new(&self.git_binary)
            .arg("clone")
            .arg("--depth")
            .arg("1")
            .arg("--branch")
            .arg(branch)
            .arg("--")
            .arg(repository)
            .arg(dest)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim().lines().last().unwrap_or_default().to_string();
            return Err(FetchError::Failed(if detail.is_empty() {
                format!(
                    "git clone exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                format!("git clone failed: {detail}")
            }));
        }

        info!(repository = %repository, branch = %branch, dest = %dest.display(), "Repository cloned");
        Ok(())
    }
}

/// Directory for a workspace under `root`. Ids that could escape the root are
/// rejected.
pub fn workspace_dir(root: &Path, id: &WorkspaceId) -> Option<PathBuf> {
    let id = id.as_str();
    let safe = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    safe.then(|| root.join(id))
}
