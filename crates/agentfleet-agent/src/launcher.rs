//! Worker process launching.
//!
//! A worker is the autonomous coding process inside a workspace. It receives
//! the instruction as its last argument, runs in the workspace directory, and
//! its exit status decides the run's terminal status.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agentfleet_core::{RunId, SessionId, WorkspaceId};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to spawn worker process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Worker process has no {0} handle")]
    MissingPipe(&'static str),
}

/// Everything a launcher needs to start one worker.
#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub session_id: SessionId,
    pub workspace_id: WorkspaceId,
    pub run_id: RunId,
    pub instruction: String,
    pub working_dir: PathBuf,
    /// Cancelled when the workspace is stopped.
    pub cancel: CancellationToken,
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Last lines of combined stdout/stderr.
    pub output_tail: String,
    /// The worker was killed because its workspace was stopped.
    pub stopped: bool,
}

/// Starts worker processes.
///
/// `launch` returns once the worker is running; the handle resolves when it
/// exits.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, job: WorkerJob) -> Result<JoinHandle<WorkerOutcome>, LaunchError>;
}

/// Bounded tail of worker output, trimmed by whole lines.
#[derive(Debug)]
pub struct OutputTail {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
}

impl OutputTail {
    pub fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    pub fn push(&mut self, line: &str) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_string());
        while self.bytes > self.limit && self.lines.len() > 1 {
            if let Some(dropped) = self.lines.pop_front() {
                self.bytes -= dropped.len() + 1;
            }
        }
    }

    pub fn render(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Launches the configured agent command with `tokio::process`.
pub struct ProcessLauncher {
    command: String,
    args: Vec<String>,
    tail_bytes: usize,
}

impl ProcessLauncher {
    pub fn new(command: impl Into<String>, args: Vec<String>, tail_bytes: usize) -> Self {
        Self {
            command: command.into(),
            args,
            tail_bytes,
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, job: WorkerJob) -> Result<JoinHandle<WorkerOutcome>, LaunchError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg(&job.instruction)
            .env("AGENTFLEET_RUN_ID", job.run_id.as_str())
            .env("AGENTFLEET_SESSION_ID", job.session_id.as_str())
            .env("AGENTFLEET_WORKSPACE_ID", job.workspace_id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(&job.working_dir)
            .kill_on_drop(true);

        debug!(command = %self.command, working_dir = %job.working_dir.display(), "Spawning worker");
        let mut child = cmd.spawn().map_err(|e| {
            error!(error = %e, command = %self.command, "Failed to spawn worker process");
            e
        })?;
        info!(
            session_id = %job.session_id,
            run_id = %job.run_id,
            pid = ?child.id(),
            "Worker process spawned"
        );

        let stdout = child.stdout.take().ok_or(LaunchError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(LaunchError::MissingPipe("stderr"))?;
        let tail = Arc::new(Mutex::new(OutputTail::new(self.tail_bytes)));
        let stdout_reader = tokio::spawn(collect_lines(stdout, tail.clone(), false));
        let stderr_reader = tokio::spawn(collect_lines(stderr, tail.clone(), true));

        Ok(tokio::spawn(async move {
            let mut stopped = false;
            let status = tokio::select! {
                status = child.wait() => status,
                _ = job.cancel.cancelled() => {
                    stopped = true;
                    if let Err(e) = child.kill().await {
                        warn!(error = %e, session_id = %job.session_id, "Failed to kill worker");
                    }
                    child.wait().await
                }
            };
            if stopped {
                // Grandchildren may still hold the pipes open.
                stdout_reader.abort();
                stderr_reader.abort();
            } else {
                let _ = tokio::join!(stdout_reader, stderr_reader);
            }

            let exit_code = status.as_ref().ok().and_then(|s| s.code());
            let success = !stopped && status.as_ref().map(|s| s.success()).unwrap_or(false);
            if let Err(e) = &status {
                error!(error = %e, session_id = %job.session_id, "Failed to wait for worker");
            }
            info!(session_id = %job.session_id, exit_code = ?exit_code, success, stopped, "Worker exited");

            let output_tail = tail.lock().await.render();
            WorkerOutcome {
                success,
                exit_code,
                output_tail,
                stopped,
            }
        }))
    }
}

async fn collect_lines<R>(stream: R, tail: Arc<Mutex<OutputTail>>, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if is_stderr && !line.trim().is_empty() {
                    warn!(stderr = %line.trim(), "Worker stderr");
                }
                tail.lock().await.push(&line);
            }
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Error reading worker output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn job(dir: &std::path::Path, instruction: &str) -> WorkerJob {
        WorkerJob {
            session_id: SessionId::new("s1"),
            workspace_id: WorkspaceId::new("ws-1"),
            run_id: RunId::new("r1"),
            instruction: instruction.to_string(),
            working_dir: dir.to_path_buf(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_output_tail_keeps_last_lines() {
        let mut tail = OutputTail::new(12);
        tail.push("first");
        tail.push("second");
        tail.push("third");
        assert_eq!(tail.render(), "third");

        let mut tail = OutputTail::new(100);
        tail.push("a");
        tail.push("b");
        assert_eq!(tail.render(), "a\nb");
    }

    #[tokio::test]
    async fn test_process_receives_instruction_and_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(
            "sh",
            vec!["-c".into(), "echo \"got: $0\"; echo oops >&2; exit 3".into()],
            1024,
        );

        let outcome = launcher
            .launch(job(dir.path(), "fix bug X"))
            .unwrap()
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.output_tail.contains("got: fix bug X"));
        assert!(outcome.output_tail.contains("oops"));
        assert!(!outcome.stopped);
    }

    #[tokio::test]
    async fn test_process_runs_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let launcher = ProcessLauncher::new("sh", vec!["-c".into(), "cat marker.txt".into()], 1024);

        let outcome = launcher.launch(job(dir.path(), "x")).unwrap().await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output_tail, "here");
    }

    #[tokio::test]
    async fn test_cancel_kills_worker() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new("sh", vec!["-c".into(), "exec sleep 30".into()], 1024);
        let job = job(dir.path(), "x");
        let cancel = job.cancel.clone();

        let handle = launcher.launch(job).unwrap();
        cancel.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.stopped);
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_launch() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new("/nonexistent/agentfleet-worker", vec![], 1024);
        assert!(matches!(
            launcher.launch(job(dir.path(), "x")),
            Err(LaunchError::Spawn(_))
        ));
    }
}
