//! SQLite-backed store.
//!
//! Every conditional write is a single `UPDATE ... WHERE <expected>` statement
//! and the affected-row count is the compare-and-swap result. Status strings
//! are inlined from the closed enum sets, never from caller input.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::info;

use agentfleet_core::{
    AgentSession, LifecyclePhase, Node, NodeId, RunId, RunStatus, SessionId, SessionStatus,
    TaskRun, Workspace, WorkspaceId, WorkspaceStatus,
};

use super::{NodeCondition, NodePatch, RunPatch, SessionPatch, Store, StoreError, WorkspacePatch};

refinery::embed_migrations!("migrations");

/// SQLite [`Store`] implementation.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file and bring its schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        Self::with_migrations(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_migrations(Connection::open_in_memory()?)
    }

    fn with_migrations(mut conn: Connection) -> Result<Self, StoreError> {
        let report = migrations::runner().run(&mut conn)?;
        for migration in report.applied_migrations() {
            info!(
                name = %migration.name(),
                version = migration.version(),
                "Applied migration"
            );
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Backend("connection mutex poisoned".into()))?;
        f(&conn)
    }

    fn cas_run(
        &self,
        id: &RunId,
        attempt: Option<u32>,
        expected: &[RunStatus],
        patch: RunPatch,
    ) -> Result<bool, StoreError> {
        if expected.is_empty() {
            return Ok(false);
        }
        let sql = format!(
            "UPDATE task_runs SET
                status = COALESCE(?1, status),
                execution_step = COALESCE(?2, execution_step),
                execution_step_ord = COALESCE(?3, execution_step_ord),
                node_id = COALESCE(?4, node_id),
                workspace_id = COALESCE(?5, workspace_id),
                agent_session_id = COALESCE(?6, agent_session_id),
                auto_provisioned_node = COALESCE(?7, auto_provisioned_node),
                started_at = COALESCE(?8, started_at),
                completed_at = COALESCE(?9, completed_at),
                error_message = COALESCE(?10, error_message),
                output_summary = COALESCE(?11, output_summary),
                output_branch = COALESCE(?12, output_branch),
                updated_at = ?13
             WHERE id = ?14
               AND status IN ({})
               AND (?3 IS NULL OR execution_step_ord IS NULL OR execution_step_ord <= ?3)
               AND (?15 IS NULL OR attempt = ?15)",
            in_list(expected.iter().map(|s| s.as_str()))
        );
        self.with_connection(|conn| {
            let affected = conn.execute(
                &sql,
                params![
                    patch.status.map(|s| s.as_str()),
                    patch.execution_step.map(|s| s.as_str()),
                    patch.execution_step.map(|s| s.ordinal() as i64),
                    patch.node_id.as_ref().map(|id| id.as_str()),
                    patch.workspace_id.as_ref().map(|id| id.as_str()),
                    patch.agent_session_id.as_ref().map(|id| id.as_str()),
                    patch.auto_provisioned_node,
                    patch.started_at.map(to_ms),
                    patch.completed_at.map(to_ms),
                    patch.error_message,
                    patch.output_summary,
                    patch.output_branch,
                    to_ms(Utc::now()),
                    id.as_str(),
                    attempt,
                ],
            )?;
            Ok(affected == 1)
        })
    }
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn in_list(values: impl IntoIterator<Item = &'static str>) -> String {
    values
        .into_iter()
        .map(|v| format!("'{v}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn map_insert_error(err: rusqlite::Error, id: &str) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _) if e.code == ErrorCode::ConstraintViolation => {
            StoreError::Duplicate(id.to_string())
        }
        other => other.into(),
    }
}

fn conversion_error(
    row: &Row<'_>,
    column: &str,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    let index = row.as_ref().column_index(column).unwrap_or(0);
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_col<T>(row: &Row<'_>, column: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(column)?;
    text.parse().map_err(|e| conversion_error(row, column, e))
}

fn parse_opt_col<T>(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: Option<String> = row.get(column)?;
    text.map(|t| t.parse().map_err(|e| conversion_error(row, column, e)))
        .transpose()
}

#[derive(Debug, thiserror::Error)]
#[error("timestamp out of range: {0}")]
struct TimestampRange(i64);

fn time_col(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(column)?;
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| conversion_error(row, column, TimestampRange(ms)))
}

fn opt_time_col(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let ms: Option<i64> = row.get(column)?;
    ms.map(|ms| {
        DateTime::<Utc>::from_timestamp_millis(ms)
            .ok_or_else(|| conversion_error(row, column, TimestampRange(ms)))
    })
    .transpose()
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<TaskRun> {
    let depends_on: String = row.get("depends_on")?;
    let depends_on: Vec<RunId> =
        serde_json::from_str(&depends_on).map_err(|e| conversion_error(row, "depends_on", e))?;
    Ok(TaskRun {
        id: RunId::new(row.get::<_, String>("id")?),
        status: parse_col(row, "status")?,
        execution_step: parse_opt_col(row, "execution_step")?,
        node_id: row.get::<_, Option<String>>("node_id")?.map(NodeId::new),
        workspace_id: row
            .get::<_, Option<String>>("workspace_id")?
            .map(WorkspaceId::new),
        agent_session_id: row
            .get::<_, Option<String>>("agent_session_id")?
            .map(SessionId::new),
        instruction: row.get("instruction")?,
        repository: row.get("repository")?,
        branch: row.get("branch")?,
        preferred_node_id: row
            .get::<_, Option<String>>("preferred_node_id")?
            .map(NodeId::new),
        node_size: row.get("node_size")?,
        node_location: row.get("node_location")?,
        depends_on,
        created_at: time_col(row, "created_at")?,
        updated_at: time_col(row, "updated_at")?,
        started_at: opt_time_col(row, "started_at")?,
        completed_at: opt_time_col(row, "completed_at")?,
        error_message: row.get("error_message")?,
        output_summary: row.get("output_summary")?,
        output_branch: row.get("output_branch")?,
        auto_provisioned_node: row.get("auto_provisioned_node")?,
        attempt: row.get("attempt")?,
    })
}

fn row_to_node(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: NodeId::new(row.get::<_, String>("id")?),
        status: parse_col(row, "status")?,
        phase: parse_col(row, "phase")?,
        address: row.get("address")?,
        instance_id: row.get("instance_id")?,
        size: row.get("size")?,
        location: row.get("location")?,
        active_workspaces: row.get("active_workspaces")?,
        max_workspaces: row.get("max_workspaces")?,
        last_heartbeat: opt_time_col(row, "last_heartbeat")?,
        auto_provisioned: row.get("auto_provisioned")?,
        created_at: time_col(row, "created_at")?,
        updated_at: time_col(row, "updated_at")?,
        warm_since: opt_time_col(row, "warm_since")?,
    })
}

fn row_to_workspace(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        id: WorkspaceId::new(row.get::<_, String>("id")?),
        node_id: NodeId::new(row.get::<_, String>("node_id")?),
        run_id: RunId::new(row.get::<_, String>("run_id")?),
        status: parse_col(row, "status")?,
        repository: row.get("repository")?,
        branch: row.get("branch")?,
        ready_at: opt_time_col(row, "ready_at")?,
        error_message: row.get("error_message")?,
        callback_token_hash: row.get("callback_token_hash")?,
        callback_token_expires_at: opt_time_col(row, "callback_token_expires_at")?,
        created_at: time_col(row, "created_at")?,
        updated_at: time_col(row, "updated_at")?,
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<AgentSession> {
    Ok(AgentSession {
        id: SessionId::new(row.get::<_, String>("id")?),
        workspace_id: WorkspaceId::new(row.get::<_, String>("workspace_id")?),
        status: parse_col(row, "status")?,
        label: row.get("label")?,
        instruction: row.get("instruction")?,
        created_at: time_col(row, "created_at")?,
        started_at: opt_time_col(row, "started_at")?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_run(&self, run: &TaskRun) -> Result<(), StoreError> {
        let depends_on = serde_json::to_string(&run.depends_on)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO task_runs (
                    id, status, execution_step, execution_step_ord, node_id, workspace_id,
                    agent_session_id, instruction, repository, branch, preferred_node_id,
                    node_size, node_location, depends_on, created_at, updated_at, started_at,
                    completed_at, error_message, output_summary, output_branch,
                    auto_provisioned_node, attempt
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                          ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
                params![
                    run.id.as_str(),
                    run.status.as_str(),
                    run.execution_step.map(|s| s.as_str()),
                    run.execution_step.map(|s| s.ordinal() as i64),
                    run.node_id.as_ref().map(|id| id.as_str()),
                    run.workspace_id.as_ref().map(|id| id.as_str()),
                    run.agent_session_id.as_ref().map(|id| id.as_str()),
                    run.instruction,
                    run.repository,
                    run.branch,
                    run.preferred_node_id.as_ref().map(|id| id.as_str()),
                    run.node_size,
                    run.node_location,
                    depends_on,
                    to_ms(run.created_at),
                    to_ms(run.updated_at),
                    run.started_at.map(to_ms),
                    run.completed_at.map(to_ms),
                    run.error_message,
                    run.output_summary,
                    run.output_branch,
                    run.auto_provisioned_node,
                    run.attempt,
                ],
            )
            .map_err(|e| map_insert_error(e, run.id.as_str()))?;
            Ok(())
        })
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<TaskRun>, StoreError> {
        self.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM task_runs WHERE id = ?1",
                    [id.as_str()],
                    row_to_run,
                )
                .optional()?)
        })
    }

    async fn list_runs(&self, statuses: &[RunStatus]) -> Result<Vec<TaskRun>, StoreError> {
        let sql = if statuses.is_empty() {
            "SELECT * FROM task_runs ORDER BY created_at".to_string()
        } else {
            format!(
                "SELECT * FROM task_runs WHERE status IN ({}) ORDER BY created_at",
                in_list(statuses.iter().map(|s| s.as_str()))
            )
        };
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let runs = stmt
                .query_map([], row_to_run)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(runs)
        })
    }

    async fn update_run(
        &self,
        id: &RunId,
        expected: &[RunStatus],
        patch: RunPatch,
    ) -> Result<bool, StoreError> {
        self.cas_run(id, None, expected, patch)
    }

    async fn update_run_attempt(
        &self,
        id: &RunId,
        attempt: u32,
        expected: &[RunStatus],
        patch: RunPatch,
    ) -> Result<bool, StoreError> {
        self.cas_run(id, Some(attempt), expected, patch)
    }

    async fn reset_run_for_retry(&self, id: &RunId) -> Result<bool, StoreError> {
        self.with_connection(|conn| {
            let affected = conn.execute(
                "UPDATE task_runs SET
                    status = 'ready',
                    execution_step = NULL,
                    execution_step_ord = NULL,
                    node_id = NULL,
                    workspace_id = NULL,
                    agent_session_id = NULL,
                    auto_provisioned_node = 0,
                    started_at = NULL,
                    completed_at = NULL,
                    error_message = NULL,
                    output_summary = NULL,
                    output_branch = NULL,
                    attempt = attempt + 1,
                    updated_at = ?1
                 WHERE id = ?2 AND status IN ('failed', 'cancelled')",
                params![to_ms(Utc::now()), id.as_str()],
            )?;
            Ok(affected == 1)
        })
    }

    async fn insert_node(&self, node: &Node) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO nodes (
                    id, status, phase, address, instance_id, size, location,
                    active_workspaces, max_workspaces, last_heartbeat, auto_provisioned,
                    created_at, updated_at, warm_since
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    node.id.as_str(),
                    node.status.as_str(),
                    node.phase.as_str(),
                    node.address,
                    node.instance_id,
                    node.size,
                    node.location,
                    node.active_workspaces,
                    node.max_workspaces,
                    node.last_heartbeat.map(to_ms),
                    node.auto_provisioned,
                    to_ms(node.created_at),
                    to_ms(node.updated_at),
                    node.warm_since.map(to_ms),
                ],
            )
            .map_err(|e| map_insert_error(e, node.id.as_str()))?;
            Ok(())
        })
    }

    async fn get_node(&self, id: &NodeId) -> Result<Option<Node>, StoreError> {
        self.with_connection(|conn| {
            Ok(conn
                .query_row("SELECT * FROM nodes WHERE id = ?1", [id.as_str()], row_to_node)
                .optional()?)
        })
    }

    async fn list_nodes(&self, phase: Option<LifecyclePhase>) -> Result<Vec<Node>, StoreError> {
        self.with_connection(|conn| {
            let nodes = match phase {
                Some(phase) => {
                    let mut stmt = conn
                        .prepare("SELECT * FROM nodes WHERE phase = ?1 ORDER BY created_at")?;
                    let rows = stmt.query_map([phase.as_str()], row_to_node)?;
                    rows.collect::<Result<Vec<_>, _>>()?
                }
                None => {
                    let mut stmt = conn.prepare("SELECT * FROM nodes ORDER BY created_at")?;
                    let rows = stmt.query_map([], row_to_node)?;
                    rows.collect::<Result<Vec<_>, _>>()?
                }
            };
            Ok(nodes)
        })
    }

    async fn update_node(
        &self,
        id: &NodeId,
        condition: NodeCondition<'_>,
        patch: NodePatch,
    ) -> Result<bool, StoreError> {
        let mut sql = String::from(
            "UPDATE nodes SET
                status = COALESCE(?1, status),
                phase = COALESCE(?2, phase),
                address = COALESCE(?3, address),
                instance_id = COALESCE(?4, instance_id),
                last_heartbeat = COALESCE(?5, last_heartbeat),
                warm_since = CASE WHEN ?6 THEN ?7 ELSE warm_since END,
                updated_at = ?8
             WHERE id = ?9",
        );
        if !condition.phases.is_empty() {
            sql.push_str(&format!(
                " AND phase IN ({})",
                in_list(condition.phases.iter().map(|p| p.as_str()))
            ));
        }
        if condition.idle_only {
            sql.push_str(" AND active_workspaces = 0");
        }
        self.with_connection(|conn| {
            let affected = conn.execute(
                &sql,
                params![
                    patch.status.map(|s| s.as_str()),
                    patch.phase.map(|p| p.as_str()),
                    patch.address,
                    patch.instance_id,
                    patch.last_heartbeat.map(to_ms),
                    patch.warm_since.is_some(),
                    patch.warm_since.flatten().map(to_ms),
                    to_ms(Utc::now()),
                    id.as_str(),
                ],
            )?;
            Ok(affected == 1)
        })
    }

    async fn reserve_node_slot(&self, id: &NodeId) -> Result<bool, StoreError> {
        self.with_connection(|conn| {
            let affected = conn.execute(
                "UPDATE nodes SET active_workspaces = active_workspaces + 1, updated_at = ?1
                 WHERE id = ?2
                   AND status = 'running'
                   AND phase = 'active'
                   AND active_workspaces < max_workspaces",
                params![to_ms(Utc::now()), id.as_str()],
            )?;
            Ok(affected == 1)
        })
    }

    async fn release_node_slot(&self, id: &NodeId) -> Result<Option<u32>, StoreError> {
        self.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "UPDATE nodes
                     SET active_workspaces = MAX(active_workspaces - 1, 0), updated_at = ?1
                     WHERE id = ?2
                     RETURNING active_workspaces",
                    params![to_ms(Utc::now()), id.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    async fn delete_node(&self, id: &NodeId) -> Result<bool, StoreError> {
        self.with_connection(|conn| {
            let affected = conn.execute("DELETE FROM nodes WHERE id = ?1", [id.as_str()])?;
            Ok(affected == 1)
        })
    }

    async fn insert_workspace(&self, workspace: &Workspace) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO workspaces (
                    id, node_id, run_id, status, repository, branch, ready_at, error_message,
                    callback_token_hash, callback_token_expires_at, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    workspace.id.as_str(),
                    workspace.node_id.as_str(),
                    workspace.run_id.as_str(),
                    workspace.status.as_str(),
                    workspace.repository,
                    workspace.branch,
                    workspace.ready_at.map(to_ms),
                    workspace.error_message,
                    workspace.callback_token_hash,
                    workspace.callback_token_expires_at.map(to_ms),
                    to_ms(workspace.created_at),
                    to_ms(workspace.updated_at),
                ],
            )
            .map_err(|e| map_insert_error(e, workspace.id.as_str()))?;
            Ok(())
        })
    }

    async fn get_workspace(&self, id: &WorkspaceId) -> Result<Option<Workspace>, StoreError> {
        self.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM workspaces WHERE id = ?1",
                    [id.as_str()],
                    row_to_workspace,
                )
                .optional()?)
        })
    }

    async fn list_workspaces(
        &self,
        status: Option<WorkspaceStatus>,
    ) -> Result<Vec<Workspace>, StoreError> {
        self.with_connection(|conn| {
            let workspaces = match status {
                Some(status) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM workspaces WHERE status = ?1 ORDER BY created_at",
                    )?;
                    let rows = stmt.query_map([status.as_str()], row_to_workspace)?;
                    rows.collect::<Result<Vec<_>, _>>()?
                }
                None => {
                    let mut stmt = conn.prepare("SELECT * FROM workspaces ORDER BY created_at")?;
                    let rows = stmt.query_map([], row_to_workspace)?;
                    rows.collect::<Result<Vec<_>, _>>()?
                }
            };
            Ok(workspaces)
        })
    }

    async fn update_workspace(
        &self,
        id: &WorkspaceId,
        expected: &[WorkspaceStatus],
        patch: WorkspacePatch,
    ) -> Result<bool, StoreError> {
        if expected.is_empty() {
            return Ok(false);
        }
        let sql = format!(
            "UPDATE workspaces SET
                status = COALESCE(?1, status),
                ready_at = COALESCE(?2, ready_at),
                error_message = COALESCE(?3, error_message),
                callback_token_hash = COALESCE(?4, callback_token_hash),
                callback_token_expires_at = COALESCE(?5, callback_token_expires_at),
                updated_at = ?6
             WHERE id = ?7 AND status IN ({})",
            in_list(expected.iter().map(|s| s.as_str()))
        );
        self.with_connection(|conn| {
            let affected = conn.execute(
                &sql,
                params![
                    patch.status.map(|s| s.as_str()),
                    patch.ready_at.map(to_ms),
                    patch.error_message,
                    patch.callback_token_hash,
                    patch.callback_token_expires_at.map(to_ms),
                    to_ms(Utc::now()),
                    id.as_str(),
                ],
            )?;
            Ok(affected == 1)
        })
    }

    async fn insert_session(&self, session: &AgentSession) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO agent_sessions (
                    id, workspace_id, status, label, instruction, created_at, started_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    session.id.as_str(),
                    session.workspace_id.as_str(),
                    session.status.as_str(),
                    session.label,
                    session.instruction,
                    to_ms(session.created_at),
                    session.started_at.map(to_ms),
                ],
            )
            .map_err(|e| map_insert_error(e, session.id.as_str()))?;
            Ok(())
        })
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<AgentSession>, StoreError> {
        self.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM agent_sessions WHERE id = ?1",
                    [id.as_str()],
                    row_to_session,
                )
                .optional()?)
        })
    }

    async fn update_session(
        &self,
        id: &SessionId,
        expected: &[SessionStatus],
        patch: SessionPatch,
    ) -> Result<bool, StoreError> {
        if expected.is_empty() {
            return Ok(false);
        }
        let sql = format!(
            "UPDATE agent_sessions SET
                status = COALESCE(?1, status),
                started_at = COALESCE(?2, started_at)
             WHERE id = ?3 AND status IN ({})",
            in_list(expected.iter().map(|s| s.as_str()))
        );
        self.with_connection(|conn| {
            let affected = conn.execute(
                &sql,
                params![
                    patch.status.map(|s| s.as_str()),
                    patch.started_at.map(to_ms),
                    id.as_str(),
                ],
            )?;
            Ok(affected == 1)
        })
    }
}
