//! SQLite-based state store for the node agent.

use std::path::Path;

use convoy_id::{ContainerId, NodeId, ServiceId, Slot, TaskId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid state: {0}")]
    Invalid(String),
}

/// Task lifecycle phase on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    /// Assignment accepted.
    Accepted,
    /// Bindings being materialized, container being created.
    Starting,
    Running,
    /// Stop requested, waiting for the container to exit.
    Stopping,
    /// Container exited.
    Exited,
    /// Container could not be started or was lost.
    Failed,
}

impl TaskPhase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Exited => "exited",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "accepted" => Some(Self::Accepted),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "exited" => Some(Self::Exited),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Failed)
    }
}

/// Node-level state.
#[derive(Debug, Clone, Default)]
pub struct NodeState {
    pub node_id: Option<NodeId>,
    /// Last heartbeat sent (Unix seconds).
    pub last_heartbeat: i64,
}

/// One task as recorded on the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub service_id: ServiceId,
    pub slot: Slot,
    pub phase: TaskPhase,
    pub container_id: Option<ContainerId>,
    pub exit_code: Option<i32>,
    /// Unix seconds.
    pub created_at: i64,
    pub updated_at: i64,
}

const TASK_COLUMNS: &str =
    "task_id, service_id, slot, phase, container_id, exit_code, created_at, updated_at";

fn parse_column<T: std::str::FromStr>(row: &Row<'_>, index: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    raw.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            format!("unparseable value '{raw}'").into(),
        )
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let phase: String = row.get(3)?;
    let container_id: Option<String> = row.get(4)?;
    let slot: i64 = row.get(2)?;

    Ok(TaskRecord {
        task_id: parse_column(row, 0)?,
        service_id: parse_column(row, 1)?,
        slot: Slot::new(slot.max(0) as u64),
        phase: TaskPhase::parse(&phase).unwrap_or(TaskPhase::Failed),
        container_id: container_id.and_then(|id| id.parse().ok()),
        exit_code: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// SQLite state store.
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS node_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                node_id TEXT,
                last_heartbeat INTEGER NOT NULL DEFAULT 0
            );

            INSERT OR IGNORE INTO node_state (id) VALUES (1);

            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                service_id TEXT NOT NULL,
                slot INTEGER NOT NULL,
                phase TEXT NOT NULL,
                container_id TEXT,
                exit_code INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_phase ON tasks(phase);
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    pub fn get_node_state(&self) -> Result<NodeState, StateStoreError> {
        let (node_id, last_heartbeat): (Option<String>, i64) = self.conn.query_row(
            "SELECT node_id, last_heartbeat FROM node_state WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let node_id = node_id
            .map(|raw| {
                raw.parse::<NodeId>()
                    .map_err(|e| StateStoreError::Invalid(format!("stored node ID: {e}")))
            })
            .transpose()?;

        Ok(NodeState {
            node_id,
            last_heartbeat,
        })
    }

    pub fn set_node_id(&self, node_id: &NodeId) -> Result<(), StateStoreError> {
        self.conn.execute(
            "UPDATE node_state SET node_id = ?1 WHERE id = 1",
            params![node_id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_last_heartbeat(&self, at: i64) -> Result<(), StateStoreError> {
        self.conn.execute(
            "UPDATE node_state SET last_heartbeat = ?1 WHERE id = 1",
            params![at],
        )?;
        Ok(())
    }

    pub fn get_task(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, StateStoreError> {
        self.conn
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"),
                params![task_id.to_string()],
                task_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Insert or update a task record.
    pub fn upsert_task(&self, record: &TaskRecord) -> Result<(), StateStoreError> {
        self.conn.execute(
            r#"
            INSERT INTO tasks (task_id, service_id, slot, phase, container_id, exit_code, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(task_id) DO UPDATE SET
                phase = excluded.phase,
                container_id = excluded.container_id,
                exit_code = excluded.exit_code,
                updated_at = excluded.updated_at
            "#,
            params![
                record.task_id.to_string(),
                record.service_id.to_string(),
                record.slot.value() as i64,
                record.phase.as_str(),
                record.container_id.map(|id| id.to_string()),
                record.exit_code,
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Move a task to `phase`. Unset fields keep their stored value.
    pub fn set_task_phase(
        &self,
        task_id: &TaskId,
        phase: TaskPhase,
        container_id: Option<ContainerId>,
        exit_code: Option<i32>,
    ) -> Result<(), StateStoreError> {
        let now = chrono::Utc::now().timestamp();
        self.conn.execute(
            r#"
            UPDATE tasks SET
                phase = ?1,
                container_id = COALESCE(?2, container_id),
                exit_code = COALESCE(?3, exit_code),
                updated_at = ?4
            WHERE task_id = ?5
            "#,
            params![
                phase.as_str(),
                container_id.map(|id| id.to_string()),
                exit_code,
                now,
                task_id.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_task(&self, task_id: &TaskId) -> Result<(), StateStoreError> {
        self.conn.execute(
            "DELETE FROM tasks WHERE task_id = ?1",
            params![task_id.to_string()],
        )?;
        Ok(())
    }

    pub fn list_tasks(&self) -> Result<Vec<TaskRecord>, StateStoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at, task_id"))?;
        let records = stmt
            .query_map([], task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Tasks that had not finished when last recorded.
    pub fn list_unfinished_tasks(&self) -> Result<Vec<TaskRecord>, StateStoreError> {
        Ok(self
            .list_tasks()?
            .into_iter()
            .filter(|t| !t.phase.is_terminal())
            .collect())
    }

    /// Drop finished records last updated before `before` (Unix seconds).
    pub fn prune_finished(&self, before: i64) -> Result<usize, StateStoreError> {
        let removed = self.conn.execute(
            "DELETE FROM tasks WHERE phase IN ('exited', 'failed') AND updated_at < ?1",
            params![before],
        )?;
        Ok(removed)
    }
}
