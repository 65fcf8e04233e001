//! SQLite-backed checkpoint store.
//!
//! Each record is stored as a JSON document next to the columns needed for
//! lookup (`status` for recovery scans, `sequence` for step ordering). The
//! single connection sits behind a mutex, so writers serialize, and every
//! blocking call runs on the tokio blocking pool.

use crate::store::{check_completed_immutable, sort_workflows, CheckpointStore};
use crate::types::{StepCheckpoint, WorkflowCheckpoint, WorkflowStatus};
use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflows (
    id          TEXT PRIMARY KEY,
    status      TEXT NOT NULL,
    data        TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status);

CREATE TABLE IF NOT EXISTS steps (
    workflow_id TEXT NOT NULL,
    step_name   TEXT NOT NULL,
    sequence    INTEGER NOT NULL,
    status      TEXT NOT NULL,
    data        TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (workflow_id, step_name)
);
"#;

fn storage_err(e: rusqlite::Error) -> ConductorError {
    ConductorError::Storage(e.to_string())
}

/// Durable [`CheckpointStore`] over a single SQLite file.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    /// Open (or create) the database file and initialize the schema.
    pub fn open(path: impl AsRef<Path>) -> ConductorResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(storage_err)?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(storage_err)?;
        info!(path = %path.display(), journal_mode = %mode, "Opened checkpoint database");
        Self::init(conn)
    }

    /// In-memory database, mostly for tests.
    pub fn open_in_memory() -> ConductorResult<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> ConductorResult<Self> {
        conn.execute_batch(SCHEMA).map_err(storage_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> ConductorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> ConductorResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| ConductorError::Storage(format!("Blocking task failed: {e}")))?
    }
}

fn upsert_workflow(tx: &Transaction<'_>, workflow: &WorkflowCheckpoint) -> ConductorResult<()> {
    let data = serde_json::to_string(workflow)?;
    tx.execute(
        "INSERT INTO workflows (id, status, data, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            data = excluded.data,
            updated_at = excluded.updated_at",
        params![
            workflow.workflow_id,
            workflow.status.as_str(),
            data,
            workflow.created_at.to_rfc3339(),
            workflow.updated_at.to_rfc3339(),
        ],
    )
    .map_err(storage_err)?;
    Ok(())
}

fn load_step(
    tx: &Transaction<'_>,
    workflow_id: &str,
    step_name: &str,
) -> ConductorResult<Option<StepCheckpoint>> {
    let data: Option<String> = tx
        .query_row(
            "SELECT data FROM steps WHERE workflow_id = ?1 AND step_name = ?2",
            params![workflow_id, step_name],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)?;
    data.map(|d| serde_json::from_str(&d).map_err(ConductorError::from))
        .transpose()
}

fn upsert_step(tx: &Transaction<'_>, step: &StepCheckpoint) -> ConductorResult<()> {
    let existing = load_step(tx, &step.workflow_id, &step.step_name)?;
    check_completed_immutable(existing.as_ref(), step)?;
    let data = serde_json::to_string(step)?;
    tx.execute(
        "INSERT INTO steps (workflow_id, step_name, sequence, status, data, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(workflow_id, step_name) DO UPDATE SET
            sequence = excluded.sequence,
            status = excluded.status,
            data = excluded.data,
            updated_at = excluded.updated_at",
        params![
            step.workflow_id,
            step.step_name,
            step.sequence as i64,
            step.status.as_str(),
            data,
            step.updated_at.to_rfc3339(),
        ],
    )
    .map_err(storage_err)?;
    Ok(())
}

fn parse_rows<T: serde::de::DeserializeOwned>(rows: Vec<String>) -> ConductorResult<Vec<T>> {
    rows.iter()
        .map(|d| serde_json::from_str(d).map_err(ConductorError::from))
        .collect()
}

fn query_data(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> ConductorResult<Vec<String>> {
    let mut stmt = conn.prepare(sql).map_err(storage_err)?;
    let rows = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(storage_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(storage_err)?;
    Ok(rows)
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save_workflow(&self, workflow: &WorkflowCheckpoint) -> ConductorResult<()> {
        let workflow = workflow.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(storage_err)?;
            upsert_workflow(&tx, &workflow)?;
            tx.commit().map_err(storage_err)?;
            debug!(workflow_id = %workflow.workflow_id, status = %workflow.status, "Saved workflow checkpoint");
            Ok(())
        })
        .await
    }

    async fn get_workflow(&self, workflow_id: &str) -> ConductorResult<Option<WorkflowCheckpoint>> {
        let workflow_id = workflow_id.to_string();
        self.with_conn(move |conn| {
            let rows = query_data(conn, "SELECT data FROM workflows WHERE id = ?1", &[&workflow_id])?;
            let found: Vec<WorkflowCheckpoint> = parse_rows(rows)?;
            Ok(found.into_iter().next())
        })
        .await
    }

    async fn save_step(&self, step: &StepCheckpoint) -> ConductorResult<()> {
        let step = step.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(storage_err)?;
            upsert_step(&tx, &step)?;
            tx.commit().map_err(storage_err)?;
            Ok(())
        })
        .await
    }

    async fn get_step(
        &self,
        workflow_id: &str,
        step_name: &str,
    ) -> ConductorResult<Option<StepCheckpoint>> {
        let workflow_id = workflow_id.to_string();
        let step_name = step_name.to_string();
        self.with_conn(move |conn| {
            let rows = query_data(
                conn,
                "SELECT data FROM steps WHERE workflow_id = ?1 AND step_name = ?2",
                &[&workflow_id, &step_name],
            )?;
            let found: Vec<StepCheckpoint> = parse_rows(rows)?;
            Ok(found.into_iter().next())
        })
        .await
    }

    async fn list_steps(&self, workflow_id: &str) -> ConductorResult<Vec<StepCheckpoint>> {
        let workflow_id = workflow_id.to_string();
        self.with_conn(move |conn| {
            let rows = query_data(
                conn,
                "SELECT data FROM steps WHERE workflow_id = ?1 ORDER BY sequence ASC",
                &[&workflow_id],
            )?;
            parse_rows(rows)
        })
        .await
    }

    async fn list_in_progress(&self) -> ConductorResult<Vec<WorkflowCheckpoint>> {
        self.with_conn(|conn| {
            let rows = query_data(
                conn,
                "SELECT data FROM workflows WHERE status IN (?1, ?2, ?3)",
                &[
                    &WorkflowStatus::InProgress.as_str(),
                    &WorkflowStatus::Paused.as_str(),
                    &WorkflowStatus::AwaitingApproval.as_str(),
                ],
            )?;
            let mut workflows: Vec<WorkflowCheckpoint> = parse_rows(rows)?;
            sort_workflows(&mut workflows);
            Ok(workflows)
        })
        .await
    }

    async fn list_workflows(&self) -> ConductorResult<Vec<WorkflowCheckpoint>> {
        self.with_conn(|conn| {
            let rows = query_data(conn, "SELECT data FROM workflows", &[])?;
            let mut workflows: Vec<WorkflowCheckpoint> = parse_rows(rows)?;
            sort_workflows(&mut workflows);
            Ok(workflows)
        })
        .await
    }

    async fn delete_workflow(&self, workflow_id: &str) -> ConductorResult<bool> {
        let workflow_id = workflow_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(storage_err)?;
            tx.execute("DELETE FROM steps WHERE workflow_id = ?1", params![workflow_id])
                .map_err(storage_err)?;
            let removed = tx
                .execute("DELETE FROM workflows WHERE id = ?1", params![workflow_id])
                .map_err(storage_err)?;
            tx.commit().map_err(storage_err)?;
            if removed > 0 {
                info!(workflow_id = %workflow_id, "Deleted workflow checkpoint");
            }
            Ok(removed > 0)
        })
        .await
    }

    async fn save_transition(
        &self,
        workflow: &WorkflowCheckpoint,
        step: &StepCheckpoint,
    ) -> ConductorResult<()> {
        let workflow = workflow.clone();
        let step = step.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(storage_err)?;
            upsert_step(&tx, &step)?;
            upsert_workflow(&tx, &workflow)?;
            tx.commit().map_err(storage_err)?;
            Ok(())
        })
        .await
    }
}
