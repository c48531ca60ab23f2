//! Control-plane database: tasks, executions, and templates.
//!
//! An embedded SQLite database owned by the orchestrator. Bootstrap is
//! idempotent; the terminal-status write on an execution is guarded so it
//! happens exactly once.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::model::{ExecutionRecord, ExecutionStatus, Task, TaskStatus, Template};

/// Creates the tasks table.
const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    sync_mode TEXT NOT NULL,
    cron_expression TEXT,
    config TEXT NOT NULL,
    template_id TEXT,
    source_path TEXT NOT NULL,
    export_path TEXT NOT NULL,
    status TEXT NOT NULL,
    retry_budget INTEGER NOT NULL,
    timeout_seconds INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by TEXT NOT NULL,
    updated_by TEXT NOT NULL
)
"#;

/// Creates the executions table.
const CREATE_EXECUTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    task_name TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    log_path TEXT NOT NULL
)
"#;

/// Creates the templates table.
const CREATE_TEMPLATES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS templates (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    pipeline TEXT NOT NULL
)
"#;

/// Errors that can occur during control-plane operations.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A stored record failed to parse back into its typed form.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Embedded control-plane database client.
pub struct ControlPlane {
    pool: SqlitePool,
    path: PathBuf,
}

impl ControlPlane {
    /// Opens (creating if missing) the control-plane database and
    /// bootstraps its tables.
    pub async fn connect(path: &Path) -> Result<Self, ControlPlaneError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ControlPlaneError::ConnectionFailed(e.to_string()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| ControlPlaneError::ConnectionFailed(e.to_string()))?;

        for statement in [
            CREATE_TASKS_TABLE,
            CREATE_EXECUTIONS_TABLE,
            CREATE_TEMPLATES_TABLE,
        ] {
            sqlx::query(statement).execute(&pool).await?;
        }

        debug!(path = %path.display(), "Control plane connected");
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // =========================================================================
    // Task operations
    // =========================================================================

    /// Inserts a new task.
    pub async fn create_task(&self, task: &Task) -> Result<(), ControlPlaneError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, name, description, sync_mode, cron_expression, config,
                template_id, source_path, export_path, status, retry_budget,
                timeout_seconds, created_at, updated_at, created_by, updated_by
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
        )
        .bind(task.id.to_string())
        .bind(&task.name)
        .bind(&task.description)
        .bind(task.sync_mode.to_string())
        .bind(&task.cron_expression)
        .bind(&task.config)
        .bind(task.template_id.map(|id| id.to_string()))
        .bind(task.source_path.to_string_lossy().into_owned())
        .bind(task.export_path.to_string_lossy().into_owned())
        .bind(task.status.to_string())
        .bind(task.retry_budget)
        .bind(task.timeout_seconds)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(&task.created_by)
        .bind(&task.updated_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Loads a task by id.
    pub async fn get_task(&self, id: Uuid) -> Result<Task, ControlPlaneError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ControlPlaneError::NotFound(format!("task {id}")))?;
        task_from_row(&row)
    }

    /// Updates a task's status and audit stamp.
    pub async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
    ) -> Result<(), ControlPlaneError> {
        let result = sqlx::query("UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.to_string())
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ControlPlaneError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    // =========================================================================
    // Execution operations
    // =========================================================================

    /// Inserts a new execution record.
    pub async fn create_execution(
        &self,
        execution: &ExecutionRecord,
    ) -> Result<(), ControlPlaneError> {
        sqlx::query(
            r#"
            INSERT INTO executions (id, task_id, task_name, status, started_at, log_path)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.task_id.to_string())
        .bind(&execution.task_name)
        .bind(execution.status.to_string())
        .bind(execution.started_at)
        .bind(&execution.log_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a dispatch transactionally: inserts the fresh `running`
    /// execution and moves its task to `running` in one commit.
    pub async fn record_dispatch(
        &self,
        execution: &ExecutionRecord,
    ) -> Result<(), ControlPlaneError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO executions (id, task_id, task_name, status, started_at, log_path)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(execution.task_id.to_string())
        .bind(&execution.task_name)
        .bind(execution.status.to_string())
        .bind(execution.started_at)
        .bind(&execution.log_path)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query("UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(TaskStatus::Running.to_string())
            .bind(Utc::now())
            .bind(execution.task_id.to_string())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ControlPlaneError::NotFound(format!(
                "task {}",
                execution.task_id
            )));
        }

        tx.commit().await?;
        Ok(())
    }

    /// Loads an execution by id.
    pub async fn get_execution(&self, id: Uuid) -> Result<ExecutionRecord, ControlPlaneError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ControlPlaneError::NotFound(format!("execution {id}")))?;
        execution_from_row(&row)
    }

    /// Writes an execution's terminal status.
    ///
    /// Guarded so the terminal status is written exactly once: returns
    /// `true` if this call performed the write, `false` if the execution
    /// was already terminal.
    pub async fn finish_execution(
        &self,
        id: Uuid,
        terminal: ExecutionStatus,
    ) -> Result<bool, ControlPlaneError> {
        debug_assert!(terminal.is_terminal());
        let result =
            sqlx::query("UPDATE executions SET status = ?1 WHERE id = ?2 AND status = 'running'")
                .bind(terminal.to_string())
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Lists a task's executions, most recent first.
    pub async fn list_executions(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<ExecutionRecord>, ControlPlaneError> {
        let rows =
            sqlx::query("SELECT * FROM executions WHERE task_id = ?1 ORDER BY started_at DESC")
                .bind(task_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(execution_from_row).collect()
    }

    // =========================================================================
    // Template operations
    // =========================================================================

    /// Inserts or replaces a template.
    pub async fn upsert_template(&self, template: &Template) -> Result<(), ControlPlaneError> {
        sqlx::query(
            r#"
            INSERT INTO templates (id, name, pipeline) VALUES (?1, ?2, ?3)
            ON CONFLICT (id) DO UPDATE SET name = excluded.name, pipeline = excluded.pipeline
            "#,
        )
        .bind(template.id.to_string())
        .bind(&template.name)
        .bind(&template.pipeline)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Loads a template by id.
    pub async fn get_template(&self, id: Uuid) -> Result<Template, ControlPlaneError> {
        let row = sqlx::query("SELECT id, name, pipeline FROM templates WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ControlPlaneError::NotFound(format!("template {id}")))?;

        Ok(Template {
            id: parse_uuid(row.get("id"))?,
            name: row.get("name"),
            pipeline: row.get("pipeline"),
        })
    }
}

fn parse_uuid(raw: String) -> Result<Uuid, ControlPlaneError> {
    Uuid::parse_str(&raw).map_err(|e| ControlPlaneError::Corrupt(format!("uuid '{raw}': {e}")))
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Task, ControlPlaneError> {
    let sync_mode: String = row.get("sync_mode");
    let status: String = row.get("status");
    let template_id: Option<String> = row.get("template_id");
    let source_path: String = row.get("source_path");
    let export_path: String = row.get("export_path");
    let created_at: DateTime<Utc> = row.get("created_at");
    let updated_at: DateTime<Utc> = row.get("updated_at");

    Ok(Task {
        id: parse_uuid(row.get("id"))?,
        name: row.get("name"),
        description: row.get("description"),
        sync_mode: FromStr::from_str(&sync_mode).map_err(ControlPlaneError::Corrupt)?,
        cron_expression: row.get("cron_expression"),
        config: row.get("config"),
        template_id: template_id.map(parse_uuid).transpose()?,
        source_path: source_path.into(),
        export_path: export_path.into(),
        status: FromStr::from_str(&status).map_err(ControlPlaneError::Corrupt)?,
        retry_budget: row.get("retry_budget"),
        timeout_seconds: row.get("timeout_seconds"),
        created_at,
        updated_at,
        created_by: row.get("created_by"),
        updated_by: row.get("updated_by"),
    })
}

fn execution_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ExecutionRecord, ControlPlaneError> {
    let status: String = row.get("status");
    let started_at: DateTime<Utc> = row.get("started_at");

    Ok(ExecutionRecord {
        id: parse_uuid(row.get("id"))?,
        task_id: parse_uuid(row.get("task_id"))?,
        task_name: row.get("task_name"),
        status: FromStr::from_str(&status).map_err(ControlPlaneError::Corrupt)?,
        started_at,
        log_path: row.get("log_path"),
    })
}
