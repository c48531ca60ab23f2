//! The result store: an embedded, per-execution database durably
//! recording one row per (instance, file, child) processing outcome.
//!
//! One SQLite file per execution at `<flow-root>/<instance_id>.db`,
//! running in write-ahead-log mode. Writes ride a bounded retry loop for
//! the "database is locked" condition raised by concurrent writers on the
//! same file; reads create the table lazily so querying an execution
//! whose writer crashed before the first insert returns an empty set.

pub mod schema;

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::sample::Sample;

/// Maximum insert attempts under write contention.
pub const MAX_WRITE_ATTEMPTS: u32 = 20;

/// Delay between contended attempts.
pub const WRITE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Errors that can occur during result store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Opening the store file or bootstrapping the table failed.
    #[error("Failed to open result store: {0}")]
    Open(sqlx::Error),

    /// A write failed for a reason other than lock contention.
    #[error("Result store write failed: {0}")]
    Write(sqlx::Error),

    /// The retry budget was exhausted while the file stayed locked.
    #[error("Result store write failed after {attempts} contended attempts: {source}")]
    WriteRetriesExhausted { attempts: u32, source: sqlx::Error },

    /// A read failed.
    #[error("Result store query failed: {0}")]
    Query(sqlx::Error),

    /// Filesystem error around the store file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Retry policy for contended writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts before surfacing the failure.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_WRITE_ATTEMPTS,
            delay: WRITE_RETRY_DELAY,
        }
    }
}

/// Persisted projection of a Sample after the pipeline terminates for
/// that file.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub instance_id: Uuid,
    pub source_file_name: String,
    pub source_file_type: String,
    pub source_file_id: String,
    pub source_file_size: i64,
    pub file_id: String,
    pub file_size: i64,
    pub file_type: String,
    pub file_name: String,
    pub file_path: String,
    pub source_file_modify_time: DateTime<Utc>,
    pub status: i64,
    pub operator_id: Option<String>,
    pub error_code: Option<i64>,
    pub incremental: bool,
    pub child_id: Option<String>,
    pub slice_num: Option<i64>,
}

impl ResultRow {
    /// Projects a terminated Sample into its persisted form.
    pub fn from_sample(sample: &Sample) -> Self {
        Self {
            instance_id: sample.instance_id,
            source_file_name: sample.source.name.clone(),
            source_file_type: sample.source.file_type.clone(),
            source_file_id: sample.source.id.clone(),
            source_file_size: sample.source.size,
            file_id: sample.file.id.clone(),
            file_size: sample.file.size,
            file_type: sample.file.file_type.clone(),
            file_name: sample.file.name.clone(),
            file_path: sample.file.path.to_string_lossy().into_owned(),
            source_file_modify_time: sample.source.modify_time,
            status: sample.execute_status(),
            operator_id: sample.failed_reason().map(|f| f.operator.clone()),
            error_code: sample.failed_reason().map(|f| f.code),
            incremental: sample.incremental,
            child_id: sample.child_id.clone(),
            slice_num: sample.slice_num.map(i64::from),
        }
    }
}

/// Handle on one execution's store file.
pub struct ResultStore {
    pool: SqlitePool,
    path: PathBuf,
    instance_id: Uuid,
    retry: RetryPolicy,
}

impl ResultStore {
    /// Store file path for an execution.
    pub fn store_path(flow_root: &Path, instance_id: Uuid) -> PathBuf {
        flow_root.join(format!("{}.db", instance_id))
    }

    /// Opens (creating if missing) the store for one execution and
    /// bootstraps the table.
    pub async fn open(flow_root: &Path, instance_id: Uuid) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(flow_root).await?;
        let path = Self::store_path(flow_root, instance_id);

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            // The store runs its own retry loop on lock contention.
            .busy_timeout(Duration::from_millis(100));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(StoreError::Open)?;

        for statement in schema::bootstrap_statements() {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(StoreError::Open)?;
        }

        debug!(instance_id = %instance_id, path = %path.display(), "Opened result store");
        Ok(Self {
            pool,
            path,
            instance_id,
            retry: RetryPolicy::default(),
        })
    }

    /// Overrides the contention retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Path of the underlying store file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Execution this store belongs to.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Inserts a row derived from the Sample.
    ///
    /// Append-only: updates are never issued on an existing
    /// (instance, file, child) triple; duplicate inserts are a programming
    /// error upstream and are not deduplicated here.
    pub async fn persist(&self, sample: &Sample) -> Result<(), StoreError> {
        let row = ResultRow::from_sample(sample);
        self.persist_row(&row).await
    }

    /// Inserts an already-projected row with retry on lock contention.
    pub async fn persist_row(&self, row: &ResultRow) -> Result<(), StoreError> {
        retry_locked(&self.retry, || {
            let pool = self.pool.clone();
            async move {
                sqlx::query(schema::INSERT_RESULT)
                    .bind(row.instance_id.to_string())
                    .bind(&row.source_file_name)
                    .bind(&row.source_file_type)
                    .bind(&row.source_file_id)
                    .bind(row.source_file_size)
                    .bind(&row.file_id)
                    .bind(row.file_size)
                    .bind(&row.file_type)
                    .bind(&row.file_name)
                    .bind(&row.file_path)
                    .bind(row.source_file_modify_time)
                    .bind(row.status)
                    .bind(&row.operator_id)
                    .bind(row.error_code)
                    .bind(row.incremental)
                    .bind(&row.child_id)
                    .bind(row.slice_num)
                    .execute(&pool)
                    .await
                    .map(|_| ())
            }
        })
        .await
    }

    /// Reads all rows of this execution.
    pub async fn rows(&self) -> Result<Vec<ResultRow>, StoreError> {
        let rows = sqlx::query(schema::SELECT_RESULTS)
            .bind(self.instance_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Query)?;

        rows.iter().map(row_from_sqlite).collect()
    }

    /// Reads current rows for the given executions.
    ///
    /// Opening a store bootstraps its table, so an execution whose writer
    /// crashed before the first insert maps to an empty set.
    pub async fn query(
        flow_root: &Path,
        instance_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<ResultRow>>, StoreError> {
        let mut results = HashMap::with_capacity(instance_ids.len());
        for &instance_id in instance_ids {
            let store = Self::open(flow_root, instance_id).await?;
            results.insert(instance_id, store.rows().await?);
        }
        Ok(results)
    }

    /// Best-effort deletion of an execution's store file.
    ///
    /// Failure is logged, not raised.
    pub async fn drop_store(flow_root: &Path, instance_id: Uuid) {
        let base = Self::store_path(flow_root, instance_id);
        let wal = base.with_extension("db-wal");
        let shm = base.with_extension("db-shm");
        for path in [base, wal, shm] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete store file");
                }
            }
        }
    }
}

/// Runs `op` until it succeeds, the error is not lock contention, or the
/// retry budget runs out.
pub(crate) async fn retry_locked<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_locked(&err) => {
                if attempt >= policy.max_attempts {
                    return Err(StoreError::WriteRetriesExhausted {
                        attempts: attempt,
                        source: err,
                    });
                }
                warn!(
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    "Result store locked, retrying"
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(err) => return Err(StoreError::Write(err)),
        }
    }
}

/// Whether an error is the transient "database is locked" condition.
fn is_locked(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message();
            message.contains("database is locked") || message.contains("database table is locked")
        }
        _ => false,
    }
}

fn row_from_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<ResultRow, StoreError> {
    let instance_id: String = row.get("instance_id");
    let instance_id = Uuid::parse_str(&instance_id)
        .map_err(|e| StoreError::Query(sqlx::Error::Decode(Box::new(e))))?;

    Ok(ResultRow {
        instance_id,
        source_file_name: row.get("source_file_name"),
        source_file_type: row.get("source_file_type"),
        source_file_id: row.get("source_file_id"),
        source_file_size: row.get("source_file_size"),
        file_id: row.get("file_id"),
        file_size: row.get("file_size"),
        file_type: row.get("file_type"),
        file_name: row.get("file_name"),
        file_path: row.get("file_path"),
        source_file_modify_time: row.get("source_file_modify_time"),
        status: row.get("status"),
        operator_id: row.get("operator_id"),
        error_code: row.get("error_code"),
        incremental: row.get("incremental"),
        child_id: row.get("child_id"),
        slice_num: row.get("slice_num"),
    })
}
