//! Control-plane records: Tasks and Executions, with their status state
//! machines.
//!
//! ```text
//! Task:       pending -> running -> {succeeded, failed, canceled}
//! Execution:  running -> {succeeded, failed, canceled}
//! ```
//!
//! A Task enters `running` at dispatch and becomes terminal when its
//! Execution does. An Execution's terminal status is written exactly
//! once, by the orchestrator's single writer.

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::runner::PipelineSpec;

/// How a Task is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Run once on demand.
    Once,
    /// Run on a cron schedule.
    Scheduled,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Once => write!(f, "once"),
            SyncMode::Scheduled => write!(f, "scheduled"),
        }
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "once" => Ok(SyncMode::Once),
            "scheduled" => Ok(SyncMode::Scheduled),
            other => Err(format!("unknown sync mode '{other}'")),
        }
    }
}

/// Status of a Task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Canceled => write!(f, "canceled"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" => Ok(TaskStatus::Canceled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Status of an Execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl ExecutionStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    /// The Task status a terminal Execution maps to.
    pub fn task_status(&self) -> TaskStatus {
        match self {
            ExecutionStatus::Running => TaskStatus::Running,
            ExecutionStatus::Succeeded => TaskStatus::Succeeded,
            ExecutionStatus::Failed => TaskStatus::Failed,
            ExecutionStatus::Canceled => TaskStatus::Canceled,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Succeeded => write!(f, "succeeded"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Canceled => write!(f, "canceled"),
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ExecutionStatus::Running),
            "succeeded" => Ok(ExecutionStatus::Succeeded),
            "failed" => Ok(ExecutionStatus::Failed),
            "canceled" => Ok(ExecutionStatus::Canceled),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

/// A collection task: the control-plane record the orchestrator owns.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub sync_mode: SyncMode,
    pub cron_expression: Option<String>,
    /// Pipeline config blob: operator list plus per-operator options.
    pub config: String,
    pub template_id: Option<Uuid>,
    /// Directory the ingest stage scans.
    pub source_path: PathBuf,
    /// Destination directory for exported payloads.
    pub export_path: PathBuf,
    pub status: TaskStatus,
    pub retry_budget: i64,
    pub timeout_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_by: String,
}

impl Task {
    /// Creates a pending once-mode task with default stamps.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            sync_mode: SyncMode::Once,
            cron_expression: None,
            config: String::new(),
            template_id: None,
            source_path: PathBuf::new(),
            export_path: PathBuf::new(),
            status: TaskStatus::Pending,
            retry_budget: 0,
            timeout_seconds: 3600,
            created_at: now,
            updated_at: now,
            created_by: "system".to_string(),
            updated_by: "system".to_string(),
        }
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Sets the cron expression for scheduled tasks.
    pub fn with_cron_expression(mut self, cron: impl Into<String>) -> Self {
        self.cron_expression = Some(cron.into());
        self
    }

    /// Sets the pipeline config blob.
    pub fn with_config(mut self, config: impl Into<String>) -> Self {
        self.config = config.into();
        self
    }

    /// Sets the referenced template.
    pub fn with_template_id(mut self, template_id: Uuid) -> Self {
        self.template_id = Some(template_id);
        self
    }

    /// Sets the source directory.
    pub fn with_source_path(mut self, source_path: impl Into<PathBuf>) -> Self {
        self.source_path = source_path.into();
        self
    }

    /// Sets the export directory.
    pub fn with_export_path(mut self, export_path: impl Into<PathBuf>) -> Self {
        self.export_path = export_path.into();
        self
    }

    /// Sets the execution timeout in seconds.
    pub fn with_timeout_seconds(mut self, timeout_seconds: i64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Sets the retry budget.
    pub fn with_retry_budget(mut self, retry_budget: i64) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    /// Sets the audit actor.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        let actor = actor.into();
        self.created_by = actor.clone();
        self.updated_by = actor;
        self
    }

    /// Parses the pipeline spec out of the config blob.
    ///
    /// An empty blob parses to an empty spec so a template can supply the
    /// operator list instead.
    pub fn pipeline_spec(&self) -> Result<PipelineSpec, serde_json::Error> {
        if self.config.trim().is_empty() {
            return Ok(PipelineSpec::default());
        }
        PipelineSpec::from_json(&self.config)
    }
}

/// A single run of a Task.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub task_name: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub log_path: String,
}

impl ExecutionRecord {
    /// Creates a fresh running Execution for a Task.
    pub fn start(task: &Task, log_path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task.id,
            task_name: task.name.clone(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            log_path: log_path.into(),
        }
    }
}

/// A reusable pipeline template referenced by Tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    /// Pipeline spec JSON blob.
    pub pipeline: String,
}

impl Template {
    /// Creates a template from a pipeline spec.
    pub fn new(
        name: impl Into<String>,
        spec: &PipelineSpec,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            pipeline: serde_json::to_string(spec)?,
        })
    }

    /// Parses the template's pipeline spec.
    pub fn pipeline_spec(&self) -> Result<PipelineSpec, serde_json::Error> {
        PipelineSpec::from_json(&self.pipeline)
    }
}
