//! The task orchestrator: the entry point triggered by the control plane.
//!
//! `run(task_id)` loads the Task (and its Template), writes a fresh
//! `running` Execution, launches the pipeline job in the background, and
//! returns the execution id immediately. Jobs emit a terminal event when
//! they finish; a single writer task consumes those events and performs
//! the one-and-only terminal write on the Execution (and the matching
//! Task transition), which breaks the lifecycle cycle between the
//! orchestrator and its executions.

pub mod control_plane;
pub mod model;

pub use control_plane::{ControlPlane, ControlPlaneError};
pub use model::{ExecutionRecord, ExecutionStatus, SyncMode, Task, TaskStatus, Template};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cluster::{ClusterError, ClusterExecutor};
use crate::config::{ConfigError, CoreConfig};
use crate::error::RegistryError;
use crate::ingest::{self, IngestError};
use crate::operator::OperatorRegistry;
use crate::runner::{
    DispatcherConfig, OperatorRunner, PipelineSpec, RunStats, SampleDispatcher,
};
use crate::store::{ResultStore, StoreError};

/// Poll interval while waiting for an execution to become terminal.
const TERMINAL_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Control-plane database error.
    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    /// Pipeline construction error.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The task's config blob failed to parse.
    #[error("Invalid pipeline config: {0}")]
    InvalidPipelineSpec(#[from] serde_json::Error),

    /// Ingest error.
    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    /// Result store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Cluster backend error.
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// The execution did not reach a terminal status within the wait.
    #[error("Execution {0} still running after wait")]
    AwaitTimeout(Uuid),
}

/// Where an execution's pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPath {
    /// The in-process operator runner.
    InProcess,
    /// The external cluster backend.
    Cluster,
}

impl std::fmt::Display for DispatchPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchPath::InProcess => write!(f, "in_process"),
            DispatchPath::Cluster => write!(f, "cluster"),
        }
    }
}

/// Terminal event a pipeline job emits toward the single writer.
struct JobEvent {
    execution_id: Uuid,
    task_id: Uuid,
    terminal: ExecutionStatus,
    stats: Option<RunStats>,
}

/// The orchestrator: owner of Tasks and Executions.
pub struct TaskOrchestrator {
    config: CoreConfig,
    control_plane: Arc<ControlPlane>,
    cluster: Option<Arc<ClusterExecutor>>,
    registry: Arc<OperatorRegistry>,
    cancels: Arc<Mutex<HashMap<Uuid, watch::Sender<bool>>>>,
    events_tx: mpsc::UnboundedSender<JobEvent>,
    _writer: JoinHandle<()>,
}

impl TaskOrchestrator {
    /// Creates an orchestrator with the built-in operator registry.
    pub async fn new(config: CoreConfig) -> Result<Self, OrchestratorError> {
        Self::with_registry(config, Arc::new(OperatorRegistry::builtin())).await
    }

    /// Creates an orchestrator with a caller-supplied registry.
    pub async fn with_registry(
        config: CoreConfig,
        registry: Arc<OperatorRegistry>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let control_plane = Arc::new(ControlPlane::connect(&config.control_plane_path).await?);
        let cluster = match &config.cluster_base_url {
            Some(url) => Some(Arc::new(ClusterExecutor::new(url)?)),
            None => None,
        };

        let cancels: Arc<Mutex<HashMap<Uuid, watch::Sender<bool>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(terminal_writer(
            Arc::clone(&control_plane),
            Arc::clone(&cancels),
            events_rx,
        ));

        Ok(Self {
            config,
            control_plane,
            cluster,
            registry,
            cancels,
            events_tx,
            _writer: writer,
        })
    }

    /// The control plane this orchestrator writes to.
    pub fn control_plane(&self) -> &Arc<ControlPlane> {
        &self.control_plane
    }

    /// The active configuration.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Triggers one run of a task.
    ///
    /// Returns the fresh execution id as soon as the Execution row is
    /// written; the pipeline advances on background workers. Construction
    /// and runtime faults inside the job mark the Execution `failed`
    /// without this call raising.
    pub async fn run(&self, task_id: Uuid) -> Result<Uuid, OrchestratorError> {
        let task = self.control_plane.get_task(task_id).await?;

        let mut execution = ExecutionRecord::start(&task, "");
        execution.log_path = self
            .config
            .flow_root
            .join(format!("{}.log", execution.id))
            .to_string_lossy()
            .into_owned();
        self.control_plane.record_dispatch(&execution).await?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut cancels = self.cancels.lock().expect("cancel map poisoned");
            cancels.insert(execution.id, cancel_tx);
        }

        let path = self.choose_dispatch(&task);
        let timeout = if task.timeout_seconds > 0 {
            Duration::from_secs(task.timeout_seconds as u64)
        } else {
            self.config.default_timeout
        };
        info!(
            task_id = %task.id,
            execution_id = %execution.id,
            dispatch = %path,
            timeout_secs = timeout.as_secs(),
            "Scheduling execution"
        );

        let job = JobContext {
            flow_root: self.config.flow_root.clone(),
            max_concurrent_samples: self.config.max_concurrent_samples,
            control_plane: Arc::clone(&self.control_plane),
            cluster: self.cluster.clone(),
            registry: Arc::clone(&self.registry),
            task,
            execution_id: execution.id,
            path,
            cancel_rx,
        };
        let events_tx = self.events_tx.clone();
        let execution_id = execution.id;
        let task_id = job.task.id;

        tokio::spawn(async move {
            let (terminal, stats) = match tokio::time::timeout(timeout, run_job(job)).await {
                Ok(Ok((terminal, stats))) => (terminal, stats),
                Ok(Err(e)) => {
                    error!(execution_id = %execution_id, error = %e, "Pipeline job failed");
                    (ExecutionStatus::Failed, None)
                }
                Err(_) => {
                    warn!(
                        execution_id = %execution_id,
                        timeout_secs = timeout.as_secs(),
                        "Execution timed out"
                    );
                    (ExecutionStatus::Failed, None)
                }
            };
            // The writer task owns every terminal write.
            let _ = events_tx.send(JobEvent {
                execution_id,
                task_id,
                terminal,
                stats,
            });
        });

        Ok(execution_id)
    }

    /// Requests cooperative cancellation of a running execution.
    ///
    /// Returns `false` if the execution has no in-flight job.
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        let cancels = self.cancels.lock().expect("cancel map poisoned");
        match cancels.get(&execution_id) {
            Some(tx) => tx.send(true).is_ok(),
            None => false,
        }
    }

    /// Polls the control plane until the execution reaches a terminal
    /// status, or the wait elapses.
    pub async fn await_terminal(
        &self,
        execution_id: Uuid,
        wait: Duration,
    ) -> Result<ExecutionRecord, OrchestratorError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let execution = self.control_plane.get_execution(execution_id).await?;
            if execution.status.is_terminal() {
                return Ok(execution);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OrchestratorError::AwaitTimeout(execution_id));
            }
            tokio::time::sleep(TERMINAL_POLL_INTERVAL).await;
        }
    }

    /// Reads result rows for the given executions from their stores.
    pub async fn query_results(
        &self,
        execution_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<crate::store::ResultRow>>, OrchestratorError> {
        Ok(ResultStore::query(&self.config.flow_root, execution_ids).await?)
    }

    /// Chooses the dispatch path for a task.
    ///
    /// Once-mode jobs go to the cluster when a backend is configured;
    /// scheduled jobs run in process.
    fn choose_dispatch(&self, task: &Task) -> DispatchPath {
        if self.cluster.is_some() && task.sync_mode == SyncMode::Once {
            DispatchPath::Cluster
        } else {
            DispatchPath::InProcess
        }
    }
}

/// Everything a background pipeline job needs.
struct JobContext {
    flow_root: PathBuf,
    max_concurrent_samples: usize,
    control_plane: Arc<ControlPlane>,
    cluster: Option<Arc<ClusterExecutor>>,
    registry: Arc<OperatorRegistry>,
    task: Task,
    execution_id: Uuid,
    path: DispatchPath,
    cancel_rx: watch::Receiver<bool>,
}

/// Resolves the pipeline spec: the task's own config blob, falling back
/// to its template.
async fn resolve_spec(job: &JobContext) -> Result<PipelineSpec, OrchestratorError> {
    let spec = job.task.pipeline_spec()?;
    if !spec.is_empty() {
        return Ok(spec);
    }
    if let Some(template_id) = job.task.template_id {
        let template = job.control_plane.get_template(template_id).await?;
        return Ok(template.pipeline_spec()?);
    }
    Ok(spec)
}

/// Runs one pipeline job to its terminal status.
async fn run_job(
    mut job: JobContext,
) -> Result<(ExecutionStatus, Option<RunStats>), OrchestratorError> {
    let spec = resolve_spec(&job).await?;
    let samples = ingest::scan_source_dir(job.execution_id, &job.task.source_path, &job.task.export_path)?;

    match job.path {
        DispatchPath::InProcess => {
            let store = ResultStore::open(&job.flow_root, job.execution_id).await?;
            let runner = OperatorRunner::from_spec(&job.registry, &spec)?;
            let dispatcher =
                SampleDispatcher::new(DispatcherConfig::new(job.max_concurrent_samples));
            let stats = dispatcher
                .run_all(&runner, &store, samples, &job.cancel_rx)
                .await?;

            let terminal = if *job.cancel_rx.borrow_and_update() {
                ExecutionStatus::Canceled
            } else {
                ExecutionStatus::Succeeded
            };
            Ok((terminal, Some(stats)))
        }
        DispatchPath::Cluster => {
            let cluster = job
                .cluster
                .as_ref()
                .expect("cluster dispatch chosen without a backend");
            let execution_dir = job.flow_root.join(job.execution_id.to_string());
            cluster
                .dispatch(&samples, &execution_dir, &job.task.export_path, &spec)
                .await?;
            Ok((ExecutionStatus::Succeeded, None))
        }
    }
}

/// The single writer of terminal statuses.
async fn terminal_writer(
    control_plane: Arc<ControlPlane>,
    cancels: Arc<Mutex<HashMap<Uuid, watch::Sender<bool>>>>,
    mut events_rx: mpsc::UnboundedReceiver<JobEvent>,
) {
    while let Some(event) = events_rx.recv().await {
        match control_plane
            .finish_execution(event.execution_id, event.terminal)
            .await
        {
            Ok(true) => {
                if let Err(e) = control_plane
                    .update_task_status(event.task_id, event.terminal.task_status())
                    .await
                {
                    error!(
                        task_id = %event.task_id,
                        error = %e,
                        "Failed to write task terminal status"
                    );
                }
                match &event.stats {
                    Some(stats) => info!(
                        execution_id = %event.execution_id,
                        terminal = %event.terminal,
                        samples = stats.total,
                        succeeded = stats.succeeded,
                        failed = stats.failed,
                        canceled = stats.canceled,
                        rows = stats.rows_persisted,
                        "Execution terminal"
                    ),
                    None => info!(
                        execution_id = %event.execution_id,
                        terminal = %event.terminal,
                        "Execution terminal"
                    ),
                }
            }
            Ok(false) => {
                warn!(
                    execution_id = %event.execution_id,
                    "Terminal status already written; event dropped"
                );
            }
            Err(e) => {
                error!(
                    execution_id = %event.execution_id,
                    error = %e,
                    "Failed to write execution terminal status"
                );
            }
        }

        let mut cancels = cancels.lock().expect("cancel map poisoned");
        cancels.remove(&event.execution_id);
    }
}
