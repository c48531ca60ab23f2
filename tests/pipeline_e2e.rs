//! End-to-end tests for the pipeline execution core.
//!
//! Each test drives the public surface: orchestrator-triggered runs over
//! real source directories, per-execution result stores, and (for the
//! cluster path) a local stub backend speaking the config/run protocol.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use prepforge::config::CoreConfig;
use prepforge::error::OperatorFailure;
use prepforge::operator::{
    builtin, Operator, OperatorDescriptor, OperatorKind, OperatorOutput, OperatorRegistry,
};
use prepforge::orchestrator::{
    ExecutionStatus, SyncMode, Task, TaskOrchestrator, TaskStatus,
};
use prepforge::runner::PipelineSpec;
use prepforge::sample::{FileMeta, Sample, SourceFileMeta};
use prepforge::store::ResultStore;

/// Wait generous enough for any in-process pipeline in this suite.
const WAIT: Duration = Duration::from_secs(30);

fn pipeline_json(steps: &[(&str, serde_json::Value)]) -> String {
    let operators: Vec<serde_json::Value> = steps
        .iter()
        .map(|(name, options)| serde_json::json!({ "name": name, "options": options }))
        .collect();
    serde_json::json!({ "operators": operators }).to_string()
}

async fn orchestrator_at(flow_root: &Path) -> TaskOrchestrator {
    TaskOrchestrator::new(CoreConfig::new().with_flow_root(flow_root))
        .await
        .unwrap()
}

/// Creates, persists, and triggers a task; returns the execution id.
async fn trigger(
    orchestrator: &TaskOrchestrator,
    task: Task,
) -> (Uuid, Uuid) {
    orchestrator.control_plane().create_task(&task).await.unwrap();
    let execution_id = orchestrator.run(task.id).await.unwrap();
    (task.id, execution_id)
}

#[tokio::test]
async fn text_cleaning_pipeline_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    let export = dir.path().join("export");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("hello.txt"), "Hello 😀 世界").unwrap();

    let orchestrator = orchestrator_at(dir.path()).await;
    let task = Task::new("clean")
        .with_config(pipeline_json(&[
            ("emoji-strip", serde_json::json!({})),
            ("whitespace-normalize", serde_json::json!({})),
            ("text-export", serde_json::json!({})),
        ]))
        .with_source_path(&source)
        .with_export_path(&export);
    let (task_id, execution_id) = trigger(&orchestrator, task).await;

    let execution = orchestrator.await_terminal(execution_id, WAIT).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);

    // The task follows its execution into the terminal status.
    let task = orchestrator.control_plane().get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);

    // One row, success status; the cleaned text lives out-of-band in the
    // export directory.
    let results = orchestrator.query_results(&[execution_id]).await.unwrap();
    let rows = &results[&execution_id];
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, 0);
    assert_eq!(rows[0].operator_id, None);

    let exported = std::fs::read_to_string(export.join("hello.txt")).unwrap();
    assert_eq!(exported, "Hello 世界");
}

#[tokio::test]
async fn filter_blanks_short_payload_but_persists_row() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    let export = dir.path().join("export");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("tiny.txt"), "five!").unwrap();

    let orchestrator = orchestrator_at(dir.path()).await;
    let task = Task::new("min-length")
        .with_config(pipeline_json(&[
            ("min-length-filter", serde_json::json!({"min": 10})),
            ("text-export", serde_json::json!({})),
        ]))
        .with_source_path(&source)
        .with_export_path(&export);
    let (_, execution_id) = trigger(&orchestrator, task).await;

    let execution = orchestrator.await_terminal(execution_id, WAIT).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);

    let results = orchestrator.query_results(&[execution_id]).await.unwrap();
    let rows = &results[&execution_id];
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, 0);

    // The conceptual drop: the exported payload is blank.
    let exported = std::fs::read_to_string(export.join("tiny.txt")).unwrap();
    assert!(exported.is_empty());
}

#[tokio::test]
async fn mapper_only_pipeline_persists_one_row_per_file() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    for i in 0..6 {
        std::fs::write(source.join(format!("doc-{i}.txt")), format!("document {i}")).unwrap();
    }

    let orchestrator = orchestrator_at(dir.path()).await;
    let task = Task::new("normalize")
        .with_config(pipeline_json(&[(
            "whitespace-normalize",
            serde_json::json!({}),
        )]))
        .with_source_path(&source)
        .with_export_path(dir.path().join("export"));
    let (_, execution_id) = trigger(&orchestrator, task).await;

    orchestrator.await_terminal(execution_id, WAIT).await.unwrap();

    let results = orchestrator.query_results(&[execution_id]).await.unwrap();
    let rows = &results[&execution_id];
    assert_eq!(rows.len(), 6);
    assert!(rows.iter().all(|r| r.status == 0));

    let mut file_ids: Vec<_> = rows.iter().map(|r| r.file_id.clone()).collect();
    file_ids.sort();
    file_ids.dedup();
    assert_eq!(file_ids.len(), 6, "file ids must be distinct");
}

/// Operator standing in for a decoder that chokes on its input.
#[derive(Debug)]
struct ImageDenoise;

#[async_trait]
impl Operator for ImageDenoise {
    fn name(&self) -> &str {
        "image-denoise"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Mapper
    }

    async fn execute(&self, _sample: Sample) -> Result<OperatorOutput, OperatorFailure> {
        Err(OperatorFailure::new(2201, "image decode failed"))
    }
}

fn registry_with_image_denoise() -> Arc<OperatorRegistry> {
    let mut registry = OperatorRegistry::new();
    for descriptor in builtin::descriptors() {
        registry.register(descriptor).unwrap();
    }
    registry
        .register(OperatorDescriptor {
            name: "image-denoise",
            kind: OperatorKind::Mapper,
            factory: |_| Ok(Box::new(ImageDenoise)),
        })
        .unwrap();
    registry.freeze();
    Arc::new(registry)
}

#[tokio::test]
async fn failing_operator_records_failure_per_sample() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("broken.png"), [0xDE, 0xAD, 0xBE, 0xEF]).unwrap();

    let orchestrator = TaskOrchestrator::with_registry(
        CoreConfig::new().with_flow_root(dir.path()),
        registry_with_image_denoise(),
    )
    .await
    .unwrap();

    let task = Task::new("denoise")
        .with_config(pipeline_json(&[("image-denoise", serde_json::json!({}))]))
        .with_source_path(&source)
        .with_export_path(dir.path().join("export"));
    let (_, execution_id) = trigger(&orchestrator, task).await;

    // Per-sample failures are recorded, not fatal: the execution itself
    // succeeds.
    let execution = orchestrator.await_terminal(execution_id, WAIT).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);

    let results = orchestrator.query_results(&[execution_id]).await.unwrap();
    let rows = &results[&execution_id];
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, 1);
    assert_eq!(rows[0].operator_id.as_deref(), Some("image-denoise"));
    assert_eq!(rows[0].error_code, Some(2201));
}

#[tokio::test]
async fn segmenter_fans_out_children_with_parent_summary() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("long.txt"), "x".repeat(2_400)).unwrap();

    let orchestrator = orchestrator_at(dir.path()).await;
    let task = Task::new("segment")
        .with_config(pipeline_json(&[(
            "segmenter",
            serde_json::json!({"chunk": 800}),
        )]))
        .with_source_path(&source)
        .with_export_path(dir.path().join("export"));
    let (_, execution_id) = trigger(&orchestrator, task).await;

    orchestrator.await_terminal(execution_id, WAIT).await.unwrap();

    let results = orchestrator.query_results(&[execution_id]).await.unwrap();
    let rows = &results[&execution_id];
    // One parent summary row plus three children.
    assert_eq!(rows.len(), 4);

    let parent = rows.iter().find(|r| r.child_id.is_none()).unwrap();
    assert_eq!(parent.slice_num, Some(3));

    let children: Vec<_> = rows.iter().filter(|r| r.child_id.is_some()).collect();
    assert_eq!(children.len(), 3);
    assert!(children.iter().all(|c| c.file_id == parent.file_id));
    assert!(children.iter().all(|c| c.slice_num == Some(3)));

    let mut child_ids: Vec<_> = children.iter().map(|c| c.child_id.clone()).collect();
    child_ids.sort();
    child_ids.dedup();
    assert_eq!(child_ids.len(), 3, "child ids must be distinct");
}

/// Mapper that sleeps, leaving a window for cancellation between steps.
#[derive(Debug)]
struct SlowMapper;

#[async_trait]
impl Operator for SlowMapper {
    fn name(&self) -> &str {
        "slow-mapper"
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Mapper
    }

    async fn execute(&self, sample: Sample) -> Result<OperatorOutput, OperatorFailure> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(OperatorOutput::One(sample))
    }
}

fn registry_with_slow_mapper() -> Arc<OperatorRegistry> {
    let mut registry = OperatorRegistry::new();
    for descriptor in builtin::descriptors() {
        registry.register(descriptor).unwrap();
    }
    registry
        .register(OperatorDescriptor {
            name: "slow-mapper",
            kind: OperatorKind::Mapper,
            factory: |_| Ok(Box::new(SlowMapper)),
        })
        .unwrap();
    registry.freeze();
    Arc::new(registry)
}

#[tokio::test]
async fn cancellation_marks_execution_canceled() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("doc.txt"), "payload").unwrap();

    let orchestrator = TaskOrchestrator::with_registry(
        CoreConfig::new().with_flow_root(dir.path()),
        registry_with_slow_mapper(),
    )
    .await
    .unwrap();

    let task = Task::new("cancelable")
        .with_config(pipeline_json(&[
            ("slow-mapper", serde_json::json!({})),
            ("slow-mapper", serde_json::json!({})),
        ]))
        .with_source_path(&source)
        .with_export_path(dir.path().join("export"));
    let (task_id, execution_id) = trigger(&orchestrator, task).await;

    // Cancel while the first slow step is in flight.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(orchestrator.cancel(execution_id));

    let execution = orchestrator.await_terminal(execution_id, WAIT).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Canceled);

    let task = orchestrator.control_plane().get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);

    // The in-flight Sample was stamped canceled between operators.
    let results = orchestrator.query_results(&[execution_id]).await.unwrap();
    let rows = &results[&execution_id];
    assert_eq!(rows.len(), 1);
    assert_ne!(rows[0].status, 0);
}

#[tokio::test]
async fn timeout_fails_execution() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    for i in 0..8 {
        std::fs::write(source.join(format!("doc-{i}.txt")), "payload").unwrap();
    }

    let orchestrator = TaskOrchestrator::with_registry(
        CoreConfig::new()
            .with_flow_root(dir.path())
            .with_max_concurrent_samples(1),
        registry_with_slow_mapper(),
    )
    .await
    .unwrap();

    // Eight serialized 300 ms steps cannot finish inside one second.
    let task = Task::new("too-slow")
        .with_config(pipeline_json(&[("slow-mapper", serde_json::json!({}))]))
        .with_source_path(&source)
        .with_export_path(dir.path().join("export"))
        .with_timeout_seconds(1);
    let (task_id, execution_id) = trigger(&orchestrator, task).await;

    let execution = orchestrator
        .await_terminal(execution_id, WAIT)
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);

    let task = orchestrator.control_plane().get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
}

// =============================================================================
// Cluster backend tests against a local stub speaking the wire protocol
// =============================================================================

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Minimal HTTP stub: answers `get_init_configs` with a success envelope
/// carrying an enriched config, and `Executor/run` with the given status.
async fn spawn_backend(run_status: &'static str) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut tmp = [0u8; 4096];
                let (header_end, content_length) = loop {
                    let Ok(n) = socket.read(&mut tmp).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&tmp[..n]);
                    if let Some(pos) = find_subsequence(&buf, b"\r\n\r\n") {
                        let headers = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                        let content_length = headers
                            .lines()
                            .find_map(|line| line.strip_prefix("content-length:"))
                            .and_then(|value| value.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        break (pos + 4, content_length);
                    }
                };
                while buf.len() < header_end + content_length {
                    let Ok(n) = socket.read(&mut tmp).await else {
                        return;
                    };
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&tmp[..n]);
                }

                let request = String::from_utf8_lossy(&buf);
                let body = if request.contains("get_init_configs") {
                    r#"{"status":"success","result":{"process":[],"np":4}}"#.to_string()
                } else {
                    format!(r#"{{"status":"{run_status}"}}"#)
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    format!("http://{}", addr)
}

#[tokio::test]
async fn cluster_dispatch_succeeds_against_healthy_backend() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("doc.txt"), "cluster payload").unwrap();

    let base_url = spawn_backend("success").await;
    let orchestrator = TaskOrchestrator::new(
        CoreConfig::new()
            .with_flow_root(dir.path())
            .with_cluster_base_url(base_url),
    )
    .await
    .unwrap();

    let task = Task::new("cluster-job")
        .with_sync_mode(SyncMode::Once)
        .with_config(pipeline_json(&[("emoji-strip", serde_json::json!({}))]))
        .with_source_path(&source)
        .with_export_path(dir.path().join("export"));
    let (_, execution_id) = trigger(&orchestrator, task).await;

    let execution = orchestrator.await_terminal(execution_id, WAIT).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);

    // The record file is the dispatch's durable side effect.
    let dataset = dir
        .path()
        .join(execution_id.to_string())
        .join("dataset.jsonl");
    let content = std::fs::read_to_string(dataset).unwrap();
    assert_eq!(content.lines().count(), 1);
    assert!(content.contains("cluster payload"));
}

#[tokio::test]
async fn cluster_backend_error_fails_task() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("doc.txt"), "payload").unwrap();

    let base_url = spawn_backend("error").await;
    let orchestrator = TaskOrchestrator::new(
        CoreConfig::new()
            .with_flow_root(dir.path())
            .with_cluster_base_url(base_url),
    )
    .await
    .unwrap();

    let task = Task::new("doomed")
        .with_sync_mode(SyncMode::Once)
        .with_config(pipeline_json(&[("emoji-strip", serde_json::json!({}))]))
        .with_source_path(&source)
        .with_export_path(dir.path().join("export"));
    let (task_id, execution_id) = trigger(&orchestrator, task).await;

    let execution = orchestrator.await_terminal(execution_id, WAIT).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);

    let task = orchestrator.control_plane().get_task(task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
}

#[tokio::test]
async fn cluster_dispatch_skips_rewriting_unchanged_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    std::fs::create_dir_all(&source).unwrap();
    let doc = source.join("doc.txt");
    std::fs::write(&doc, "stable payload").unwrap();

    let base_url = spawn_backend("success").await;
    let executor = prepforge::cluster::ClusterExecutor::new(base_url).unwrap();

    let instance_id = Uuid::new_v4();
    let samples = prepforge::ingest::scan_source_dir(
        instance_id,
        &source,
        &dir.path().join("export"),
    )
    .unwrap();
    let spec = PipelineSpec::from_json(&pipeline_json(&[(
        "whitespace-normalize",
        serde_json::json!({}),
    )]))
    .unwrap();
    let execution_dir = dir.path().join(instance_id.to_string());
    let export = dir.path().join("export");

    executor
        .dispatch(&samples, &execution_dir, &export, &spec)
        .await
        .unwrap();
    let dataset = execution_dir.join("dataset.jsonl");
    let mtime_first = std::fs::metadata(&dataset).unwrap().modified().unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    executor
        .dispatch(&samples, &execution_dir, &export, &spec)
        .await
        .unwrap();
    let mtime_second = std::fs::metadata(&dataset).unwrap().modified().unwrap();

    assert_eq!(mtime_first, mtime_second, "record file must not be rewritten");
}

// =============================================================================
// Store contention
// =============================================================================

fn worker_sample(instance_id: Uuid, worker: usize) -> Sample {
    Sample::new(
        instance_id,
        SourceFileMeta {
            id: format!("src-{worker}"),
            name: format!("doc-{worker}.txt"),
            file_type: "txt".to_string(),
            size: 1,
            modify_time: Utc::now(),
        },
        FileMeta {
            id: format!("file-{worker}"),
            name: format!("doc-{worker}.txt"),
            path: format!("/in/doc-{worker}.txt").into(),
            file_type: "txt".to_string(),
            size: 1,
        },
        "/out",
    )
}

#[tokio::test]
async fn concurrent_writers_on_one_store_all_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let instance_id = Uuid::new_v4();
    let workers = 4;

    let mut handles = Vec::new();
    for worker in 0..workers {
        let flow_root = dir.path().to_path_buf();
        handles.push(tokio::spawn(async move {
            // Each worker opens its own handle on the shared file, the way
            // independent processes would.
            let store = ResultStore::open(&flow_root, instance_id).await.unwrap();
            store.persist(&worker_sample(instance_id, worker)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let results = ResultStore::query(dir.path(), &[instance_id]).await.unwrap();
    assert_eq!(results[&instance_id].len(), workers);
}
