//! The cluster executor: dispatches a whole dataset to the external
//! parallel data-processing backend.
//!
//! Protocol: materialize every Sample into a newline-delimited record
//! file under the execution directory, enrich the desired configuration
//! through the backend's `config/get_init_configs` endpoint, then submit
//! it to `core/Executor/run` and require a `success` envelope. The
//! executor is stateless between runs; the record file (plus its
//! fingerprint) is its only durable side effect.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine as _;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::runner::PipelineSpec;
use crate::sample::Sample;

/// Record file name under the execution directory.
const DATASET_FILE: &str = "dataset.jsonl";

/// Fingerprint sidecar guarding against needless rewrites.
const FINGERPRINT_FILE: &str = "dataset.jsonl.sha256";

/// Envelope status the backend reports on success.
const STATUS_SUCCESS: &str = "success";

/// Errors that can occur while dispatching to the cluster backend.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The backend answered with a non-`success` envelope.
    #[error("Cluster backend '{endpoint}' returned status '{status}'")]
    Backend { endpoint: String, status: String },

    /// The backend answered with an HTTP error code.
    #[error("Cluster backend '{endpoint}' returned HTTP {code}")]
    Http { endpoint: String, code: u16 },

    /// Transport-level fault.
    #[error("Cluster request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Dataset row or config serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error while materializing the dataset.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One materialized dataset record.
#[derive(Debug, Serialize, Deserialize)]
struct DatasetRow {
    instance_id: String,
    file_id: String,
    file_name: String,
    file_path: String,
    file_type: String,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    export_path: String,
}

impl DatasetRow {
    /// Builds a row from a Sample, folding the on-disk file bytes into
    /// the record.
    fn from_sample(sample: &Sample, bytes: Vec<u8>) -> Self {
        let data = if bytes.is_empty() {
            None
        } else {
            Some(base64::engine::general_purpose::STANDARD.encode(bytes))
        };
        Self {
            instance_id: sample.instance_id.to_string(),
            file_id: sample.file.id.clone(),
            file_name: sample.file.name.clone(),
            file_path: sample.file.path.to_string_lossy().into_owned(),
            file_type: sample.file.file_type.clone(),
            text: sample.text.clone(),
            data,
            export_path: sample.export_path().to_string_lossy().into_owned(),
        }
    }
}

/// Backend reply envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

/// HTTP dispatcher to the external batch processor.
pub struct ClusterExecutor {
    base_url: String,
    http_client: Client,
}

impl ClusterExecutor {
    /// Creates an executor against the given backend base URL.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClusterError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    /// Backend base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Record file path for an execution directory.
    pub fn dataset_path(execution_dir: &Path) -> PathBuf {
        execution_dir.join(DATASET_FILE)
    }

    /// Materializes the dataset: one JSONL record per Sample, file bytes
    /// loaded into the record.
    ///
    /// Re-invocation with an unchanged dataset leaves the record file
    /// untouched; a sha256 fingerprint sidecar detects the no-op case.
    pub async fn materialize(
        &self,
        samples: &[Sample],
        execution_dir: &Path,
    ) -> Result<PathBuf, ClusterError> {
        tokio::fs::create_dir_all(execution_dir).await?;

        let mut lines = String::new();
        for sample in samples {
            let bytes = if sample.file.path.as_os_str().is_empty() {
                Vec::new()
            } else {
                tokio::fs::read(&sample.file.path).await?
            };
            let row = DatasetRow::from_sample(sample, bytes);
            lines.push_str(&serde_json::to_string(&row)?);
            lines.push('\n');
        }

        let fingerprint = hex::encode(Sha256::digest(lines.as_bytes()));
        let dataset_path = Self::dataset_path(execution_dir);
        let fingerprint_path = execution_dir.join(FINGERPRINT_FILE);

        let unchanged = match tokio::fs::read_to_string(&fingerprint_path).await {
            Ok(existing) => existing.trim() == fingerprint && dataset_path.exists(),
            Err(_) => false,
        };
        if unchanged {
            debug!(path = %dataset_path.display(), "Dataset unchanged; skipping rewrite");
            return Ok(dataset_path);
        }

        tokio::fs::write(&dataset_path, lines.as_bytes()).await?;
        tokio::fs::write(&fingerprint_path, fingerprint.as_bytes()).await?;
        info!(
            path = %dataset_path.display(),
            records = samples.len(),
            "Materialized dataset"
        );
        Ok(dataset_path)
    }

    /// Builds the backend configuration by POSTing the desired dataset
    /// path, export path, and operator list; returns the enriched config.
    pub async fn get_init_configs(
        &self,
        dataset_path: &Path,
        export_path: &Path,
        spec: &PipelineSpec,
    ) -> Result<serde_json::Value, ClusterError> {
        // The backend takes the process list as one single-key map per
        // operator.
        let mut process = Vec::with_capacity(spec.operators.len());
        for step in &spec.operators {
            let mut entry = serde_json::Map::new();
            entry.insert(step.name.clone(), serde_json::to_value(&step.options)?);
            process.push(serde_json::Value::Object(entry));
        }

        let desired = serde_json::json!({
            "dataset_path": dataset_path.to_string_lossy(),
            "export_path": export_path.to_string_lossy(),
            "process": process,
        });

        let endpoint = format!("{}/data_juicer/config/get_init_configs", self.base_url);
        let url = format!(
            "{}?cfg={}",
            endpoint,
            urlencoding::encode(&desired.to_string())
        );

        let envelope = self.post_for_envelope(&endpoint, &url, None).await?;
        envelope.result.ok_or_else(|| ClusterError::Backend {
            endpoint,
            status: "success envelope without result".to_string(),
        })
    }

    /// Submits the enriched config to the backend's executor and requires
    /// a `success` envelope.
    pub async fn run(&self, enriched_config: &serde_json::Value) -> Result<(), ClusterError> {
        let endpoint = format!("{}/data_juicer/core/Executor/run", self.base_url);
        let url = format!("{}?skip_return=true", endpoint);
        let body = serde_json::json!({ "cfg": enriched_config.to_string() });

        self.post_for_envelope(&endpoint, &url, Some(body)).await?;
        Ok(())
    }

    /// Materializes, configures, and runs: the whole dispatch protocol.
    ///
    /// Any non-`success` envelope, HTTP error, or transport fault is
    /// terminal and surfaces to the caller.
    pub async fn dispatch(
        &self,
        samples: &[Sample],
        execution_dir: &Path,
        export_path: &Path,
        spec: &PipelineSpec,
    ) -> Result<(), ClusterError> {
        let dataset_path = self.materialize(samples, execution_dir).await?;
        let enriched = self
            .get_init_configs(&dataset_path, export_path, spec)
            .await?;
        self.run(&enriched).await?;
        info!(
            records = samples.len(),
            export_path = %export_path.display(),
            "Cluster dispatch accepted"
        );
        Ok(())
    }

    async fn post_for_envelope(
        &self,
        endpoint: &str,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Envelope, ClusterError> {
        let mut request = self.http_client.post(url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let code = response.status();
        if !code.is_success() {
            return Err(ClusterError::Http {
                endpoint: endpoint.to_string(),
                code: code.as_u16(),
            });
        }

        let envelope: Envelope = response.json().await?;
        if envelope.status != STATUS_SUCCESS {
            return Err(ClusterError::Backend {
                endpoint: endpoint.to_string(),
                status: envelope.status,
            });
        }
        Ok(envelope)
    }
}
