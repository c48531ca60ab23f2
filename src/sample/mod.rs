//! The Sample model: the unit of work flowing between operators.
//!
//! A Sample carries a reserved, statically typed header (identity, file
//! metadata, payloads, status, failure metadata) plus an open bag for
//! operator-private keys. Operators interact with the header through
//! accessors and with the bag through a typed-lookup helper.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::codes;

/// Execute status value for a Sample that failed inside an operator.
pub const STATUS_FAILED: i64 = 1;

/// Execute status value for a Sample canceled while in flight.
pub const STATUS_CANCELED: i64 = 2;

/// Metadata of the originally ingested file.
///
/// Frozen at ingest time; operators never rewrite it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFileMeta {
    /// Stable identifier of the source file (content hash).
    pub id: String,
    /// Original file name.
    pub name: String,
    /// File type (extension-derived, lowercase).
    pub file_type: String,
    /// Size in bytes at ingest time.
    pub size: i64,
    /// Last-modified time at ingest time.
    pub modify_time: DateTime<Utc>,
}

/// Metadata of the file at the current pipeline stage.
///
/// Format-conversion operators update this as they rewrite the file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
    /// Identifier of the current-stage file.
    pub id: String,
    /// Current file name.
    pub name: String,
    /// Current on-disk path.
    pub path: PathBuf,
    /// Current file type.
    pub file_type: String,
    /// Current size in bytes.
    pub size: i64,
}

/// Failure metadata stamped by the runner when an operator fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInfo {
    /// Name of the operator that failed.
    pub operator: String,
    /// Numeric failure code (operator-supplied or the generic engine code).
    pub code: i64,
}

/// The unit of work flowing through a pipeline.
///
/// The status and failure fields are private so the monotonicity invariant
/// holds: once a Sample has failed, no operator can reset it to success.
#[derive(Debug, Clone)]
pub struct Sample {
    /// Execution this Sample belongs to.
    pub instance_id: Uuid,
    /// Original ingestion metadata.
    pub source: SourceFileMeta,
    /// Current-stage file metadata.
    pub file: FileMeta,
    /// Current textual payload.
    pub text: String,
    /// Current binary payload.
    pub data: Vec<u8>,
    /// Child lineage id; `None` for a top-level Sample.
    pub child_id: Option<String>,
    /// Position of this child within its parent's fan-out.
    pub sequence_id: Option<u32>,
    /// Total fan-out count, set on a slicer's parent and children.
    pub slice_num: Option<u32>,
    /// Incremental-processing marker.
    pub incremental: bool,
    export_path: PathBuf,
    execute_status: i64,
    failed_reason: Option<FailureInfo>,
    bag: BTreeMap<String, serde_json::Value>,
}

impl Sample {
    /// Creates a fresh Sample for an execution.
    ///
    /// The export path is fixed for the lifetime of the Sample.
    pub fn new(
        instance_id: Uuid,
        source: SourceFileMeta,
        file: FileMeta,
        export_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            instance_id,
            source,
            file,
            text: String::new(),
            data: Vec::new(),
            child_id: None,
            sequence_id: None,
            slice_num: None,
            incremental: false,
            export_path: export_path.into(),
            execute_status: 0,
            failed_reason: None,
            bag: BTreeMap::new(),
        }
    }

    /// Sets the textual payload.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Sets the binary payload.
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Marks the Sample as incrementally processed.
    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    /// Destination directory for exported payloads.
    pub fn export_path(&self) -> &Path {
        &self.export_path
    }

    /// Current execute status: 0 is success, nonzero is failure.
    pub fn execute_status(&self) -> i64 {
        self.execute_status
    }

    /// Failure metadata, if the Sample has failed.
    pub fn failed_reason(&self) -> Option<&FailureInfo> {
        self.failed_reason.as_ref()
    }

    /// Whether this Sample has terminally failed.
    pub fn is_failed(&self) -> bool {
        self.execute_status != 0
    }

    /// Stamps an operator failure onto the Sample.
    ///
    /// The first failure wins: a Sample that already carries a nonzero
    /// status is left untouched.
    pub fn mark_failed(&mut self, operator: impl Into<String>, code: i64) {
        if self.execute_status != 0 {
            return;
        }
        self.execute_status = STATUS_FAILED;
        self.failed_reason = Some(FailureInfo {
            operator: operator.into(),
            code,
        });
    }

    /// Stamps cancellation onto an in-flight Sample.
    pub fn mark_canceled(&mut self) {
        if self.execute_status != 0 {
            return;
        }
        self.execute_status = STATUS_CANCELED;
        self.failed_reason = Some(FailureInfo {
            operator: String::new(),
            code: codes::CANCELED,
        });
    }

    /// Writes an operator-private key into the open bag.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Serialize) {
        if let Ok(value) = serde_json::to_value(value) {
            self.bag.insert(key.into(), value);
        }
    }

    /// Reads a raw bag value.
    pub fn attr(&self, key: &str) -> Option<&serde_json::Value> {
        self.bag.get(key)
    }

    /// Typed lookup into the bag.
    ///
    /// Returns `None` if the key is absent or the value does not
    /// deserialize to `T`.
    pub fn attr_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.bag
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Spawns a child Sample for slicer fan-out.
    ///
    /// The child inherits the parent's execution id, export path, file and
    /// source metadata, and receives a fresh child id and the given
    /// sequence position. Payloads start empty; the slicer fills them.
    pub fn spawn_child(&self, sequence_id: u32) -> Sample {
        Sample {
            instance_id: self.instance_id,
            source: self.source.clone(),
            file: self.file.clone(),
            text: String::new(),
            data: Vec::new(),
            child_id: Some(Uuid::new_v4().to_string()),
            sequence_id: Some(sequence_id),
            slice_num: None,
            incremental: self.incremental,
            export_path: self.export_path.clone(),
            execute_status: 0,
            failed_reason: None,
            bag: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
pub mod tests_support {
    //! Shared Sample constructors for unit tests across the crate.

    use super::*;

    /// A minimal text-bearing Sample with fixed metadata.
    pub fn text_sample(text: &str) -> Sample {
        Sample::new(
            Uuid::new_v4(),
            SourceFileMeta {
                id: "src-1".to_string(),
                name: "doc.txt".to_string(),
                file_type: "txt".to_string(),
                size: text.len() as i64,
                modify_time: Utc::now(),
            },
            FileMeta {
                id: "file-1".to_string(),
                name: "doc.txt".to_string(),
                path: PathBuf::from("/in/doc.txt"),
                file_type: "txt".to_string(),
                size: text.len() as i64,
            },
            "/out",
        )
        .with_text(text)
    }
}
