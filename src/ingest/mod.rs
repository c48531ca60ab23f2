//! The ingest stage: scans a source directory into Samples.
//!
//! One Sample per regular file, carrying the original metadata (name,
//! extension-derived type, size, modify time) and a content-hash file id.
//! Text-bearing files get their contents decoded into the text payload;
//! everything else rides as binary data.

use std::path::Path;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::sample::{FileMeta, Sample, SourceFileMeta};

/// File types whose bytes are decoded into the text payload.
const TEXT_TYPES: &[&str] = &["txt", "md", "json", "jsonl", "csv", "html", "xml", "yaml"];

/// Hex length of the content-hash file id.
const FILE_ID_LEN: usize = 16;

/// Errors that can occur while scanning a source directory.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Source path '{0}' is not a directory")]
    NotADirectory(String),
}

/// Scans `source_dir` into one Sample per regular file.
///
/// Samples carry `instance_id` and the fixed `export_path`; files are
/// visited in path order so repeated scans of an unchanged directory
/// produce the same Samples.
pub fn scan_source_dir(
    instance_id: Uuid,
    source_dir: &Path,
    export_path: &Path,
) -> Result<Vec<Sample>, IngestError> {
    if !source_dir.is_dir() {
        return Err(IngestError::NotADirectory(
            source_dir.to_string_lossy().into_owned(),
        ));
    }

    let mut samples = Vec::new();
    for entry in WalkDir::new(source_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let bytes = std::fs::read(path)?;
        let metadata = entry.metadata()?;
        let modify_time: DateTime<Utc> = metadata.modified()?.into();

        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        let file_id = content_id(&bytes);
        let size = bytes.len() as i64;

        let source = SourceFileMeta {
            id: file_id.clone(),
            name: name.clone(),
            file_type: file_type.clone(),
            size,
            modify_time,
        };
        let file = FileMeta {
            id: file_id,
            name,
            path: path.to_path_buf(),
            file_type: file_type.clone(),
            size,
        };

        let mut sample = Sample::new(instance_id, source, file, export_path);
        if TEXT_TYPES.contains(&file_type.as_str()) {
            match String::from_utf8(bytes) {
                Ok(text) => sample.text = text,
                Err(raw) => sample.data = raw.into_bytes(),
            }
        } else {
            sample.data = bytes;
        }
        samples.push(sample);
    }

    debug!(
        source = %source_dir.display(),
        count = samples.len(),
        "Scanned source directory"
    );
    Ok(samples)
}

/// Content-hash identifier for a file's bytes.
pub fn content_id(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..])[..FILE_ID_LEN].to_string()
}
