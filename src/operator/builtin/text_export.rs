//! `text-export`: formatter writing the current text payload out-of-band
//! to the Sample's export directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::OperatorFailure;
use crate::operator::{Operator, OperatorKind, OperatorOptions, OperatorOutput};
use crate::sample::Sample;

/// Failure code for filesystem errors while exporting.
const CODE_EXPORT_IO: i64 = 4001;

/// Formatter persisting `text` to `<export_path>/<stem>[.partN].txt`.
#[derive(Debug)]
pub struct TextExport {
    extension: String,
}

impl TextExport {
    /// Registered operator name.
    pub const NAME: &'static str = "text-export";

    /// Builds the operator from its options.
    ///
    /// Options:
    /// - `extension` (string, default "txt").
    pub fn new(options: &OperatorOptions) -> Result<Self, String> {
        Ok(Self {
            extension: options.get_or("extension", "txt".to_string()),
        })
    }

    /// Output file name for a Sample; slicer children get a part suffix
    /// so siblings never clobber each other.
    fn output_name(&self, sample: &Sample) -> String {
        let stem = Path::new(&sample.file.name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&sample.file.name);
        match sample.sequence_id {
            Some(sequence) => format!("{}.part{}.{}", stem, sequence, self.extension),
            None => format!("{}.{}", stem, self.extension),
        }
    }
}

pub(super) fn factory(options: &OperatorOptions) -> Result<Box<dyn Operator>, String> {
    Ok(Box::new(TextExport::new(options)?))
}

#[async_trait]
impl Operator for TextExport {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Formatter
    }

    async fn execute(&self, mut sample: Sample) -> Result<OperatorOutput, OperatorFailure> {
        let target: PathBuf = sample.export_path().join(self.output_name(&sample));

        tokio::fs::create_dir_all(sample.export_path())
            .await
            .map_err(|e| {
                OperatorFailure::new(CODE_EXPORT_IO, format!("create export dir: {}", e))
            })?;
        tokio::fs::write(&target, sample.text.as_bytes())
            .await
            .map_err(|e| {
                OperatorFailure::new(CODE_EXPORT_IO, format!("write {}: {}", target.display(), e))
            })?;

        // The exported file becomes the current-stage file.
        sample.file.size = sample.text.len() as i64;
        sample.file.path = target;
        sample.file.file_type = self.extension.clone();
        Ok(OperatorOutput::One(sample))
    }
}
