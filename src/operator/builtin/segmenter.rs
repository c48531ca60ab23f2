//! `segmenter`: slicer chunking the text payload into fixed-size child
//! Samples.
//!
//! Children inherit the parent's identity through `Sample::spawn_child`;
//! the runner assigns the fan-out count and routes each child to the
//! result store independently.

use async_trait::async_trait;

use crate::error::OperatorFailure;
use crate::operator::{Operator, OperatorKind, OperatorOptions, OperatorOutput};
use crate::sample::Sample;

/// Default chunk size in characters.
const DEFAULT_CHUNK_CHARS: usize = 800;

/// Failure code for a non-positive chunk size reaching execution.
const CODE_BAD_CHUNK: i64 = 2101;

/// Slicer splitting `text` into chunks of at most `chunk` characters.
#[derive(Debug)]
pub struct Segmenter {
    chunk: usize,
}

impl Segmenter {
    /// Registered operator name.
    pub const NAME: &'static str = "segmenter";

    /// Builds the operator from its options.
    ///
    /// Options:
    /// - `chunk` (integer, default 800): maximum characters per child.
    pub fn new(options: &OperatorOptions) -> Result<Self, String> {
        Ok(Self {
            chunk: options.get_or("chunk", DEFAULT_CHUNK_CHARS),
        })
    }
}

pub(super) fn factory(options: &OperatorOptions) -> Result<Box<dyn Operator>, String> {
    Ok(Box::new(Segmenter::new(options)?))
}

#[async_trait]
impl Operator for Segmenter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn kind(&self) -> OperatorKind {
        OperatorKind::Slicer
    }

    async fn execute(&self, sample: Sample) -> Result<OperatorOutput, OperatorFailure> {
        if self.chunk == 0 {
            return Err(OperatorFailure::new(CODE_BAD_CHUNK, "chunk must be > 0"));
        }

        let chars: Vec<char> = sample.text.chars().collect();
        let mut children = Vec::new();
        for (index, piece) in chars.chunks(self.chunk).enumerate() {
            let mut child = sample.spawn_child(index as u32);
            child.text = piece.iter().collect();
            children.push(child);
        }
        Ok(OperatorOutput::Many(children))
    }
}
