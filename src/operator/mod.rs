//! The operator contract: the narrow interface between the execution core
//! and the units of work it drives.
//!
//! An operator is constructed from a keyword-style options bag and exposes
//! a single `execute` operation: accept a Sample, return a Sample (or a
//! list of Samples for slicers). The domain logic inside an operator is an
//! external collaborator as far as the core is concerned; the core only
//! schedules, sequences, isolates, and persists.

pub mod builtin;
pub mod registry;

pub use registry::{OperatorDescriptor, OperatorRegistry};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::OperatorFailure;
use crate::sample::Sample;

/// Kind tag declared by every operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    /// Returns the same Sample, mutated.
    Mapper,
    /// May blank a payload (conceptual drop) but must return the Sample.
    Filter,
    /// Produces a list of child Samples (fan-out).
    Slicer,
    /// May call a remote model and write scores into the bag.
    LlmEvaluator,
    /// Renders or exports the current payload.
    Formatter,
}

impl std::fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatorKind::Mapper => write!(f, "mapper"),
            OperatorKind::Filter => write!(f, "filter"),
            OperatorKind::Slicer => write!(f, "slicer"),
            OperatorKind::LlmEvaluator => write!(f, "llm_evaluator"),
            OperatorKind::Formatter => write!(f, "formatter"),
        }
    }
}

/// Return value of a single operator invocation.
#[derive(Debug)]
pub enum OperatorOutput {
    /// The (possibly mutated) input Sample.
    One(Sample),
    /// Child Samples produced by a slicer.
    Many(Vec<Sample>),
}

/// Keyword-style options bag used to construct operators.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OperatorOptions(serde_json::Map<String, serde_json::Value>);

impl OperatorOptions {
    /// Creates an empty options bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an option, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.0.insert(key.into(), value);
        }
        self
    }

    /// Typed lookup of an optional option.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Typed lookup with a fallback default.
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// Typed lookup of a required option.
    ///
    /// Returns a construction-failure reason when the key is missing or
    /// the wrong shape; factories surface it as `OperatorLoadError`.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, String> {
        match self.0.get(key) {
            None => Err(format!("missing required option '{}'", key)),
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| format!("invalid value for option '{}': {}", key, e)),
        }
    }

    /// Whether the bag is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The uniform capability set every operator exposes.
#[async_trait]
pub trait Operator: Send + Sync + std::fmt::Debug {
    /// The registered name of this operator.
    fn name(&self) -> &str;

    /// The declared kind tag.
    fn kind(&self) -> OperatorKind;

    /// Applies this operator to one Sample.
    ///
    /// Business failures are returned as `OperatorFailure`; the runner
    /// absorbs them into the Sample and never aborts the pipeline.
    async fn execute(&self, sample: Sample) -> Result<OperatorOutput, OperatorFailure>;
}
