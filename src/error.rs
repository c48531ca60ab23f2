//! Error types for pipeline construction and operator execution.
//!
//! Defines the error taxonomy shared across subsystems:
//! - Operator registry resolution and instantiation
//! - Operator-reported business failures
//!
//! Subsystems that own a resource (result store, cluster dispatcher,
//! orchestrator) define their errors next to that resource.

use thiserror::Error;

/// Well-known failure codes stamped onto Samples.
pub mod codes {
    /// Generic engine code for failures the operator did not classify
    /// (panics and other unrecognized faults absorbed by the runner).
    pub const ENGINE: i64 = 1000;

    /// The execution was canceled while this Sample was in flight.
    pub const CANCELED: i64 = 1001;
}

/// Errors that can occur during operator registry operations.
///
/// All of these are configuration or packaging errors: they are raised at
/// pipeline construction time, before any Sample is processed.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Operator '{0}' not found in registry")]
    OperatorUnknown(String),

    #[error("Operator '{0}' already registered with a different locator")]
    RegistryConflict(String),

    #[error("Failed to instantiate operator '{name}': {reason}")]
    OperatorLoadError { name: String, reason: String },

    #[error("Registry is frozen; registration is only allowed at startup")]
    Frozen,
}

/// A business failure reported by an operator for a single Sample.
///
/// The runner absorbs these into the Sample's failure metadata and moves
/// on to the next Sample; they never abort the pipeline.
#[derive(Debug, Clone, Error)]
#[error("operator failure (code {code}): {message}")]
pub struct OperatorFailure {
    /// Operator-supplied numeric failure code.
    pub code: i64,
    /// Human-readable description.
    pub message: String,
}

impl OperatorFailure {
    /// Creates a failure with an operator-supplied code.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates a failure carrying the generic engine code.
    pub fn engine(message: impl Into<String>) -> Self {
        Self::new(codes::ENGINE, message)
    }
}
