//! The operator runner: drives one Sample through the declared operator
//! sequence inside a fault barrier.
//!
//! For each step the runner short-circuits already-failed Samples,
//! invokes the operator, and merges the returned Sample back into its
//! working copy. Business failures and panics from untrusted operator
//! code are absorbed into the Sample's failure metadata; they never abort
//! the pipeline. Slicer fan-out routes every child independently to the
//! result store with the parent persisted as a summary row.

pub mod dispatcher;

pub use dispatcher::{DispatcherConfig, RunStats, SampleDispatcher};

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{codes, RegistryError};
use crate::operator::{Operator, OperatorKind, OperatorOptions, OperatorOutput, OperatorRegistry};
use crate::sample::Sample;
use crate::store::{ResultStore, StoreError};

/// One declared pipeline step: operator name plus its options bag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperatorStep {
    /// Registered operator name.
    pub name: String,
    /// Keyword options passed to the operator's constructor.
    #[serde(default)]
    pub options: OperatorOptions,
}

/// The declared ordered operator list attached to a Task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineSpec {
    /// Operators in execution order.
    pub operators: Vec<OperatorStep>,
}

impl PipelineSpec {
    /// Parses a pipeline spec from a JSON config blob.
    pub fn from_json(blob: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(blob)
    }

    /// Whether the spec declares no operators.
    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}

/// Terminal accounting for one top-level Sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleOutcome {
    /// Rows written to the result store (parent plus any children).
    pub rows: usize,
    /// Whether the top-level Sample terminated with a failure status.
    pub failed: bool,
    /// Whether the top-level Sample was canceled in flight.
    pub canceled: bool,
}

/// In-process driver applying the operator sequence to Samples.
pub struct OperatorRunner {
    operators: Vec<Box<dyn Operator>>,
}

impl OperatorRunner {
    /// Instantiates every declared operator from the registry.
    ///
    /// Resolution and construction errors surface here, before any Sample
    /// is processed.
    pub fn from_spec(
        registry: &OperatorRegistry,
        spec: &PipelineSpec,
    ) -> Result<Self, RegistryError> {
        let mut operators = Vec::with_capacity(spec.operators.len());
        for step in &spec.operators {
            operators.push(registry.instantiate(&step.name, &step.options)?);
        }
        Ok(Self { operators })
    }

    /// Builds a runner from already-instantiated operators (tests and
    /// embedders).
    pub fn from_operators(operators: Vec<Box<dyn Operator>>) -> Self {
        Self { operators }
    }

    /// Number of instantiated operators.
    pub fn len(&self) -> usize {
        self.operators.len()
    }

    /// Whether the pipeline has no operators.
    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Drives one Sample through the full operator sequence and persists
    /// its outcome (and any fan-out children) to the result store.
    ///
    /// Store errors are fatal for this Sample's batch and propagate;
    /// operator failures are stamped onto the Sample and recorded.
    pub async fn run_sample(
        &self,
        sample: Sample,
        store: &ResultStore,
        cancel: &watch::Receiver<bool>,
    ) -> Result<SampleOutcome, StoreError> {
        self.process(sample, 0, store, cancel).await
    }

    /// Applies operators starting at `start_index`, recursing for slicer
    /// children so a nested slicer fans out again.
    fn process<'a>(
        &'a self,
        mut sample: Sample,
        start_index: usize,
        store: &'a ResultStore,
        cancel: &'a watch::Receiver<bool>,
    ) -> BoxFuture<'a, Result<SampleOutcome, StoreError>> {
        async move {
            for (index, operator) in self.operators.iter().enumerate().skip(start_index) {
                // Cooperative cancellation between operator invocations.
                if *cancel.borrow() {
                    sample.mark_canceled();
                    break;
                }

                // Short-circuit: a failed Sample skips remaining operators
                // (none are marked always-run in the base taxonomy).
                if sample.is_failed() {
                    break;
                }

                let started = Instant::now();
                let name = operator.name().to_string();
                let working = sample.clone();

                let barrier = AssertUnwindSafe(operator.execute(working))
                    .catch_unwind()
                    .await;

                match barrier {
                    Ok(Ok(OperatorOutput::One(returned))) => {
                        debug!(
                            operator = %name,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Operator step complete"
                        );
                        // Merge: the returned Sample becomes the working one.
                        sample = returned;
                    }
                    Ok(Ok(OperatorOutput::Many(children))) => {
                        debug!(
                            operator = %name,
                            fan_out = children.len(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Slicer fan-out"
                        );
                        if operator.kind() != OperatorKind::Slicer {
                            warn!(operator = %name, "Non-slicer operator returned a fan-out");
                        }
                        return self
                            .fan_out(sample, children, index + 1, store, cancel)
                            .await;
                    }
                    Ok(Err(failure)) => {
                        warn!(
                            operator = %name,
                            code = failure.code,
                            error = %failure.message,
                            "Operator reported a business failure"
                        );
                        sample.mark_failed(&name, failure.code);
                    }
                    Err(_panic) => {
                        warn!(operator = %name, "Operator panicked; absorbed by fault barrier");
                        sample.mark_failed(&name, codes::ENGINE);
                    }
                }
            }

            let outcome = SampleOutcome {
                rows: 1,
                failed: sample.execute_status() == crate::sample::STATUS_FAILED,
                canceled: sample.execute_status() == crate::sample::STATUS_CANCELED,
            };
            store.persist(&sample).await?;
            Ok(outcome)
        }
        .boxed()
    }

    /// Persists the parent as a summary row and routes every child through
    /// the remaining operators.
    async fn fan_out(
        &self,
        mut parent: Sample,
        children: Vec<Sample>,
        next_index: usize,
        store: &ResultStore,
        cancel: &watch::Receiver<bool>,
    ) -> Result<SampleOutcome, StoreError> {
        let fan_out = children.len() as u32;
        parent.slice_num = Some(fan_out);
        store.persist(&parent).await?;

        let mut outcome = SampleOutcome {
            rows: 1,
            failed: false,
            canceled: false,
        };
        for mut child in children {
            child.slice_num = Some(fan_out);
            let child_outcome = self.process(child, next_index, store, cancel).await?;
            outcome.rows += child_outcome.rows;
        }
        Ok(outcome)
    }
}
