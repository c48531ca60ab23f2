//! Cross-Sample dispatch: a bounded worker pool driving many Samples
//! through the runner concurrently.
//!
//! Within one Sample operators are strictly ordered; across Samples no
//! ordering is guaranteed. Concurrency is capped by a semaphore; store
//! errors abort the batch while per-Sample operator failures only feed
//! the statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tracing::{debug, info};

use crate::sample::Sample;
use crate::store::{ResultStore, StoreError};

use super::OperatorRunner;

/// Configuration for the sample dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of Samples processed concurrently.
    pub max_concurrent_samples: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_samples: 4,
        }
    }
}

impl DispatcherConfig {
    /// Creates a configuration with the given concurrency cap.
    pub fn new(max_concurrent_samples: usize) -> Self {
        Self {
            max_concurrent_samples,
        }
    }
}

/// Statistics about one execution's dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    /// Top-level Samples processed.
    pub total: u64,
    /// Samples that terminated with success status.
    pub succeeded: u64,
    /// Samples that terminated with failure status.
    pub failed: u64,
    /// Samples canceled in flight.
    pub canceled: u64,
    /// Result rows written (parents plus children).
    pub rows_persisted: u64,
    /// Average wall time per Sample.
    pub average_duration: Duration,
}

impl RunStats {
    /// Whether every Sample terminated with success status.
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.canceled == 0
    }
}

/// Shared counters the worker futures write into.
struct SharedStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    canceled: AtomicU64,
    rows_persisted: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl SharedStats {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            canceled: AtomicU64::new(0),
            rows_persisted: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
        }
    }

    fn record(&self, outcome: &super::SampleOutcome, duration: Duration) {
        self.total.fetch_add(1, Ordering::SeqCst);
        if outcome.canceled {
            self.canceled.fetch_add(1, Ordering::SeqCst);
        } else if outcome.failed {
            self.failed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.succeeded.fetch_add(1, Ordering::SeqCst);
        }
        self.rows_persisted
            .fetch_add(outcome.rows as u64, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_stats(&self) -> RunStats {
        let total = self.total.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        RunStats {
            total,
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            canceled: self.canceled.load(Ordering::SeqCst),
            rows_persisted: self.rows_persisted.load(Ordering::SeqCst),
            average_duration,
        }
    }
}

/// Bounded worker pool fanning Samples across the runner.
pub struct SampleDispatcher {
    config: DispatcherConfig,
}

impl SampleDispatcher {
    /// Creates a dispatcher with the given configuration.
    pub fn new(config: DispatcherConfig) -> Self {
        Self { config }
    }

    /// Runs every Sample through the pipeline, bounded by the concurrency
    /// cap, and returns aggregate statistics.
    ///
    /// A store error is fatal for the batch and surfaces immediately;
    /// operator failures are recorded per Sample and do not abort.
    pub async fn run_all(
        &self,
        runner: &OperatorRunner,
        store: &ResultStore,
        samples: Vec<Sample>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<RunStats, StoreError> {
        if samples.is_empty() {
            return Ok(RunStats::default());
        }

        let limiter = Arc::new(Semaphore::new(self.config.max_concurrent_samples));
        let stats = Arc::new(SharedStats::new());

        let futures: Vec<_> = samples
            .into_iter()
            .map(|sample| {
                let limiter = Arc::clone(&limiter);
                let stats = Arc::clone(&stats);
                async move {
                    // The semaphore is never closed while we hold it.
                    let _permit = limiter
                        .acquire()
                        .await
                        .expect("dispatcher semaphore closed");
                    let started = Instant::now();
                    let file_id = sample.file.id.clone();

                    let outcome = runner.run_sample(sample, store, cancel).await?;
                    let duration = started.elapsed();
                    stats.record(&outcome, duration);
                    debug!(
                        file_id = %file_id,
                        rows = outcome.rows,
                        failed = outcome.failed,
                        elapsed_ms = duration.as_millis() as u64,
                        "Sample dispatched"
                    );
                    Ok::<(), StoreError>(())
                }
            })
            .collect();

        for result in futures::future::join_all(futures).await {
            result?;
        }

        let stats = stats.to_stats();
        info!(
            total = stats.total,
            succeeded = stats.succeeded,
            failed = stats.failed,
            canceled = stats.canceled,
            rows = stats.rows_persisted,
            "Dispatch complete"
        );
        Ok(stats)
    }
}
