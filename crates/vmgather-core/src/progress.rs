//! Context-carried progress callback from the Pipeline to the Job Manager.

use chrono::Duration as ChronoDuration;

use crate::model::TimeRange;

/// A single batch's progress report, carrying the absolute 1-based index
/// within the original run (not the current resumed run) so the receiver
/// can treat it as a monotonic indicator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchProgress {
    /// Absolute 1-based batch index within the original plan.
    pub batch_index: usize,
    /// Total number of batches in the plan.
    pub total_batches: usize,
    /// The window this batch covered.
    pub window: TimeRange,
    /// Number of metric records produced by this batch.
    pub metrics_in_batch: u64,
    /// Wall-clock duration this batch took.
    pub duration: ChronoDuration,
}

/// The callback the Pipeline invokes after each batch completes.
///
/// Implementations MUST be cheap and MUST NOT perform I/O: the Job Manager
/// adapter holds its registry lock only for the duration of this call.
pub trait ProgressSink: Send + Sync {
    /// Reports that a batch has completed.
    fn on_batch(&self, event: BatchProgress);
}

/// A sink that discards every event, for pipeline runs with no observer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_batch(&self, _event: BatchProgress) {}
}

impl<F> ProgressSink for F
where
    F: Fn(BatchProgress) + Send + Sync,
{
    fn on_batch(&self, event: BatchProgress) {
        self(event)
    }
}
