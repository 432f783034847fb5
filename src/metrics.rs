use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count and sum.
///
/// Suitable for simple latency tracking without percentile information.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Total of all recorded durations, in microseconds.
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Pipeline Metrics (Internal State) ---

/// Atomic counters shared by every pipeline stage.
///
/// Cloning only clones the `Arc`s.
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
  /// Job records created by `submit`.
  pub records_created: Arc<AtomicUsize>,
  /// Successful cluster submissions.
  pub cluster_submissions: Arc<AtomicUsize>,
  /// Sequence/model records skipped because the result is already known.
  pub discarded_precalculated: Arc<AtomicUsize>,
  /// Records skipped because another attempt holds the lock.
  pub discarded_locked: Arc<AtomicUsize>,
  /// Records sent back to submission by the retry policy.
  pub retries: Arc<AtomicUsize>,
  /// Records that ended as a permanent error.
  pub permanent_errors: Arc<AtomicUsize>,
  /// Records whose cluster output validated successfully.
  pub validations_passed: Arc<AtomicUsize>,
  pub validations_failed: Arc<AtomicUsize>,
  /// Sub-jobs posted to the scoring service.
  pub scoring_posts: Arc<AtomicUsize>,
  /// Records finalized by the scoring collect loop.
  pub scoring_finalized: Arc<AtomicUsize>,
  /// Cache entries persisted by the flush loop.
  pub cache_entries_flushed: Arc<AtomicUsize>,
  pub cache_flush_failures: Arc<AtomicUsize>,
  /// Caller jobs reported complete.
  pub jobs_completed: Arc<AtomicUsize>,

  /// Time from cluster submission to successful validation.
  pub cluster_turnaround: Arc<SimpleHistogram>,
}

impl PipelineMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_cache_flush(&self, entries: usize) {
    self.cache_entries_flushed.fetch_add(entries, Ordering::Relaxed);
  }

  pub(crate) fn record_cache_flush_failure(&self) {
    Self::incr(&self.cache_flush_failures);
  }

  /// Point-in-time view of the counters. Queue gauges are filled in by the caller.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;
    MetricsSnapshot {
      records_created: self.records_created.load(order),
      cluster_submissions: self.cluster_submissions.load(order),
      discarded_precalculated: self.discarded_precalculated.load(order),
      discarded_locked: self.discarded_locked.load(order),
      retries: self.retries.load(order),
      permanent_errors: self.permanent_errors.load(order),
      validations_passed: self.validations_passed.load(order),
      validations_failed: self.validations_failed.load(order),
      scoring_posts: self.scoring_posts.load(order),
      scoring_finalized: self.scoring_finalized.load(order),
      cache_entries_flushed: self.cache_entries_flushed.load(order),
      cache_flush_failures: self.cache_flush_failures.load(order),
      jobs_completed: self.jobs_completed.load(order),
      cluster_turnaround_count: self.cluster_turnaround.get_count(),
      cluster_turnaround_sum_micros: self.cluster_turnaround.get_sum_micros(),
      ..MetricsSnapshot::default()
    }
  }
}

// --- Metrics Snapshot (Public Data) ---

/// Plain copy of the pipeline counters and queue lengths.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde_snapshots", derive(serde::Serialize))]
pub struct MetricsSnapshot {
  // Counters
  pub records_created: usize,
  pub cluster_submissions: usize,
  pub discarded_precalculated: usize,
  pub discarded_locked: usize,
  pub retries: usize,
  pub permanent_errors: usize,
  pub validations_passed: usize,
  pub validations_failed: usize,
  pub scoring_posts: usize,
  pub scoring_finalized: usize,
  pub cache_entries_flushed: usize,
  pub cache_flush_failures: usize,
  pub jobs_completed: usize,
  // Gauges
  pub gate_queue_len: usize,
  pub submission_queue_len: usize,
  pub validation_queue_len: usize,
  pub scoring_pending_len: usize,
  pub scoring_running_len: usize,
  pub running_cluster_jobs: usize,
  pub cache_buffered: usize,
  pub monitored_job_keys: usize,
  // Histogram
  pub cluster_turnaround_count: usize,
  pub cluster_turnaround_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean submission-to-validation time, if any job validated.
  pub fn mean_cluster_turnaround(&self) -> Option<Duration> {
    if self.cluster_turnaround_count == 0 {
      None
    } else {
      Some(Duration::from_micros(
        (self.cluster_turnaround_sum_micros / self.cluster_turnaround_count) as u64,
      ))
    }
  }
}
