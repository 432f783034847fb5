//! Cluster status polling and output validation.

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::cluster::{parse_job_listing, SubmitRequest};
use crate::context::PipelineContext;
use crate::error::ClusterError;
use crate::job::Item;
use crate::metrics::PipelineMetrics;
use crate::retry::{handle_failure, Failure, RetryDecision};
use crate::submit::release_lock;

/// Marker the cluster scripts print as their last line on success.
pub const SUCCESS_MARKER: &str = "Finished successfully";

// --- Cluster Monitor ---

/// Keeps `running_cluster_jobs` in sync with the scheduler's job listing.
#[derive(Debug, Clone)]
pub struct ClusterMonitor {
  ctx: PipelineContext,
}

impl ClusterMonitor {
  pub fn new(ctx: PipelineContext) -> Self {
    Self { ctx }
  }

  /// Queries the scheduler once and replaces the running set.
  ///
  /// The snapshot is stamped with the time the query was issued, so a job
  /// submitted while the query is in flight is never considered observed.
  /// On failure the previous snapshot stays in place.
  pub async fn refresh(&self) -> Result<usize, ClusterError> {
    let issued_at = Utc::now();
    let listing = self.ctx.cluster.list_jobs().await?;
    let running = parse_job_listing(&listing);
    let count = running.len();
    self.ctx.state.update_running_jobs(running, issued_at);
    debug!(running = count, %issued_at, "Refreshed running cluster jobs.");
    Ok(count)
  }

  pub(crate) async fn run(self) {
    info!("Cluster monitor loop started.");
    let mut shutdown = self.ctx.shutdown.clone();
    let timing = &self.ctx.config.timing;
    loop {
      let delay = match self.refresh().await {
        Ok(_) => timing.poll_interval,
        Err(e) => {
          error!(error = %e, "Cluster status query failed.");
          timing.error_delay
        }
      };
      if !shutdown.sleep(delay).await {
        break;
      }
    }
    info!("Cluster monitor loop stopped.");
  }
}

// --- Validation ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
  /// Not yet observed as finished; requeued.
  NotReady,
  Passed,
  Failed(RetryDecision),
}

/// Checks finished cluster jobs for the success marker.
#[derive(Debug, Clone)]
pub struct Validation {
  ctx: PipelineContext,
}

impl Validation {
  pub fn new(ctx: PipelineContext) -> Self {
    Self { ctx }
  }

  pub async fn process(&self, item: Item) -> ValidationOutcome {
    let ctx = &self.ctx;
    if !ctx.state.is_ready_for_validation(&item) {
      debug!(
        unique_id = %item.unique_id(),
        cluster_job_id = ?item.cluster_job_id(),
        "Job not ready for validation."
      );
      ctx.state.validation_queue.push(item);
      return ValidationOutcome::NotReady;
    }

    match self.check_output(&item).await {
      Ok(()) => {
        self.accept(item).await;
        ValidationOutcome::Passed
      }
      Err(reason) => {
        PipelineMetrics::incr(&ctx.metrics.validations_failed);
        let request = SubmitRequest::for_item(&item, &ctx.config);
        let failure = Failure::new(ctx.cluster.describe(&request), String::new(), reason);
        ValidationOutcome::Failed(handle_failure(ctx, item, failure).await)
      }
    }
  }

  /// Looks for the success marker in the job's stdout log.
  async fn check_output(&self, item: &Item) -> Result<(), String> {
    let Some(path) = item.stdout_path() else {
      return Err("record has no cluster job".to_string());
    };
    match tokio::fs::read(path).await {
      Ok(bytes) if String::from_utf8_lossy(&bytes).contains(SUCCESS_MARKER) => Ok(()),
      Ok(_) => Err(format!("'{SUCCESS_MARKER}' not found in {}", path.display())),
      Err(e) => Err(format!("failed to read {}: {e}", path.display())),
    }
  }

  async fn accept(&self, mut item: Item) {
    let ctx = &self.ctx;
    release_lock(&mut item).await;
    PipelineMetrics::incr(&ctx.metrics.validations_passed);
    if let Some(turnaround) = item
      .submitted_at()
      .and_then(|t| Utc::now().signed_duration_since(t).to_std().ok())
    {
      ctx.metrics.cluster_turnaround.record(turnaround);
    }

    let Some(job_id) = item.cluster_job_id() else {
      warn!(unique_id = %item.unique_id(), "Validated record without a cluster job id.");
      return;
    };
    info!(unique_id = %item.unique_id(), cluster_job_id = %job_id, "Cluster job validated.");
    if item.run_type().is_precalculable() {
      ctx.state.precalculated.record(item.unique_id().clone(), job_id);
    } else {
      ctx.state.scoring_pending_queue.push(item);
    }
  }

  /// Processes every record queued when the pass starts.
  pub async fn pass(&self) -> Vec<ValidationOutcome> {
    let queue = &self.ctx.state.validation_queue;
    let mut outcomes = Vec::new();
    for _ in 0..queue.len() {
      let Some(item) = queue.pop() else {
        break;
      };
      outcomes.push(self.process(item).await);
      if self.ctx.shutdown.is_triggered() {
        break;
      }
      tokio::time::sleep(self.ctx.config.timing.loop_interval).await;
    }
    outcomes
  }

  pub(crate) async fn run(self) {
    info!("Validation loop started.");
    let mut shutdown = self.ctx.shutdown.clone();
    loop {
      self.pass().await;
      if !shutdown.sleep(self.ctx.config.timing.sweep_interval).await {
        break;
      }
    }
    info!("Validation loop stopped.");
  }
}
