//! Dependency gate and cluster submission stages.

use std::io::ErrorKind;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cluster::{parse_job_id, SubmitRequest};
use crate::context::PipelineContext;
use crate::job::{normalize_mutation, ClusterJobId, Item};
use crate::metrics::PipelineMetrics;
use crate::notify::AdminNotice;
use crate::retry::{escalate, handle_failure, Failure, RetryDecision};
use crate::store::MutationStatus;

// --- Lock files ---

/// Atomically creates the record's lock file. Returns `Ok(false)` if it already exists.
pub(crate) async fn acquire_lock(item: &mut Item) -> std::io::Result<bool> {
  let path = item.lock_path().to_path_buf();
  if let Some(parent) = path.parent() {
    tokio::fs::create_dir_all(parent).await?;
  }
  match tokio::fs::OpenOptions::new()
    .write(true)
    .create_new(true)
    .open(&path)
    .await
  {
    Ok(_) => {
      item.mark_lock_acquired();
      Ok(true)
    }
    Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
    Err(e) => Err(e),
  }
}

/// Removes the record's lock file if the record owns it. Absence is not an error.
pub(crate) async fn release_lock(item: &mut Item) {
  if !item.lock_held() {
    return;
  }
  match tokio::fs::remove_file(item.lock_path()).await {
    Ok(()) => debug!(
      unique_id = %item.unique_id(),
      path = %item.lock_path().display(),
      "Removed lock file."
    ),
    Err(e) if e.kind() == ErrorKind::NotFound => {
      debug!(unique_id = %item.unique_id(), "Lock file already gone.")
    }
    Err(e) => warn!(
      unique_id = %item.unique_id(),
      path = %item.lock_path().display(),
      error = %e,
      "Failed to remove lock file."
    ),
  }
  item.mark_lock_released();
}

// --- Dependency Gate ---

/// Counts from one pass over the gate queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatePass {
  pub forwarded: usize,
  pub waiting: usize,
  pub expired: usize,
}

/// Holds mutation records until their sequence and model results are known.
#[derive(Debug, Clone)]
pub struct DependencyGate {
  ctx: PipelineContext,
}

impl DependencyGate {
  pub fn new(ctx: PipelineContext) -> Self {
    Self { ctx }
  }

  /// Looks at every record queued when the pass starts, exactly once.
  pub async fn pass(&self) -> GatePass {
    let state = &self.ctx.state;
    let mut summary = GatePass::default();
    for _ in 0..state.gate_queue.len() {
      let Some(item) = state.gate_queue.pop() else {
        break;
      };
      if state.precalculated.has_all(item.prereqs()) {
        debug!(unique_id = %item.unique_id(), "Prerequisites satisfied.");
        state.submission_queue.push(item);
        summary.forwarded += 1;
      } else if self.within_timeout(&item) {
        debug!(
          unique_id = %item.unique_id(),
          prereqs = ?item.prereqs(),
          "Waiting for prerequisites."
        );
        state.gate_queue.push(item);
        summary.waiting += 1;
      } else {
        let timeout = self.ctx.config.retry.gate_timeout;
        let notice = AdminNotice::for_item(
          &item,
          String::new(),
          format!("prerequisites not available after {}s", timeout.as_secs()),
          false,
        );
        escalate(&self.ctx, item, notice).await;
        summary.expired += 1;
      }
      if self.ctx.shutdown.is_triggered() {
        break;
      }
      tokio::time::sleep(self.ctx.config.timing.loop_interval).await;
    }
    summary
  }

  fn within_timeout(&self, item: &Item) -> bool {
    Utc::now()
      .signed_duration_since(item.init_time())
      .to_std()
      .map(|age| age < self.ctx.config.retry.gate_timeout)
      .unwrap_or(true)
  }

  pub(crate) async fn run(self) {
    info!("Dependency gate loop started.");
    let mut shutdown = self.ctx.shutdown.clone();
    loop {
      let summary = self.pass().await;
      if summary != GatePass::default() {
        debug!(?summary, "Dependency gate pass finished.");
      }
      if !shutdown.sleep(self.ctx.config.timing.sweep_interval).await {
        break;
      }
    }
    info!("Dependency gate loop stopped.");
  }
}

// --- Submission ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
  Submitted(ClusterJobId),
  /// Sequence/model result already known; record dropped.
  AlreadyPrecalculated,
  /// Another attempt owns the sequence/model lock; record dropped.
  AlreadyLocked,
  /// Another caller's mutation record owns the lock; record parked until it finishes.
  WaitingForLock,
  /// The lock owner's cluster run finished; its result was finalized for this record too.
  Adopted(MutationStatus),
  /// Retry backoff has not elapsed; record requeued untouched.
  Deferred,
  /// Handed to the retry policy.
  Failed(RetryDecision),
}

/// Submits records to the cluster, one at a time.
#[derive(Debug, Clone)]
pub struct Submission {
  ctx: PipelineContext,
}

impl Submission {
  pub fn new(ctx: PipelineContext) -> Self {
    Self { ctx }
  }

  pub async fn process(&self, mut item: Item) -> SubmitOutcome {
    let ctx = &self.ctx;

    if item.run_type().is_precalculable() && ctx.state.precalculated.has(item.unique_id()) {
      debug!(unique_id = %item.unique_id(), "Already calculated. Skipping...");
      PipelineMetrics::incr(&ctx.metrics.discarded_precalculated);
      return SubmitOutcome::AlreadyPrecalculated;
    }

    if item.not_before().is_some_and(|t| t > Utc::now()) {
      ctx.state.submission_queue.push(item);
      return SubmitOutcome::Deferred;
    }

    if item.awaiting_lock() && self.owner_finished(&item).await {
      return self.adopt(item).await;
    }

    match acquire_lock(&mut item).await {
      Ok(true) => {}
      Ok(false) if item.mutation().is_some() => {
        if self.owner_finished(&item).await {
          return self.adopt(item).await;
        }
        return self.wait_for_owner(item).await;
      }
      Ok(false) => {
        debug!(unique_id = %item.unique_id(), "Already being calculated. Skipping...");
        PipelineMetrics::incr(&ctx.metrics.discarded_locked);
        return SubmitOutcome::AlreadyLocked;
      }
      Err(e) => {
        let failure = Failure::new(
          String::new(),
          String::new(),
          format!("failed to create lock file {}: {e}", item.lock_path().display()),
        );
        return SubmitOutcome::Failed(handle_failure(ctx, item, failure).await);
      }
    }

    let request = SubmitRequest::for_item(&item, &ctx.config);
    let command = ctx.cluster.describe(&request);
    debug!(unique_id = %item.unique_id(), %command, "Submitting job.");

    let output = match ctx.cluster.submit(&request).await {
      Ok(output) => output,
      Err(e) => {
        let failure = Failure::new(command, String::new(), e.to_string());
        return SubmitOutcome::Failed(handle_failure(ctx, item, failure).await);
      }
    };

    let Some(job_id) = parse_job_id(&output.stdout) else {
      let error = if output.success {
        "submission produced no job id".to_string()
      } else {
        format!("submission exited unsuccessfully ({})", output.status)
      };
      let failure = Failure::new(
        command,
        format!("{}{}", output.stdout, output.stderr),
        error,
      );
      return SubmitOutcome::Failed(handle_failure(ctx, item, failure).await);
    };

    item.assign_cluster_job(job_id, Utc::now(), &ctx.layout);
    PipelineMetrics::incr(&ctx.metrics.cluster_submissions);
    info!(
      unique_id = %item.unique_id(),
      record_id = %item.record_id,
      cluster_job_id = %job_id,
      attempt = item.submission_retry_count(),
      "Submitted cluster job."
    );
    ctx.state.validation_queue.push(item);
    SubmitOutcome::Submitted(job_id)
  }

  async fn owner_finished(&self, item: &Item) -> bool {
    tokio::fs::try_exists(item.finished_lock_path())
      .await
      .unwrap_or(false)
  }

  /// Parks a mutation record behind another caller's in-flight run of the same mutation.
  /// Gives up once the record is older than the retry window.
  async fn wait_for_owner(&self, mut item: Item) -> SubmitOutcome {
    let ctx = &self.ctx;
    let now = Utc::now();
    let within_window = now
      .signed_duration_since(item.init_time())
      .to_std()
      .map(|age| age < ctx.config.retry.job_timeout)
      .unwrap_or(true);
    if !within_window {
      let notice = AdminNotice::for_item(
        &item,
        String::new(),
        format!(
          "lock file {} held by another submission for too long",
          item.lock_path().display()
        ),
        false,
      );
      escalate(ctx, item, notice).await;
      return SubmitOutcome::Failed(RetryDecision::GiveUp);
    }
    debug!(
      unique_id = %item.unique_id(),
      record_id = %item.record_id,
      "Same mutation in flight for another job. Waiting..."
    );
    item.wait_for_lock(ctx.config.retry.backoff_base, now);
    ctx.state.submission_queue.push(item);
    SubmitOutcome::WaitingForLock
  }

  /// Finalizes a parked record from the lock owner's result instead of rerunning it.
  async fn adopt(&self, mut item: Item) -> SubmitOutcome {
    let ctx = &self.ctx;
    let mutation = item.mutation().map(normalize_mutation).unwrap_or_default();
    match ctx.store.finalize_mutation(item.protein_id(), mutation).await {
      Ok(status) => {
        info!(
          unique_id = %item.unique_id(),
          job_key = %item.job_key(),
          ?status,
          "Adopted result of a concurrent run."
        );
        ctx.state.remove_from_monitored(&item);
        SubmitOutcome::Adopted(status)
      }
      Err(e) => {
        warn!(unique_id = %item.unique_id(), error = %e, "Failed to finalize adopted result.");
        item.wait_for_lock(ctx.config.timing.error_delay, Utc::now());
        ctx.state.submission_queue.push(item);
        SubmitOutcome::WaitingForLock
      }
    }
  }

  /// Processes every record queued when the pass starts.
  pub async fn pass(&self) -> Vec<SubmitOutcome> {
    let queue = &self.ctx.state.submission_queue;
    let timing = &self.ctx.config.timing;
    let mut outcomes = Vec::new();
    for _ in 0..queue.len() {
      let Some(item) = queue.pop() else {
        break;
      };
      let outcome = self.process(item).await;
      let pause = match outcome {
        SubmitOutcome::Deferred => Duration::ZERO,
        SubmitOutcome::Submitted(_) | SubmitOutcome::Failed(_) => timing.submit_interval,
        _ => timing.loop_interval,
      };
      outcomes.push(outcome);
      if self.ctx.shutdown.is_triggered() {
        break;
      }
      tokio::time::sleep(pause).await;
    }
    outcomes
  }

  pub(crate) async fn run(self) {
    info!("Submission loop started.");
    let mut shutdown = self.ctx.shutdown.clone();
    let queue = &self.ctx.state.submission_queue;
    let timing = &self.ctx.config.timing;
    loop {
      tokio::select! {
        biased;
        _ = shutdown.triggered() => break,
        _ = queue.wait_for_item(timing.sweep_interval) => {}
      }
      let outcomes = self.pass().await;
      if shutdown.is_triggered() {
        break;
      }
      // Only deferred records left: wait for new work or the next backoff expiry.
      if !outcomes.is_empty() && outcomes.iter().all(|o| *o == SubmitOutcome::Deferred) {
        tokio::select! {
          biased;
          _ = shutdown.triggered() => break,
          _ = queue.wait_for_push(self.next_due()) => {}
        }
      }
    }
    info!("Submission loop stopped.");
  }

  /// Time until the earliest deferred record becomes due, capped at the sweep interval.
  fn next_due(&self) -> Duration {
    let sweep = self.ctx.config.timing.sweep_interval;
    match self.ctx.state.submission_queue.earliest_due() {
      Some(due) => due
        .signed_duration_since(Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
        .min(sweep),
      None => sweep,
    }
  }
}
