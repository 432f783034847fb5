//! Terminal status writes, lock cleanup and caller-job completion.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::context::PipelineContext;
use crate::job::{normalize_mutation, Item, JobKey, RunType};
use crate::metrics::PipelineMetrics;
use crate::notify::{notify_user_best_effort, NotificationKind};
use crate::scoring::pipeline::delete_remote;
use crate::store::MutationStatus;

/// Writes done/error for the record's mutation and removes the residual lock
/// files of its protein.
///
/// Only the record's own lock and its protein's sequence/model locks are
/// touched. Returns `None` if the store write failed.
pub async fn finalize_mutation(ctx: &PipelineContext, item: &Item) -> Option<MutationStatus> {
  let status = match item.mutation().map(normalize_mutation) {
    Some(mutation) => match ctx.store.finalize_mutation(item.protein_id(), mutation).await {
      Ok(status) => {
        info!(unique_id = %item.unique_id(), ?status, "Finalized mutation.");
        Some(status)
      }
      Err(e) => {
        error!(unique_id = %item.unique_id(), error = %e, "Failed to finalize mutation.");
        None
      }
    },
    None => None,
  };

  let layout = &ctx.layout;
  let protein_id = item.protein_id();
  let residual = [
    item.lock_path().to_path_buf(),
    layout.lock_path(RunType::Sequence, protein_id, None, false),
    layout.lock_path(RunType::Model, protein_id, None, false),
  ];
  for path in &residual {
    remove_lock_file(path).await;
  }
  status
}

/// What the shutdown sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LingeringSummary {
  pub records: usize,
  pub locks_removed: usize,
}

/// Force-finalizes every record still queued and clears all lock files.
///
/// Runs once, after the loops have stopped. Completion markers under
/// `finished/` are left alone.
pub async fn finalize_lingering_jobs(ctx: &PipelineContext) -> LingeringSummary {
  let mut summary = LingeringSummary::default();
  for queue in ctx.state.queues() {
    let items = queue.drain_all();
    if !items.is_empty() {
      info!(queue = queue.name().as_str(), count = items.len(), "Finalizing lingering records.");
    }
    for item in items {
      if !item.scoring_sites().is_empty() {
        delete_remote(ctx, &item, item.scoring_sites()).await;
      }
      let key = item.job_key();
      let mutation = item.mutation().map(normalize_mutation);
      if let Err(e) = ctx
        .store
        .mark_units_error(&key.job_id, item.protein_id(), mutation)
        .await
      {
        error!(unique_id = %item.unique_id(), error = %e, "Failed to mark lingering record as error.");
      }
      ctx.state.remove_from_monitored(&item);
      summary.records += 1;
    }
  }

  for run_type in [RunType::Sequence, RunType::Model, RunType::Mutation] {
    let dir = ctx.layout.lock_dir(run_type, false);
    summary.locks_removed += clear_lock_dir(&dir).await;
  }
  info!(
    records = summary.records,
    locks_removed = summary.locks_removed,
    "Lingering jobs finalized."
  );
  summary
}

async fn remove_lock_file(path: &Path) -> bool {
  match tokio::fs::remove_file(path).await {
    Ok(()) => {
      debug!(path = %path.display(), "Removed residual lock file.");
      true
    }
    Err(e) if e.kind() == ErrorKind::NotFound => false,
    Err(e) => {
      warn!(path = %path.display(), error = %e, "Failed to remove lock file.");
      false
    }
  }
}

/// Removes every `*.lock` file directly inside `dir`.
async fn clear_lock_dir(dir: &Path) -> usize {
  let mut entries = match tokio::fs::read_dir(dir).await {
    Ok(entries) => entries,
    Err(e) if e.kind() == ErrorKind::NotFound => return 0,
    Err(e) => {
      warn!(dir = %dir.display(), error = %e, "Failed to list lock directory.");
      return 0;
    }
  };
  let mut paths: Vec<PathBuf> = Vec::new();
  loop {
    match entries.next_entry().await {
      Ok(Some(entry)) => {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "lock") && path.is_file() {
          paths.push(path);
        }
      }
      Ok(None) => break,
      Err(e) => {
        warn!(dir = %dir.display(), error = %e, "Failed to read lock directory entry.");
        break;
      }
    }
  }
  let mut removed = 0;
  for path in paths {
    if remove_lock_file(&path).await {
      removed += 1;
    }
  }
  removed
}

// --- Finalizer Watch ---

/// Marks caller jobs done once all of their records have left the pipeline.
#[derive(Debug, Clone)]
pub struct FinalizerWatch {
  ctx: PipelineContext,
}

impl FinalizerWatch {
  pub fn new(ctx: PipelineContext) -> Self {
    Self { ctx }
  }

  /// Completes every caller job whose outstanding set is empty. Returns the
  /// keys that were completed; failed store writes are retried next pass.
  pub async fn pass(&self) -> Vec<JobKey> {
    let ctx = &self.ctx;
    let mut completed = Vec::new();
    for key in ctx.state.completed_jobs() {
      match ctx.store.mark_job_done(&key.job_id).await {
        Ok(_) => {
          notify_user_best_effort(
            ctx.notifier.as_ref(),
            &key.job_id,
            key.job_email.as_deref(),
            NotificationKind::Complete,
          )
          .await;
          if ctx.state.forget_completed(&key) {
            PipelineMetrics::incr(&ctx.metrics.jobs_completed);
            info!(job = %key, "Job complete.");
            completed.push(key);
          }
        }
        Err(e) => error!(job = %key, error = %e, "Failed to mark job as done."),
      }
    }
    completed
  }

  pub(crate) async fn run(self) {
    info!("Finalizer watch loop started.");
    let mut shutdown = self.ctx.shutdown.clone();
    loop {
      self.pass().await;
      if !shutdown.sleep(self.ctx.config.timing.sweep_interval).await {
        break;
      }
    }
    info!("Finalizer watch loop stopped.");
  }
}
