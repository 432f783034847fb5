//! Retry / escalation policy. Every failure path of the pipeline ends here.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use crate::config::RetryConfig;
use crate::context::PipelineContext;
use crate::job::{normalize_mutation, Item};
use crate::metrics::PipelineMetrics;
use crate::notify::{notify_admin_best_effort, AdminNotice};
use crate::submit::release_lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
  /// Back onto the submission queue.
  Retry,
  /// Permanent error.
  GiveUp,
}

/// Bounded retry: at most `max_retries` resubmissions, and only while the record
/// is younger than `job_timeout` (measured from its first cluster start, or from
/// creation if it never started).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  pub max_retries: u32,
  pub job_timeout: Duration,
  pub backoff_base: Duration,
}

impl RetryPolicy {
  pub fn from_config(config: &RetryConfig) -> Self {
    Self {
      max_retries: config.max_retries,
      job_timeout: config.job_timeout,
      backoff_base: config.backoff_base,
    }
  }

  pub fn decide(&self, item: &Item, now: DateTime<Utc>) -> RetryDecision {
    if item.submission_retry_count() >= self.max_retries {
      return RetryDecision::GiveUp;
    }
    let within_window = now
      .signed_duration_since(item.age_anchor())
      .to_std()
      .map(|age| age < self.job_timeout)
      // Negative age (clock skew) counts as fresh.
      .unwrap_or(true);
    if within_window {
      RetryDecision::Retry
    } else {
      RetryDecision::GiveUp
    }
  }
}

/// Diagnostic context of a failed attempt.
#[derive(Debug, Clone, Default)]
pub struct Failure {
  /// Command that was run, if any.
  pub command: String,
  /// Captured output of the command or the inspected log.
  pub output: String,
  pub error: String,
}

impl Failure {
  pub fn new(
    command: impl Into<String>,
    output: impl Into<String>,
    error: impl Into<String>,
  ) -> Self {
    Self {
      command: command.into(),
      output: output.into(),
      error: error.into(),
    }
  }
}

/// Routes a failed record either back to submission or to a permanent error.
///
/// Either way the record's lock is released and an administrator is notified.
pub(crate) async fn handle_failure(
  ctx: &PipelineContext,
  mut item: Item,
  failure: Failure,
) -> RetryDecision {
  let policy = RetryPolicy::from_config(&ctx.config.retry);
  let decision = policy.decide(&item, Utc::now());
  let restarting = decision == RetryDecision::Retry;
  let notice = AdminNotice::for_item(
    &item,
    failure.command.clone(),
    failure.error.clone(),
    restarting,
  );

  match decision {
    RetryDecision::Retry => {
      release_lock(&mut item).await;
      notify_admin_best_effort(ctx.notifier.as_ref(), &notice).await;
      item.schedule_retry(policy.backoff_base, Utc::now());
      warn!(
        unique_id = %item.unique_id(),
        attempt = item.submission_retry_count(),
        command = %failure.command,
        output = %failure.output,
        error = %failure.error,
        not_before = ?item.not_before(),
        "Attempt failed. Restarting..."
      );
      PipelineMetrics::incr(&ctx.metrics.retries);
      ctx.state.submission_queue.push(item);
    }
    RetryDecision::GiveUp => {
      error!(
        unique_id = %item.unique_id(),
        attempt = item.submission_retry_count(),
        command = %failure.command,
        output = %failure.output,
        error = %failure.error,
        "Retry budget exhausted. Giving up."
      );
      escalate(ctx, item, notice).await;
    }
  }
  decision
}

/// Terminates a record as a permanent error.
///
/// Releases its lock, drops it from completion tracking, records the error in
/// the store and notifies an administrator. Store failures are logged only.
pub(crate) async fn escalate(ctx: &PipelineContext, mut item: Item, notice: AdminNotice) {
  release_lock(&mut item).await;
  ctx.state.remove_from_monitored(&item);

  let job_id = item.job_key().job_id.clone();
  let mutation = item.mutation().map(normalize_mutation);
  if let Err(e) = ctx
    .store
    .mark_units_error(&job_id, item.protein_id(), mutation)
    .await
  {
    error!(
      unique_id = %item.unique_id(),
      %job_id,
      error = %e,
      "Failed to record permanent error in the store."
    );
  }
  PipelineMetrics::incr(&ctx.metrics.permanent_errors);
  error!(
    unique_id = %item.unique_id(),
    record_id = %item.record_id,
    %job_id,
    error = %notice.error,
    "Record failed permanently."
  );
  notify_admin_best_effort(ctx.notifier.as_ref(), &notice).await;
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use chrono::Duration as ChronoDuration;

  use super::*;
  use crate::job::{DataLayout, JobFamily, JobHeader, JobKey, JobKind};

  fn item() -> Item {
    let header = Arc::new(JobHeader {
      job_key: JobKey::new("1", None),
      family: JobFamily::Database,
      protein_id: "P1".into(),
      structure_file: None,
      sequence_file: None,
      domain_pair_ids: vec![],
    });
    Item::new(JobKind::Sequence, header, &DataLayout::new("/data"))
  }

  fn policy() -> RetryPolicy {
    RetryPolicy::from_config(&RetryConfig::default())
  }

  #[test]
  fn retries_until_the_count_bound() {
    let mut item = item();
    let now = Utc::now();
    for _ in 0..4 {
      assert_eq!(policy().decide(&item, now), RetryDecision::Retry);
      item.schedule_retry(Duration::ZERO, now);
    }
    assert_eq!(policy().decide(&item, now), RetryDecision::GiveUp);
  }

  #[test]
  fn gives_up_after_the_time_window() {
    let item = item().with_init_time(Utc::now() - ChronoDuration::hours(49));
    assert_eq!(policy().decide(&item, Utc::now()), RetryDecision::GiveUp);
  }

  #[test]
  fn backoff_grows_by_three() {
    let mut item = item();
    let now = Utc::now();
    item.schedule_retry(Duration::from_secs(10), now);
    assert_eq!(item.not_before(), Some(now + ChronoDuration::seconds(10)));
    item.schedule_retry(Duration::from_secs(10), now);
    assert_eq!(item.not_before(), Some(now + ChronoDuration::seconds(30)));
  }
}
