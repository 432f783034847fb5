//! Notification boundary. Delivery is best-effort: callers log failures and move on.

use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

use futures::future::BoxFuture;
use regex::Regex;
use tracing::{info, warn};

use crate::error::NotifyError;
use crate::job::{ClusterJobId, Fingerprint, Item};

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.(?:[a-zA-Z]{2,4}|museum)$")
    .expect("Valid regex")
});

/// Whether an address is acceptable for user notifications.
pub fn is_valid_email(address: &str) -> bool {
  EMAIL_RE.is_match(address)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
  Started,
  Complete,
}

impl fmt::Display for NotificationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      NotificationKind::Started => f.write_str("started"),
      NotificationKind::Complete => f.write_str("complete"),
    }
  }
}

/// What an administrator gets when a record fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminNotice {
  pub cluster_job_id: Option<ClusterJobId>,
  pub unique_id: Fingerprint,
  /// Command that produced the failure, if any.
  pub command: String,
  pub stdout_path: Option<PathBuf>,
  pub stderr_path: Option<PathBuf>,
  pub error: String,
  /// `true` if the record is resubmitted, `false` if it was given up.
  pub restarting: bool,
}

impl AdminNotice {
  pub fn for_item(
    item: &Item,
    command: impl Into<String>,
    error: impl Into<String>,
    restarting: bool,
  ) -> Self {
    Self {
      cluster_job_id: item.cluster_job_id(),
      unique_id: item.unique_id().clone(),
      command: command.into(),
      stdout_path: item.stdout_path().map(PathBuf::from),
      stderr_path: item.stderr_path().map(PathBuf::from),
      error: error.into(),
      restarting,
    }
  }

  pub fn subject(&self) -> String {
    let job = self
      .cluster_job_id
      .map(|id| id.to_string())
      .unwrap_or_else(|| "-".to_string());
    let outcome = if self.restarting { "Restarting..." } else { "Failed!" };
    format!("Job {} ({}) failed. {}", job, self.unique_id, outcome)
  }
}

pub trait Notifier: Send + Sync {
  fn notify_admin<'a>(&'a self, notice: &'a AdminNotice) -> BoxFuture<'a, Result<(), NotifyError>>;

  fn notify_user<'a>(
    &'a self,
    job_id: &'a str,
    email: &'a str,
    kind: NotificationKind,
  ) -> BoxFuture<'a, Result<(), NotifyError>>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn notify_admin<'a>(&'a self, notice: &'a AdminNotice) -> BoxFuture<'a, Result<(), NotifyError>> {
    Box::pin(async move {
      warn!(
        subject = %notice.subject(),
        command = %notice.command,
        stdout = ?notice.stdout_path,
        stderr = ?notice.stderr_path,
        error = %notice.error,
        "Admin notification."
      );
      Ok(())
    })
  }

  fn notify_user<'a>(
    &'a self,
    job_id: &'a str,
    email: &'a str,
    kind: NotificationKind,
  ) -> BoxFuture<'a, Result<(), NotifyError>> {
    Box::pin(async move {
      info!(%job_id, %email, %kind, "User notification.");
      Ok(())
    })
  }
}

/// Sends a user notification if the address looks deliverable. Never fails.
pub(crate) async fn notify_user_best_effort(
  notifier: &dyn Notifier,
  job_id: &str,
  email: Option<&str>,
  kind: NotificationKind,
) {
  let Some(email) = email else {
    return;
  };
  if !is_valid_email(email) {
    warn!(%job_id, %email, %kind, "Skipping notification to invalid address.");
    return;
  }
  if let Err(e) = notifier.notify_user(job_id, email, kind).await {
    warn!(%job_id, %kind, error = %e, "Failed to notify user.");
  }
}

/// Sends an admin notice. Never fails.
pub(crate) async fn notify_admin_best_effort(notifier: &dyn Notifier, notice: &AdminNotice) {
  if let Err(e) = notifier.notify_admin(notice).await {
    warn!(unique_id = %notice.unique_id, error = %e, "Failed to notify administrator.");
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn email_pattern() {
    assert!(is_valid_email("someone@example.org"));
    assert!(is_valid_email("a.b+c@lab.museum"));
    assert!(!is_valid_email("no-at-sign.org"));
    assert!(!is_valid_email("x@y.toolongtld"));
  }
}
