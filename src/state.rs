//! Queues, completion tracking and the cluster snapshot shared by every stage.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::job::{ClusterJobId, Fingerprint, Item, JobKey};
use crate::precalculated::PrecalculatedCache;

/// Names of the five pipeline queues, used in logs and snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde_snapshots", derive(serde::Serialize))]
pub enum QueueName {
  Gate,
  Submission,
  Validation,
  ScoringPending,
  ScoringRunning,
}

impl QueueName {
  pub fn as_str(&self) -> &'static str {
    match self {
      QueueName::Gate => "gate",
      QueueName::Submission => "submission",
      QueueName::Validation => "validation",
      QueueName::ScoringPending => "scoring_pending",
      QueueName::ScoringRunning => "scoring_running",
    }
  }
}

impl fmt::Display for QueueName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Unbounded FIFO of job records. Insertion order is the only ordering guarantee.
#[derive(Debug)]
pub struct JobQueue {
  name: QueueName,
  items: Mutex<VecDeque<Item>>,
  notify: Notify,
}

impl JobQueue {
  pub fn new(name: QueueName) -> Self {
    Self {
      name,
      items: Mutex::new(VecDeque::new()),
      notify: Notify::new(),
    }
  }

  pub fn name(&self) -> QueueName {
    self.name
  }

  pub fn push(&self, item: Item) {
    trace!(queue = %self.name, unique_id = %item.unique_id(), "Enqueued record.");
    self.items.lock().push_back(item);
    self.notify.notify_one();
  }

  pub fn pop(&self) -> Option<Item> {
    self.items.lock().pop_front()
  }

  pub fn len(&self) -> usize {
    self.items.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.lock().is_empty()
  }

  /// Waits until the queue is non-empty or `timeout` elapses.
  /// Returns whether an item is available.
  pub async fn wait_for_item(&self, timeout: Duration) -> bool {
    let notified = self.notify.notified();
    if !self.is_empty() {
      return true;
    }
    let _ = tokio::time::timeout(timeout, notified).await;
    !self.is_empty()
  }

  /// Waits for the next push, regardless of what is already queued.
  pub async fn wait_for_push(&self, timeout: Duration) {
    let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
  }

  /// Removes and returns everything currently queued.
  pub fn drain_all(&self) -> Vec<Item> {
    self.items.lock().drain(..).collect()
  }

  /// Earliest time a queued record may be attempted. Records without a backoff are due now.
  pub fn earliest_due(&self) -> Option<DateTime<Utc>> {
    let now = Utc::now();
    self
      .items
      .lock()
      .iter()
      .map(|item| item.not_before().unwrap_or(now))
      .min()
  }

  pub fn fingerprints(&self) -> Vec<Fingerprint> {
    self
      .items
      .lock()
      .iter()
      .map(|item| item.unique_id().clone())
      .collect()
  }
}

/// Latest successful listing of the service account's cluster jobs.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
  pub running: HashSet<ClusterJobId>,
  /// When the query that produced `running` was issued. `None` until the first refresh.
  pub last_updated: Option<DateTime<Utc>>,
}

impl ClusterSnapshot {
  /// A record may be validated once a listing issued after its submission no longer shows it.
  pub fn is_ready(&self, item: &Item) -> bool {
    let (Some(last_updated), Some(submitted_at)) = (self.last_updated, item.submitted_at()) else {
      return false;
    };
    if submitted_at >= last_updated {
      return false;
    }
    match item.cluster_job_id() {
      Some(job_id) => !self.running.contains(&job_id),
      None => false,
    }
  }
}

/// The sole shared-memory surface between pipeline stages.
///
/// Created once per pipeline instance and passed explicitly. Locks are held only
/// for the duration of a single map or queue operation.
#[derive(Debug)]
pub struct DataStructures {
  pub gate_queue: JobQueue,
  pub submission_queue: JobQueue,
  pub validation_queue: JobQueue,
  pub scoring_pending_queue: JobQueue,
  pub scoring_running_queue: JobQueue,
  pub precalculated: PrecalculatedCache,
  monitored_jobs: Mutex<HashMap<JobKey, HashSet<Fingerprint>>>,
  cluster: Mutex<ClusterSnapshot>,
}

impl Default for DataStructures {
  fn default() -> Self {
    Self::new()
  }
}

impl DataStructures {
  pub fn new() -> Self {
    Self {
      gate_queue: JobQueue::new(QueueName::Gate),
      submission_queue: JobQueue::new(QueueName::Submission),
      validation_queue: JobQueue::new(QueueName::Validation),
      scoring_pending_queue: JobQueue::new(QueueName::ScoringPending),
      scoring_running_queue: JobQueue::new(QueueName::ScoringRunning),
      precalculated: PrecalculatedCache::new(),
      monitored_jobs: Mutex::new(HashMap::new()),
      cluster: Mutex::new(ClusterSnapshot::default()),
    }
  }

  pub fn queues(&self) -> [&JobQueue; 5] {
    [
      &self.gate_queue,
      &self.submission_queue,
      &self.validation_queue,
      &self.scoring_pending_queue,
      &self.scoring_running_queue,
    ]
  }

  // --- Completion tracking ---

  /// Adds outstanding fingerprints under a caller job key.
  pub fn monitor(&self, key: JobKey, unique_ids: impl IntoIterator<Item = Fingerprint>) {
    let mut monitored = self.monitored_jobs.lock();
    monitored.entry(key).or_default().extend(unique_ids);
  }

  /// Removes one record's fingerprint from its caller job. The key itself stays
  /// until the finalizer has reported the job as complete.
  pub fn remove_from_monitored(&self, item: &Item) -> bool {
    let key = item.job_key();
    let mut monitored = self.monitored_jobs.lock();
    match monitored.get_mut(key) {
      Some(outstanding) => {
        let removed = outstanding.remove(item.unique_id());
        debug!(
          job_key = %key,
          unique_id = %item.unique_id(),
          removed,
          remaining = outstanding.len(),
          "Removed record from monitored jobs."
        );
        removed
      }
      None => {
        debug!(job_key = %key, unique_id = %item.unique_id(), "Monitored job key does not exist.");
        false
      }
    }
  }

  /// Keys whose outstanding set is empty.
  pub fn completed_jobs(&self) -> Vec<JobKey> {
    self
      .monitored_jobs
      .lock()
      .iter()
      .filter(|(_, outstanding)| outstanding.is_empty())
      .map(|(key, _)| key.clone())
      .collect()
  }

  /// Drops a key, but only if nothing was added to it in the meantime.
  pub fn forget_completed(&self, key: &JobKey) -> bool {
    let mut monitored = self.monitored_jobs.lock();
    if monitored.get(key).is_some_and(HashSet::is_empty) {
      monitored.remove(key);
      true
    } else {
      false
    }
  }

  pub fn monitored_snapshot(&self) -> HashMap<JobKey, HashSet<Fingerprint>> {
    self.monitored_jobs.lock().clone()
  }

  pub fn monitored_len(&self) -> usize {
    self.monitored_jobs.lock().len()
  }

  // --- Cluster snapshot ---

  /// Replaces the running set wholesale.
  pub fn update_running_jobs(&self, running: HashSet<ClusterJobId>, issued_at: DateTime<Utc>) {
    let mut cluster = self.cluster.lock();
    cluster.running = running;
    cluster.last_updated = Some(issued_at);
  }

  pub fn cluster_snapshot(&self) -> ClusterSnapshot {
    self.cluster.lock().clone()
  }

  pub fn is_ready_for_validation(&self, item: &Item) -> bool {
    self.cluster.lock().is_ready(item)
  }
}
