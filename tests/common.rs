//! tests/common.rs
//! Shared fakes and helpers for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use futures::future::BoxFuture;
use jobsubmitter::{
  cluster::{Cluster, CommandOutput, SubmitRequest},
  config::Config,
  context::PipelineContext,
  error::{ClusterError, NotifyError, ScoringError},
  job::{ClusterJobId, Item, JobRequest, ProteinRequest},
  notify::{AdminNotice, NotificationKind, Notifier},
  scoring::{RemoteScore, RemoteStatus, ScoringClient, ScoringRequest},
  shutdown::{self, ShutdownTrigger},
  store::MemoryStore,
};
use parking_lot::Mutex;
use tempfile::TempDir;
use tracing_subscriber::fmt::TestWriter;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// --- Fake cluster ---

/// Scripted batch cluster. Submissions without a scripted reply succeed with
/// increasing job ids starting at 1000.
#[derive(Debug, Default)]
pub struct FakeCluster {
  replies: Mutex<VecDeque<Result<CommandOutput, String>>>,
  submitted: Mutex<Vec<SubmitRequest>>,
  listing: Mutex<String>,
  next_id: AtomicU64,
}

impl FakeCluster {
  pub fn new() -> Self {
    Self {
      next_id: AtomicU64::new(1000),
      ..Self::default()
    }
  }

  /// Queues the stdout of the next submission.
  pub fn reply_stdout(&self, stdout: &str) {
    self.replies.lock().push_back(Ok(CommandOutput {
      success: true,
      status: "exit status: 0".to_string(),
      stdout: stdout.to_string(),
      stderr: String::new(),
    }));
  }

  /// Makes the next submission fail to spawn.
  pub fn reply_spawn_error(&self, message: &str) {
    self.replies.lock().push_back(Err(message.to_string()));
  }

  pub fn set_running(&self, ids: &[u64]) {
    let mut listing = String::from("JOBID PARTITION NAME USER ST TIME NODES\n");
    for id in ids {
      listing.push_str(&format!("{id} cpu job pipeline R 0:01 1\n"));
    }
    *self.listing.lock() = listing;
  }

  pub fn submissions(&self) -> Vec<SubmitRequest> {
    self.submitted.lock().clone()
  }

  pub fn submit_count(&self) -> usize {
    self.submitted.lock().len()
  }
}

impl Cluster for FakeCluster {
  fn submit<'a>(
    &'a self,
    request: &'a SubmitRequest,
  ) -> BoxFuture<'a, Result<CommandOutput, ClusterError>> {
    Box::pin(async move {
      self.submitted.lock().push(request.clone());
      let reply = self.replies.lock().pop_front();
      match reply {
        Some(Ok(output)) => Ok(output),
        Some(Err(message)) => Err(ClusterError::Spawn {
          program: "ssh".to_string(),
          source: std::io::Error::new(std::io::ErrorKind::NotFound, message),
        }),
        None => {
          let id = self.next_id.fetch_add(1, Ordering::SeqCst);
          Ok(CommandOutput {
            success: true,
            status: "exit status: 0".to_string(),
            stdout: format!("Submitted batch job {id}\n"),
            stderr: String::new(),
          })
        }
      }
    })
  }

  fn list_jobs(&self) -> BoxFuture<'_, Result<String, ClusterError>> {
    Box::pin(async move { Ok(self.listing.lock().clone()) })
  }

  fn describe(&self, request: &SubmitRequest) -> String {
    format!("sbatch {}", request.script.display())
  }
}

// --- Fake scoring service ---

#[derive(Debug, Default)]
pub struct FakeScoring {
  posted: Mutex<Vec<(String, ScoringRequest)>>,
  statuses: Mutex<HashMap<String, RemoteStatus>>,
  results: Mutex<HashMap<String, Vec<RemoteScore>>>,
  deleted: Mutex<Vec<String>>,
  failing_posts: AtomicUsize,
  counter: AtomicUsize,
}

impl FakeScoring {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fail_next_posts(&self, count: usize) {
    self.failing_posts.store(count, Ordering::SeqCst);
  }

  /// Polling URLs in posting order.
  pub fn posted_urls(&self) -> Vec<String> {
    self.posted.lock().iter().map(|(url, _)| url.clone()).collect()
  }

  pub fn posted_requests(&self) -> Vec<ScoringRequest> {
    self.posted.lock().iter().map(|(_, req)| req.clone()).collect()
  }

  pub fn complete(&self, web_url: &str, scores: Vec<RemoteScore>) {
    let result_url = format!("{web_url}/result");
    self.results.lock().insert(result_url.clone(), scores);
    self
      .statuses
      .lock()
      .insert(web_url.to_string(), RemoteStatus::Done { result_url });
  }

  pub fn fail(&self, web_url: &str) {
    self
      .statuses
      .lock()
      .insert(web_url.to_string(), RemoteStatus::Failed);
  }

  pub fn deleted(&self) -> Vec<String> {
    self.deleted.lock().clone()
  }
}

impl ScoringClient for FakeScoring {
  fn post_job<'a>(
    &'a self,
    request: &'a ScoringRequest,
  ) -> BoxFuture<'a, Result<String, ScoringError>> {
    Box::pin(async move {
      let failing = self
        .failing_posts
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
      if failing.is_ok() {
        return Err(ScoringError::Transport("injected post failure".to_string()));
      }
      let n = self.counter.fetch_add(1, Ordering::SeqCst);
      let url = format!("http://scoring.test/jobs/{n}");
      self.posted.lock().push((url.clone(), request.clone()));
      Ok(url)
    })
  }

  fn job_status<'a>(
    &'a self,
    web_url: &'a str,
  ) -> BoxFuture<'a, Result<RemoteStatus, ScoringError>> {
    Box::pin(async move {
      Ok(
        self
          .statuses
          .lock()
          .get(web_url)
          .cloned()
          .unwrap_or(RemoteStatus::Pending),
      )
    })
  }

  fn fetch_results<'a>(
    &'a self,
    result_url: &'a str,
  ) -> BoxFuture<'a, Result<Vec<RemoteScore>, ScoringError>> {
    Box::pin(async move {
      self
        .results
        .lock()
        .get(result_url)
        .cloned()
        .ok_or_else(|| ScoringError::Protocol(format!("no results at {result_url}")))
    })
  }

  fn delete_job<'a>(&'a self, web_url: &'a str) -> BoxFuture<'a, Result<(), ScoringError>> {
    Box::pin(async move {
      self.deleted.lock().push(web_url.to_string());
      Ok(())
    })
  }
}

// --- Recording notifier ---

#[derive(Debug, Default)]
pub struct RecordingNotifier {
  admin: Mutex<Vec<AdminNotice>>,
  users: Mutex<Vec<(String, String, NotificationKind)>>,
}

impl RecordingNotifier {
  pub fn admin_notices(&self) -> Vec<AdminNotice> {
    self.admin.lock().clone()
  }

  pub fn user_notices(&self) -> Vec<(String, String, NotificationKind)> {
    self.users.lock().clone()
  }
}

impl Notifier for RecordingNotifier {
  fn notify_admin<'a>(&'a self, notice: &'a AdminNotice) -> BoxFuture<'a, Result<(), NotifyError>> {
    Box::pin(async move {
      self.admin.lock().push(notice.clone());
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
      self
        .users
        .lock()
        .push((job_id.to_string(), email.to_string(), kind));
      Ok(())
    })
  }
}

// --- Harness ---

/// A pipeline context wired to fakes, with a fresh temporary data root.
pub struct Harness {
  pub ctx: PipelineContext,
  pub store: MemoryStore,
  pub cluster: Arc<FakeCluster>,
  pub scoring: Arc<FakeScoring>,
  pub notifier: Arc<RecordingNotifier>,
  pub trigger: ShutdownTrigger,
  pub dir: TempDir,
}

/// Fast loop pacing and no retry backoff.
pub fn test_config(data_dir: &Path) -> Config {
  let mut config = Config::new(data_dir);
  config.cluster.user = "pipeline".to_string();
  config.cluster.host = "cluster.test".to_string();
  config.timing.loop_interval = StdDuration::ZERO;
  config.timing.submit_interval = StdDuration::ZERO;
  config.timing.poll_interval = StdDuration::from_millis(20);
  config.timing.sweep_interval = StdDuration::from_millis(20);
  config.timing.scoring_sweep_interval = StdDuration::from_millis(20);
  config.timing.flush_interval = StdDuration::from_millis(20);
  config.timing.error_delay = StdDuration::from_millis(20);
  config.timing.stats_interval = StdDuration::from_millis(200);
  config.retry.backoff_base = StdDuration::ZERO;
  config.scoring.structure_base_url = "http://static.test".to_string();
  config
}

pub fn harness() -> Harness {
  harness_with(|_| {})
}

pub fn harness_with(adjust: impl FnOnce(&mut Config)) -> Harness {
  let dir = tempfile::tempdir().expect("tempdir");
  let mut config = test_config(dir.path());
  adjust(&mut config);

  let store = MemoryStore::new();
  let cluster = Arc::new(FakeCluster::new());
  let scoring = Arc::new(FakeScoring::new());
  let notifier = Arc::new(RecordingNotifier::default());
  let (trigger, shutdown) = shutdown::channel();
  let ctx = PipelineContext::new(
    config,
    Arc::new(store.clone()),
    cluster.clone(),
    scoring.clone(),
    notifier.clone(),
    shutdown,
  );
  Harness {
    ctx,
    store,
    cluster,
    scoring,
    notifier,
    trigger,
    dir,
  }
}

impl Harness {
  pub fn root(&self) -> PathBuf {
    self.dir.path().to_path_buf()
  }

  /// Writes the stdout log the cluster script would leave behind.
  pub fn write_stdout(&self, item: &Item, contents: &str) {
    let path = item.stdout_path().expect("record has a cluster job");
    std::fs::create_dir_all(path.parent().expect("log dir")).expect("create log dir");
    std::fs::write(path, contents).expect("write log");
  }

  /// Publishes a cluster listing stamped after every submission so far.
  pub fn observe_cluster(&self, running: &[u64]) {
    let ids = running.iter().copied().map(ClusterJobId).collect();
    self
      .ctx
      .state
      .update_running_jobs(ids, chrono::Utc::now() + chrono::Duration::seconds(1));
  }
}

pub fn database_request(job_id: &str, protein_id: &str, mutations: &[&str]) -> JobRequest {
  JobRequest::new(
    job_id,
    Some("user@example.com".to_string()),
    "database",
    vec![ProteinRequest::new(
      protein_id,
      mutations.iter().map(|m| m.to_string()).collect(),
    )],
  )
}
