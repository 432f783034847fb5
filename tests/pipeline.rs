mod common;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use jobsubmitter::cluster::{Cluster, CommandOutput, SubmitRequest};
use jobsubmitter::error::{BuildError, ClusterError, RequestError, ShutdownError};
use jobsubmitter::monitor::SUCCESS_MARKER;
use jobsubmitter::{JobSubmitter, MemoryStore, NotificationKind, RunType};

use crate::common::{
  database_request, setup_tracing, test_config, FakeScoring, RecordingNotifier,
};

/// Cluster whose jobs finish instantly, leaving a successful database-family log.
struct InstantCluster {
  root: PathBuf,
  next_id: AtomicU64,
}

impl Cluster for InstantCluster {
  fn submit<'a>(
    &'a self,
    _request: &'a SubmitRequest,
  ) -> BoxFuture<'a, Result<CommandOutput, ClusterError>> {
    Box::pin(async move {
      let id = self.next_id.fetch_add(1, Ordering::SeqCst);
      let dir = self.root.join("pbs-output");
      std::fs::create_dir_all(&dir).map_err(|source| ClusterError::Spawn {
        program: "test".to_string(),
        source,
      })?;
      std::fs::write(dir.join(format!("{id}.out")), format!("{SUCCESS_MARKER}\n")).map_err(
        |source| ClusterError::Spawn {
          program: "test".to_string(),
          source,
        },
      )?;
      Ok(CommandOutput {
        success: true,
        status: "exit status: 0".to_string(),
        stdout: format!("Submitted batch job {id}\n"),
        stderr: String::new(),
      })
    })
  }

  fn list_jobs(&self) -> BoxFuture<'_, Result<String, ClusterError>> {
    Box::pin(async move { Ok("JOBID PARTITION NAME USER ST TIME NODES\n".to_string()) })
  }

  fn describe(&self, request: &SubmitRequest) -> String {
    format!("sbatch {}", request.script.display())
  }
}

/// Cluster whose submissions hang for a while.
#[derive(Default)]
struct SlowCluster {
  started: AtomicBool,
}

impl Cluster for SlowCluster {
  fn submit<'a>(
    &'a self,
    _request: &'a SubmitRequest,
  ) -> BoxFuture<'a, Result<CommandOutput, ClusterError>> {
    Box::pin(async move {
      self.started.store(true, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(800)).await;
      Ok(CommandOutput {
        success: true,
        status: "exit status: 0".to_string(),
        stdout: "Submitted batch job 77\n".to_string(),
        stderr: String::new(),
      })
    })
  }

  fn list_jobs(&self) -> BoxFuture<'_, Result<String, ClusterError>> {
    Box::pin(async move { Ok("JOBID PARTITION NAME USER ST TIME NODES\n".to_string()) })
  }

  fn describe(&self, request: &SubmitRequest) -> String {
    format!("sbatch {}", request.script.display())
  }
}

struct Running {
  submitter: JobSubmitter,
  store: MemoryStore,
  notifier: Arc<RecordingNotifier>,
  _dir: tempfile::TempDir,
}

fn start() -> Running {
  let dir = tempfile::tempdir().expect("tempdir");
  let store = MemoryStore::new();
  let notifier = Arc::new(RecordingNotifier::default());
  let cluster = Arc::new(InstantCluster {
    root: dir.path().to_path_buf(),
    next_id: AtomicU64::new(500),
  });
  let submitter = JobSubmitter::builder()
    .config(test_config(dir.path()))
    .store(Arc::new(store.clone()))
    .cluster(cluster)
    .scoring(Arc::new(FakeScoring::new()))
    .notifier(notifier.clone())
    .build()
    .expect("valid builder");
  Running {
    submitter,
    store,
    notifier,
    _dir: dir,
  }
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
  let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
  while !done() {
    assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
}

#[tokio::test]
async fn builder_requires_collaborators() {
  setup_tracing();
  let dir = tempfile::tempdir().expect("tempdir");
  let err = JobSubmitter::builder()
    .config(test_config(dir.path()))
    .build()
    .unwrap_err();
  assert_eq!(err, BuildError::MissingStore);

  let err = JobSubmitter::builder()
    .store(Arc::new(MemoryStore::new()))
    .build()
    .unwrap_err();
  assert!(matches!(err, BuildError::InvalidConfig(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_runs_to_completion() {
  setup_tracing();
  let running = start();
  let submitter = &running.submitter;

  submitter
    .submit(database_request("42", "P1", &["G12A", "V30L"]))
    .await
    .expect("accepted");
  assert_eq!(
    running.notifier.user_notices()[0].2,
    NotificationKind::Started
  );

  let store = running.store.clone();
  wait_until("job completion", || store.done_jobs() == vec!["42".to_string()]).await;

  wait_until("completion bookkeeping", || {
    submitter.metrics_snapshot().jobs_completed == 1
  })
  .await;
  assert!(running
    .notifier
    .user_notices()
    .iter()
    .any(|(job_id, _, kind)| job_id == "42" && *kind == NotificationKind::Complete));

  // Sequence and model results reach the store through the flush loop.
  let store = running.store.clone();
  wait_until("cache flush", || store.precalculated().len() == 2).await;
  assert!(running.store.unit_errors().is_empty());

  let status = submitter.status();
  assert!(status.gate_queue.is_empty());
  assert!(status.submission_queue.is_empty());
  assert!(status.monitored_jobs.is_empty());

  let metrics = submitter.metrics_snapshot();
  assert_eq!(metrics.records_created, 4);
  assert_eq!(metrics.cluster_submissions, 4);
  assert_eq!(metrics.validations_passed, 4);
  assert_eq!(metrics.jobs_completed, 1);

  let summary = submitter
    .shutdown(Some(Duration::from_secs(5)))
    .await
    .expect("clean shutdown");
  assert_eq!(summary.records, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn precalculated_units_are_not_resubmitted_after_restart() {
  setup_tracing();
  let first = start();
  first
    .submitter
    .submit(database_request("1", "P1", &["G12A"]))
    .await
    .expect("accepted");
  let store = first.store.clone();
  wait_until("cache flush", || store.precalculated().len() == 2).await;
  wait_until("job completion", || store.done_jobs().len() == 1).await;
  first
    .submitter
    .shutdown(Some(Duration::from_secs(5)))
    .await
    .expect("clean shutdown");

  // A second pipeline over the same store sees the cached sequence and model.
  let dir = tempfile::tempdir().expect("tempdir");
  let cluster = Arc::new(InstantCluster {
    root: dir.path().to_path_buf(),
    next_id: AtomicU64::new(900),
  });
  let second = JobSubmitter::builder()
    .config(test_config(dir.path()))
    .store(Arc::new(first.store.clone()))
    .cluster(cluster)
    .scoring(Arc::new(FakeScoring::new()))
    .build()
    .expect("valid builder");
  second.refresh_precalculated().await.expect("refresh");
  second
    .submit(database_request("2", "P1", &["G12A"]))
    .await
    .expect("accepted");

  let store = first.store.clone();
  wait_until("second job completion", || store.done_jobs().len() == 2).await;
  let metrics = second.metrics_snapshot();
  assert_eq!(metrics.records_created, 3);
  assert_eq!(metrics.cluster_submissions, 1);
  second
    .shutdown(Some(Duration::from_secs(5)))
    .await
    .expect("clean shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_sweeps_and_rejects_new_work() {
  setup_tracing();
  let running = start();
  let submitter = &running.submitter;
  let layout = submitter.context().layout.clone();
  let stale = layout.lock_path(RunType::Sequence, "P77", None, false);
  std::fs::create_dir_all(stale.parent().expect("lock dir")).expect("lock dir");
  std::fs::write(&stale, b"").expect("stale lock");

  let summary = submitter
    .shutdown(Some(Duration::from_secs(5)))
    .await
    .expect("clean shutdown");
  assert_eq!(summary.records, 0);
  assert_eq!(summary.locks_removed, 1);
  assert!(!stale.exists());

  assert_eq!(
    submitter.submit(database_request("3", "P1", &["G12A"])).await,
    Err(RequestError::ShuttingDown)
  );
  assert!(matches!(
    submitter.shutdown(None).await,
    Err(ShutdownError::AlreadyShuttingDown)
  ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_shutdown_aborts_loops_before_sweeping() {
  setup_tracing();
  let dir = tempfile::tempdir().expect("tempdir");
  let store = MemoryStore::new();
  let cluster = Arc::new(SlowCluster::default());
  let submitter = JobSubmitter::builder()
    .config(test_config(dir.path()))
    .store(Arc::new(store.clone()))
    .cluster(cluster.clone())
    .scoring(Arc::new(FakeScoring::new()))
    .build()
    .expect("valid builder");

  submitter
    .submit(database_request("11", "P1", &["G12A"]))
    .await
    .expect("accepted");
  wait_until("submission in flight", || cluster.started.load(Ordering::SeqCst)).await;
  let layout = submitter.context().layout.clone();
  let sequence_lock = layout.lock_path(RunType::Sequence, "P1", None, false);
  assert!(sequence_lock.exists());

  assert!(matches!(
    submitter.shutdown(Some(Duration::from_millis(50))).await,
    Err(ShutdownError::Timeout)
  ));
  // Model and mutation records were still queued.
  assert_eq!(store.unit_errors().len(), 2);
  assert!(!sequence_lock.exists());

  // Give an unaborted submission ample time to finish and requeue.
  tokio::time::sleep(Duration::from_millis(1200)).await;
  let status = submitter.status();
  assert!(status.submission_queue.is_empty());
  assert!(status.validation_queue.is_empty());
  assert!(status.gate_queue.is_empty());
  assert!(!sequence_lock.exists());
}
