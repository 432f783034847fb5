use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cluster::Cluster;
use crate::config::Config;
use crate::context::PipelineContext;
use crate::error::{BuildError, RequestError, ShutdownError, StoreResult};
use crate::finalize::{finalize_lingering_jobs, FinalizerWatch, LingeringSummary};
use crate::job::{Fingerprint, JobKey, JobRequest, ProteinJobs};
use crate::metrics::MetricsSnapshot;
use crate::monitor::{ClusterMonitor, Validation};
use crate::notify::{notify_user_best_effort, LogNotifier, NotificationKind, Notifier};
use crate::precalculated::flush_loop;
use crate::scoring::{ScoringClient, ScoringCollect, ScoringSubmit};
use crate::shutdown::{self, ShutdownTrigger};
use crate::store::Store;
use crate::submit::{DependencyGate, Submission};

/// Builder for a running [`JobSubmitter`].
///
/// ```no_run
/// use std::sync::Arc;
/// use jobsubmitter::{Config, JobSubmitter, MemoryStore, LogNotifier};
/// # use jobsubmitter::{cluster::Cluster, scoring::ScoringClient};
///
/// # async fn run(cluster: Arc<dyn Cluster>, scoring: Arc<dyn ScoringClient>) -> Result<(), Box<dyn std::error::Error>> {
/// let submitter = JobSubmitter::builder()
///   .config(Config::load("jobsubmitter.toml")?)
///   .store(Arc::new(MemoryStore::new()))
///   .cluster(cluster)
///   .scoring(scoring)
///   .notifier(Arc::new(LogNotifier))
///   .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct JobSubmitterBuilder {
  config: Option<Config>,
  store: Option<Arc<dyn Store>>,
  cluster: Option<Arc<dyn Cluster>>,
  scoring: Option<Arc<dyn ScoringClient>>,
  notifier: Option<Arc<dyn Notifier>>,
}

impl JobSubmitterBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn config(mut self, config: Config) -> Self {
    self.config = Some(config);
    self
  }

  pub fn store(mut self, store: Arc<dyn Store>) -> Self {
    self.store = Some(store);
    self
  }

  pub fn cluster(mut self, cluster: Arc<dyn Cluster>) -> Self {
    self.cluster = Some(cluster);
    self
  }

  pub fn scoring(mut self, scoring: Arc<dyn ScoringClient>) -> Self {
    self.scoring = Some(scoring);
    self
  }

  /// Defaults to [`LogNotifier`].
  pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
    self.notifier = Some(notifier);
    self
  }

  /// Builds the context and spawns every pipeline loop on the current runtime.
  ///
  /// The submission loop starts after an initial refresh of the precalculated
  /// view, so already computed units are not resubmitted after a restart.
  ///
  /// # Panics
  ///
  /// Panics if called outside a Tokio runtime.
  pub fn build(self) -> Result<JobSubmitter, BuildError> {
    let config = self
      .config
      .ok_or_else(|| BuildError::InvalidConfig("a configuration must be provided".into()))?;
    if config.data_dir.as_os_str().is_empty() {
      return Err(BuildError::InvalidConfig("`data_dir` must not be empty".into()));
    }
    let store = self.store.ok_or(BuildError::MissingStore)?;
    let cluster = self.cluster.ok_or(BuildError::MissingCluster)?;
    let scoring = self.scoring.ok_or(BuildError::MissingScoring)?;
    let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

    let (trigger, shutdown) = shutdown::channel();
    let ctx = PipelineContext::new(config, store, cluster, scoring, notifier, shutdown);
    let handles = spawn_loops(&ctx);
    info!(data_dir = %ctx.config.data_dir.display(), loops = handles.len(), "Job submitter started.");

    Ok(JobSubmitter {
      ctx,
      trigger,
      handles: Arc::new(Mutex::new(handles)),
    })
  }
}

fn spawn_loops(ctx: &PipelineContext) -> Vec<(&'static str, JoinHandle<()>)> {
  let handle = Handle::current();
  let mut handles = Vec::with_capacity(9);

  handles.push(("flush", handle.spawn(flush_loop(ctx.clone()))));
  handles.push(("gate", handle.spawn(DependencyGate::new(ctx.clone()).run())));
  let submission_ctx = ctx.clone();
  handles.push((
    "submission",
    handle.spawn(async move {
      if let Err(e) = submission_ctx
        .state
        .precalculated
        .refresh(submission_ctx.store.as_ref())
        .await
      {
        warn!(error = %e, "Initial refresh of precalculated results failed.");
      }
      Submission::new(submission_ctx).run().await;
    }),
  ));
  handles.push(("monitor", handle.spawn(ClusterMonitor::new(ctx.clone()).run())));
  handles.push(("validation", handle.spawn(Validation::new(ctx.clone()).run())));
  handles.push(("scoring_submit", handle.spawn(ScoringSubmit::new(ctx.clone()).run())));
  handles.push(("scoring_collect", handle.spawn(ScoringCollect::new(ctx.clone()).run())));
  handles.push(("finalizer", handle.spawn(FinalizerWatch::new(ctx.clone()).run())));
  handles.push(("stats", handle.spawn(stats_loop(ctx.clone()))));
  handles
}

/// Contents of every queue and of the completion tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde_snapshots", derive(serde::Serialize))]
pub struct PipelineStatus {
  pub gate_queue: Vec<Fingerprint>,
  pub submission_queue: Vec<Fingerprint>,
  pub validation_queue: Vec<Fingerprint>,
  pub scoring_pending_queue: Vec<Fingerprint>,
  pub scoring_running_queue: Vec<Fingerprint>,
  pub monitored_jobs: HashMap<JobKey, HashSet<Fingerprint>>,
}

/// Handle of a running pipeline.
#[derive(Debug)]
pub struct JobSubmitter {
  ctx: PipelineContext,
  trigger: ShutdownTrigger,
  handles: Arc<Mutex<Vec<(&'static str, JoinHandle<()>)>>>,
}

impl JobSubmitter {
  pub fn builder() -> JobSubmitterBuilder {
    JobSubmitterBuilder::new()
  }

  /// Decomposes a request into job records and enqueues them. Returns once the
  /// records are queued; completion is reported through the store and the
  /// notifier.
  ///
  /// # Errors
  ///
  /// Returns a [`RequestError`] if the request is malformed. Nothing is
  /// enqueued in that case.
  pub async fn submit(&self, request: JobRequest) -> Result<(), RequestError> {
    if self.ctx.shutdown.is_triggered() {
      return Err(RequestError::ShuttingDown);
    }
    enqueue_request(&self.ctx, &request)?;
    notify_user_best_effort(
      self.ctx.notifier.as_ref(),
      &request.job_id,
      request.job_email.as_deref(),
      NotificationKind::Started,
    )
    .await;
    Ok(())
  }

  pub fn status(&self) -> PipelineStatus {
    let state = &self.ctx.state;
    PipelineStatus {
      gate_queue: state.gate_queue.fingerprints(),
      submission_queue: state.submission_queue.fingerprints(),
      validation_queue: state.validation_queue.fingerprints(),
      scoring_pending_queue: state.scoring_pending_queue.fingerprints(),
      scoring_running_queue: state.scoring_running_queue.fingerprints(),
      monitored_jobs: state.monitored_snapshot(),
    }
  }

  pub fn metrics_snapshot(&self) -> MetricsSnapshot {
    metrics_snapshot(&self.ctx)
  }

  /// Reloads the durable precalculated view from the store.
  pub async fn refresh_precalculated(&self) -> StoreResult<usize> {
    self
      .ctx
      .state
      .precalculated
      .refresh(self.ctx.store.as_ref())
      .await
  }

  pub fn context(&self) -> &PipelineContext {
    &self.ctx
  }

  /// Stops every loop, waits for them (up to `timeout`), then force-finalizes
  /// whatever is still queued and clears all lock files.
  ///
  /// Loops still running when `timeout` elapses are aborted. The lingering sweep
  /// only starts once every loop has stopped, and runs even if joining failed.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::AlreadyShuttingDown`]: shutdown was already requested.
  /// - [`ShutdownError::Timeout`]: the loops did not stop in time and were aborted.
  /// - [`ShutdownError::TaskPanic`]: a loop panicked.
  pub async fn shutdown(&self, timeout: Option<Duration>) -> Result<LingeringSummary, ShutdownError> {
    info!("Initiating shutdown...");
    self.trigger.trigger()?;
    let joined = self.await_loops(timeout).await;
    let summary = finalize_lingering_jobs(&self.ctx).await;
    for (key, outstanding) in self.ctx.state.monitored_snapshot() {
      if !outstanding.is_empty() {
        warn!(job_key = %key, records = ?outstanding, "Records held by an aborted loop were not finalized.");
      }
    }
    joined.map(|()| summary)
  }

  async fn await_loops(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    let mut handles = std::mem::take(&mut *self.handles.lock().await);
    if handles.is_empty() {
      warn!("No loops found to await during shutdown.");
      return Ok(());
    }

    let joined = {
      let tasks = handles
        .iter_mut()
        .map(|(name, handle)| async move { (*name, handle.await) });
      let all = join_all(tasks);
      match timeout {
        Some(timeout) => tokio::time::timeout(timeout, all).await.ok(),
        None => Some(all.await),
      }
    };

    let Some(results) = joined else {
      error!("Shutdown timed out after {:?}. Aborting remaining loops.", timeout);
      // Handles that finished were polled to completion already and must not be awaited again.
      let running: Vec<_> = handles
        .into_iter()
        .filter(|(_, handle)| !handle.is_finished())
        .collect();
      for (name, handle) in &running {
        warn!(task = *name, "Aborting loop.");
        handle.abort();
      }
      for (name, handle) in running {
        if let Err(e) = handle.await {
          if !e.is_cancelled() {
            error!(task = name, "Loop panicked: {:?}", e);
          }
        }
      }
      return Err(ShutdownError::Timeout);
    };

    let mut result = Ok(());
    for (name, outcome) in results {
      if let Err(e) = outcome {
        error!(task = name, "Loop panicked: {:?}", e);
        result = Err(ShutdownError::TaskPanic);
      }
    }
    if result.is_ok() {
      info!("All loops stopped.");
    }
    result
  }
}

/// Validates and decomposes a request, registers its mutation records for
/// completion tracking and routes every record to its first queue.
///
/// Sequence and model records already known to be complete are not
/// enqueued; their mutations go straight to submission.
pub fn enqueue_request(ctx: &PipelineContext, request: &JobRequest) -> Result<(), RequestError> {
  let proteins = request.decompose(&ctx.layout)?;
  let key = request.job_key();
  let state = &ctx.state;

  state.monitor(
    key.clone(),
    proteins
      .iter()
      .flat_map(|protein| protein.mutations.iter().map(|item| item.unique_id().clone())),
  );

  let mut created = 0;
  for ProteinJobs { sequence, model, mutations } in proteins {
    created += 2 + mutations.len();
    let ready = state.precalculated.has(sequence.unique_id())
      && state.precalculated.has(model.unique_id());
    if ready {
      info!(job = %key, protein_id = sequence.protein_id(), "Sequence and model already computed.");
      for item in mutations {
        state.submission_queue.push(item);
      }
    } else {
      state.submission_queue.push(sequence);
      state.submission_queue.push(model);
      for item in mutations {
        state.gate_queue.push(item);
      }
    }
  }
  ctx
    .metrics
    .records_created
    .fetch_add(created, std::sync::atomic::Ordering::Relaxed);
  info!(job = %key, records = created, "Job request accepted.");
  Ok(())
}

fn metrics_snapshot(ctx: &PipelineContext) -> MetricsSnapshot {
  let state = &ctx.state;
  MetricsSnapshot {
    gate_queue_len: state.gate_queue.len(),
    submission_queue_len: state.submission_queue.len(),
    validation_queue_len: state.validation_queue.len(),
    scoring_pending_len: state.scoring_pending_queue.len(),
    scoring_running_len: state.scoring_running_queue.len(),
    running_cluster_jobs: state.cluster_snapshot().running.len(),
    cache_buffered: state.precalculated.buffered_len(),
    monitored_job_keys: state.monitored_len(),
    ..ctx.metrics.snapshot()
  }
}

/// Periodic housekeeping log of queue sizes.
async fn stats_loop(ctx: PipelineContext) {
  let mut shutdown = ctx.shutdown.clone();
  while shutdown.sleep(ctx.config.timing.stats_interval).await {
    let snapshot = metrics_snapshot(&ctx);
    info!(
      gate = snapshot.gate_queue_len,
      submission = snapshot.submission_queue_len,
      validation = snapshot.validation_queue_len,
      scoring_pending = snapshot.scoring_pending_len,
      scoring_running = snapshot.scoring_running_len,
      running_cluster_jobs = snapshot.running_cluster_jobs,
      cache_buffered = snapshot.cache_buffered,
      monitored = snapshot.monitored_job_keys,
      "Pipeline stats."
    );
  }
}
