pub mod layout;
pub mod request;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::error::RequestError;
use crate::scoring::ScoringSite;

pub use layout::DataLayout;
pub use request::{JobRequest, ProteinJobs, ProteinRequest};

// --- Public Type Aliases ---

/// Identifier of one in-memory record, used only to correlate log lines.
/// Uses UUID v4.
pub type RecordId = Uuid;

// --- Identity Types ---

/// Identifier returned by the batch scheduler for one submitted execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde_snapshots", derive(serde::Serialize))]
pub struct ClusterJobId(pub u64);

impl fmt::Display for ClusterJobId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Which pipeline a request belongs to. Determines scripts, log locations and score tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde_snapshots", derive(serde::Serialize))]
pub enum JobFamily {
  /// User-uploaded structure/sequence.
  Local,
  /// Precomputed proteome database entry.
  Database,
}

impl JobFamily {
  pub fn as_str(&self) -> &'static str {
    match self {
      JobFamily::Local => "local",
      JobFamily::Database => "database",
    }
  }
}

impl fmt::Display for JobFamily {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for JobFamily {
  type Err = RequestError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "local" => Ok(JobFamily::Local),
      "database" => Ok(JobFamily::Database),
      other => Err(RequestError::UnknownJobFamily(other.to_string())),
    }
  }
}

/// The three fixed stages of a request's DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde_snapshots", derive(serde::Serialize))]
pub enum RunType {
  Sequence,
  Model,
  Mutation,
}

impl RunType {
  pub fn as_str(&self) -> &'static str {
    match self {
      RunType::Sequence => "sequence",
      RunType::Model => "model",
      RunType::Mutation => "mutation",
    }
  }

  /// Sequence and model results are shared across requests and cached.
  pub fn is_precalculable(&self) -> bool {
    matches!(self, RunType::Sequence | RunType::Model)
  }
}

impl fmt::Display for RunType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Deterministic key of a unit of work: `<family>.<run_type>.<protein>[.<mutation>]`.
///
/// Used as the precalculation cache key and for completion tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde_snapshots", derive(serde::Serialize))]
pub struct Fingerprint(String);

impl Fingerprint {
  pub fn new(
    family: JobFamily,
    run_type: RunType,
    protein_id: &str,
    mutation: Option<&str>,
  ) -> Self {
    let mut key = format!("{}.{}.{}", family.as_str(), run_type.as_str(), protein_id);
    if let Some(mutation) = mutation {
      key.push('.');
      key.push_str(mutation);
    }
    Fingerprint(key)
  }

  /// Wraps a key read back from the store.
  pub fn from_raw(raw: impl Into<String>) -> Self {
    Fingerprint(raw.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Completion-tracking key: the caller's job id and optional notification address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde_snapshots", derive(serde::Serialize))]
pub struct JobKey {
  pub job_id: String,
  pub job_email: Option<String>,
}

impl JobKey {
  pub fn new(job_id: impl Into<String>, job_email: Option<String>) -> Self {
    Self {
      job_id: job_id.into(),
      job_email,
    }
  }
}

impl fmt::Display for JobKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.job_email {
      Some(email) => write!(f, "{} <{}>", self.job_id, email),
      None => f.write_str(&self.job_id),
    }
  }
}

/// Parameters shared by every record decomposed from one protein of a request.
/// Validated once, at decomposition time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHeader {
  pub job_key: JobKey,
  pub family: JobFamily,
  pub protein_id: String,
  pub structure_file: Option<String>,
  pub sequence_file: Option<String>,
  pub domain_pair_ids: Vec<String>,
}

/// Run-type specific part of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
  Sequence,
  Model,
  Mutation { mutation: String },
}

impl JobKind {
  pub fn run_type(&self) -> RunType {
    match self {
      JobKind::Sequence => RunType::Sequence,
      JobKind::Model => RunType::Model,
      JobKind::Mutation { .. } => RunType::Mutation,
    }
  }
}

/// Strips the chain prefix used by local mutations (`A_G12V` -> `G12V`).
pub fn normalize_mutation(token: &str) -> &str {
  token.rsplit('_').next().unwrap_or(token)
}

// --- Job Record ---

/// One unit of dispatched work.
///
/// The identity (header, kind, fingerprint, prerequisites, lock paths) is fixed at
/// creation. Progress fields are updated in place as the record moves between
/// stages. A record has at most one outstanding cluster job at a time: a new
/// submission is only attempted after the previous lock was released.
#[derive(Debug, Clone)]
pub struct Item {
  pub record_id: RecordId,
  header: Arc<JobHeader>,
  kind: JobKind,
  unique_id: Fingerprint,
  prereqs: Vec<Fingerprint>,
  lock_path: PathBuf,
  finished_lock_path: PathBuf,

  // --- Progress (managed by the pipeline stages) ---
  cluster_job_id: Option<ClusterJobId>,
  init_time: DateTime<Utc>,
  /// First successful cluster submission. Anchors the retry time window.
  start_time: Option<DateTime<Utc>>,
  /// Most recent successful cluster submission. Drives the validation freshness check.
  submitted_at: Option<DateTime<Utc>>,
  submission_retry_count: u32,
  /// Earliest time the next submission attempt may run (retry backoff).
  not_before: Option<DateTime<Utc>>,
  /// Whether this record currently owns `lock_path`.
  lock_held: bool,
  /// Set when another caller's record owned `lock_path` at the last attempt.
  awaiting_lock: bool,
  stdout_path: Option<PathBuf>,
  stderr_path: Option<PathBuf>,
  /// Scoring sub-jobs, populated by the scoring submit loop.
  pub(crate) scoring_sites: Vec<ScoringSite>,
}

impl Item {
  pub fn new(kind: JobKind, header: Arc<JobHeader>, layout: &DataLayout) -> Self {
    let run_type = kind.run_type();
    let mutation = match &kind {
      JobKind::Mutation { mutation } => Some(mutation.as_str()),
      _ => None,
    };
    let unique_id = Fingerprint::new(header.family, run_type, &header.protein_id, mutation);
    let prereqs = match run_type {
      RunType::Mutation => vec![
        Fingerprint::new(header.family, RunType::Sequence, &header.protein_id, None),
        Fingerprint::new(header.family, RunType::Model, &header.protein_id, None),
      ],
      _ => Vec::new(),
    };
    let lock_path = layout.lock_path(run_type, &header.protein_id, mutation, false);
    let finished_lock_path = layout.lock_path(run_type, &header.protein_id, mutation, true);

    Self {
      record_id: Uuid::new_v4(),
      header,
      kind,
      unique_id,
      prereqs,
      lock_path,
      finished_lock_path,
      cluster_job_id: None,
      init_time: Utc::now(),
      start_time: None,
      submitted_at: None,
      submission_retry_count: 0,
      not_before: None,
      lock_held: false,
      awaiting_lock: false,
      stdout_path: None,
      stderr_path: None,
      scoring_sites: Vec::new(),
    }
  }

  /// Overrides the creation time. Used when restoring records and in tests.
  pub fn with_init_time(mut self, init_time: DateTime<Utc>) -> Self {
    self.init_time = init_time;
    self
  }

  // --- Identity accessors ---

  pub fn header(&self) -> &JobHeader {
    &self.header
  }

  pub fn kind(&self) -> &JobKind {
    &self.kind
  }

  pub fn run_type(&self) -> RunType {
    self.kind.run_type()
  }

  pub fn family(&self) -> JobFamily {
    self.header.family
  }

  pub fn protein_id(&self) -> &str {
    &self.header.protein_id
  }

  /// Mutation token for mutation records, `None` otherwise.
  pub fn mutation(&self) -> Option<&str> {
    match &self.kind {
      JobKind::Mutation { mutation } => Some(mutation),
      _ => None,
    }
  }

  pub fn job_key(&self) -> &JobKey {
    &self.header.job_key
  }

  pub fn unique_id(&self) -> &Fingerprint {
    &self.unique_id
  }

  pub fn prereqs(&self) -> &[Fingerprint] {
    &self.prereqs
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }

  pub fn finished_lock_path(&self) -> &Path {
    &self.finished_lock_path
  }

  // --- Progress accessors ---

  pub fn cluster_job_id(&self) -> Option<ClusterJobId> {
    self.cluster_job_id
  }

  pub fn init_time(&self) -> DateTime<Utc> {
    self.init_time
  }

  pub fn start_time(&self) -> Option<DateTime<Utc>> {
    self.start_time
  }

  pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
    self.submitted_at
  }

  pub fn submission_retry_count(&self) -> u32 {
    self.submission_retry_count
  }

  pub fn not_before(&self) -> Option<DateTime<Utc>> {
    self.not_before
  }

  pub fn lock_held(&self) -> bool {
    self.lock_held
  }

  pub fn awaiting_lock(&self) -> bool {
    self.awaiting_lock
  }

  pub fn stdout_path(&self) -> Option<&Path> {
    self.stdout_path.as_deref()
  }

  pub fn stderr_path(&self) -> Option<&Path> {
    self.stderr_path.as_deref()
  }

  pub fn scoring_sites(&self) -> &[ScoringSite] {
    &self.scoring_sites
  }

  /// Reference point of the retry time window: first cluster start, else creation.
  pub fn age_anchor(&self) -> DateTime<Utc> {
    self.start_time.unwrap_or(self.init_time)
  }

  // --- State transitions ---

  /// Records a successful cluster submission and derives the expected log paths.
  pub fn assign_cluster_job(
    &mut self,
    job_id: ClusterJobId,
    submitted_at: DateTime<Utc>,
    layout: &DataLayout,
  ) {
    self.cluster_job_id = Some(job_id);
    self.submitted_at = Some(submitted_at);
    if self.start_time.is_none() {
      self.start_time = Some(submitted_at);
    }
    let (stdout_path, stderr_path) =
      layout.log_paths(self.header.family, &self.header.protein_id, job_id);
    self.stdout_path = Some(stdout_path);
    self.stderr_path = Some(stderr_path);
  }

  pub(crate) fn mark_lock_acquired(&mut self) {
    self.lock_held = true;
    self.awaiting_lock = false;
  }

  /// Parks the record until `now + delay` while another record owns the lock.
  /// Does not count as a retry.
  pub(crate) fn wait_for_lock(&mut self, delay: std::time::Duration, now: DateTime<Utc>) {
    self.awaiting_lock = true;
    self.not_before = ChronoDuration::from_std(delay)
      .ok()
      .and_then(|delay| now.checked_add_signed(delay));
  }

  pub(crate) fn mark_lock_released(&mut self) {
    self.lock_held = false;
  }

  /// Bumps the retry counter and schedules the next attempt with exponential backoff
  /// (`base * 3^(attempt-1)`, exponent capped at 5).
  pub(crate) fn schedule_retry(&mut self, backoff_base: std::time::Duration, now: DateTime<Utc>) {
    self.submission_retry_count = self.submission_retry_count.saturating_add(1);
    let exponent = std::cmp::min(self.submission_retry_count.saturating_sub(1), 5);
    let factor = 3u32.saturating_pow(exponent);
    let delay = backoff_base.saturating_mul(factor);
    self.not_before = match ChronoDuration::from_std(delay) {
      Ok(delay) => now.checked_add_signed(delay),
      Err(e) => {
        warn!(?delay, error = %e, "Retry backoff does not fit a chrono duration.");
        None
      }
    };
    // The previous cluster job is finished or abandoned; forget it.
    self.cluster_job_id = None;
  }
}

impl fmt::Display for Item {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.cluster_job_id {
      Some(job_id) => write!(
        f,
        "{} {} {}",
        job_id, self.unique_id, self.submission_retry_count
      ),
      None => write!(f, "- {} {}", self.unique_id, self.submission_retry_count),
    }
  }
}
