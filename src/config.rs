//! Pipeline configuration.
//!
//! Loaded from TOML (`Config::load`, `Config::from_toml_str`) or built in code
//! with [`Config::new`]. Every section is optional and falls back to defaults
//! that match the production deployment; only `data_dir` is mandatory.
//!
//! ```toml
//! data_dir = "/srv/data"
//!
//! [cluster]
//! user = "pipeline"
//! host = "slurm-master"
//!
//! [retry]
//! max_retries = 4
//! job_timeout = 172800  # seconds
//!
//! [timing]
//! poll_interval = 30
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::job::RunType;

/// Top-level configuration for a pipeline instance.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Shared data root. Lock files, cluster logs and structure files live below it.
  pub data_dir: PathBuf,
  #[serde(default)]
  pub cluster: ClusterConfig,
  #[serde(default)]
  pub profiles: Profiles,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub timing: Timing,
  #[serde(default)]
  pub scoring: ScoringConfig,
  #[serde(default)]
  pub store: StoreConfig,
}

impl Config {
  /// Creates a configuration with defaults for everything except the data root.
  pub fn new(data_dir: impl Into<PathBuf>) -> Self {
    Self {
      data_dir: data_dir.into(),
      cluster: ClusterConfig::default(),
      profiles: Profiles::default(),
      retry: RetryConfig::default(),
      timing: Timing::default(),
      scoring: ScoringConfig::default(),
      store: StoreConfig::default(),
    }
  }

  pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
    Ok(toml::from_str(raw)?)
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_toml_str(&raw)
  }

  /// Directory holding the per-family cluster scripts (`local.sh`, `database.sh`).
  pub fn scripts_dir(&self) -> PathBuf {
    self
      .cluster
      .scripts_dir
      .clone()
      .unwrap_or_else(|| self.data_dir.join("scripts"))
  }
}

/// How to reach the batch cluster.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
  pub ssh_program: String,
  /// Service account on the cluster head node. Also used to filter the job listing.
  pub user: String,
  pub host: String,
  pub submit_program: String,
  pub list_program: String,
  /// Defaults to `<data_dir>/scripts`.
  pub scripts_dir: Option<PathBuf>,
  /// Extra environment passed to every submitted script (database coordinates etc.).
  pub script_env: BTreeMap<String, String>,
}

impl Default for ClusterConfig {
  fn default() -> Self {
    Self {
      ssh_program: "ssh".to_string(),
      user: String::new(),
      host: String::new(),
      submit_program: "sbatch".to_string(),
      list_program: "squeue".to_string(),
      scripts_dir: None,
      script_env: BTreeMap::new(),
    }
  }
}

/// Fixed resource request for one run type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceProfile {
  /// Numeric stage selector understood by the cluster-side script.
  pub run_code: u8,
  pub cores: u32,
  /// Wall-clock limit in `HH:MM:SS`.
  pub wall_time: String,
  pub memory: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Profiles {
  pub sequence: ResourceProfile,
  pub model: ResourceProfile,
  pub mutation: ResourceProfile,
}

impl Profiles {
  pub fn for_run_type(&self, run_type: RunType) -> &ResourceProfile {
    match run_type {
      RunType::Sequence => &self.sequence,
      RunType::Model => &self.model,
      RunType::Mutation => &self.mutation,
    }
  }
}

impl Default for Profiles {
  fn default() -> Self {
    let profile = |run_code, memory: &str| ResourceProfile {
      run_code,
      cores: 1,
      wall_time: "24:00:00".to_string(),
      memory: memory.to_string(),
    };
    Self {
      sequence: profile(1, "24G"),
      model: profile(2, "24G"),
      mutation: profile(3, "12G"),
    }
  }
}

/// Bounds shared by the retry/escalation policy and the dependency gate.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Resubmissions allowed after the first attempt.
  pub max_retries: u32,
  /// Age limit for retries, measured from the first cluster start (or creation).
  #[serde(with = "secs")]
  pub job_timeout: Duration,
  /// How long a mutation record may wait for its prerequisites.
  #[serde(with = "secs")]
  pub gate_timeout: Duration,
  /// Base delay of the exponential resubmission backoff.
  #[serde(with = "secs")]
  pub backoff_base: Duration,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: 4,
      job_timeout: Duration::from_secs(48 * 3600),
      gate_timeout: Duration::from_secs(48 * 3600),
      backoff_base: Duration::from_secs(30),
    }
  }
}

/// Loop pacing. All values are seconds in TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timing {
  /// Pause between two records within one pass.
  #[serde(with = "secs")]
  pub loop_interval: Duration,
  /// Pause between two cluster submissions.
  #[serde(with = "secs")]
  pub submit_interval: Duration,
  /// Cluster status refresh period.
  #[serde(with = "secs")]
  pub poll_interval: Duration,
  /// Pause between passes over the gate, validation and finalizer queues.
  #[serde(with = "secs")]
  pub sweep_interval: Duration,
  /// Pause between passes over the scoring-running queue.
  #[serde(with = "secs")]
  pub scoring_sweep_interval: Duration,
  #[serde(with = "secs")]
  pub flush_interval: Duration,
  /// Back-off after a failed external call.
  #[serde(with = "secs")]
  pub error_delay: Duration,
  #[serde(with = "secs")]
  pub stats_interval: Duration,
}

impl Default for Timing {
  fn default() -> Self {
    Self {
      loop_interval: Duration::from_millis(10),
      submit_interval: Duration::from_millis(500),
      poll_interval: Duration::from_secs(30),
      sweep_interval: Duration::from_secs(15),
      scoring_sweep_interval: Duration::from_secs(30),
      flush_interval: Duration::from_secs(10),
      error_delay: Duration::from_secs(60),
      stats_interval: Duration::from_secs(300),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
  /// Base URL of the scoring service (jobs are posted to `<base_url>/jobs`).
  pub base_url: String,
  /// Public prefix that replaces `data_dir` when handing structure files to the service.
  pub structure_base_url: String,
  /// Size of the auxiliary pool used for structure parsing.
  pub blocking_workers: usize,
  #[serde(with = "secs")]
  pub request_timeout: Duration,
  /// Version tag stored next to every score.
  pub version: String,
}

impl Default for ScoringConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8000".to_string(),
      structure_base_url: "http://localhost/static".to_string(),
      blocking_workers: 4,
      request_timeout: Duration::from_secs(30),
      version: "0.1.13".to_string(),
    }
  }
}

/// Connection strings for the MySQL store.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// Database holding the precalculation cache table.
  pub cache_url: String,
  /// Database holding job, mutation and score tables.
  pub web_url: String,
}

/// (De)serializes a `Duration` as a (fractional) number of seconds.
mod secs {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer};

  pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
  where
    D: Deserializer<'de>,
  {
    let secs = f64::deserialize(deserializer)?;
    if !secs.is_finite() || secs < 0.0 {
      return Err(serde::de::Error::custom(format!(
        "duration must be a non-negative number of seconds, got {secs}"
      )));
    }
    Ok(Duration::from_secs_f64(secs))
  }
}
