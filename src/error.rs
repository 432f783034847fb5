use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while building a `JobSubmitter` via `JobSubmitterBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("A persistent store must be provided (`store`)")]
  MissingStore,
  #[error("A cluster client must be provided (`cluster`)")]
  MissingCluster,
  #[error("A scoring service client must be provided (`scoring`)")]
  MissingScoring,
  #[error("Invalid configuration: {0}")]
  InvalidConfig(String),
}

/// Errors raised while validating and decomposing an incoming job request.
///
/// These are *domain* errors: they are never retried and are surfaced to the
/// caller of `JobSubmitter::submit` immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
  #[error("Job id must not be empty")]
  EmptyJobId,
  #[error("Unknown job family '{0}' (expected 'local' or 'database')")]
  UnknownJobFamily(String),
  #[error("Request contains no proteins")]
  NoProteins,
  #[error("Invalid protein id '{0}'")]
  InvalidProteinId(String),
  #[error("Protein '{protein_id}' has no mutations")]
  NoMutations { protein_id: String },
  #[error("Invalid mutation '{mutation}' for protein '{protein_id}'")]
  InvalidMutation { protein_id: String, mutation: String },
  #[error("Local job for protein '{protein_id}' requires a structure file")]
  MissingStructureFile { protein_id: String },
  #[error("Invalid file reference '{0}'")]
  InvalidFileReference(String),
  #[error("Pipeline is shutting down")]
  ShuttingDown,
}

/// Errors from the persistent store collaborator.
#[derive(Error, Debug)]
pub enum StoreError {
  #[error("Store unavailable: {0}")]
  Unavailable(String),
  #[error("Store query failed: {0}")]
  Query(String),
  #[cfg(feature = "mysql_store")]
  #[error(transparent)]
  Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from invoking the external cluster scheduler.
#[derive(Error, Debug)]
pub enum ClusterError {
  #[error("Failed to spawn '{program}': {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },
  #[error("Cluster command exited unsuccessfully ({status}): {stderr}")]
  CommandFailed { status: String, stderr: String },
}

/// Failures while extracting the scoring inputs from a structure file.
/// All variants are domain errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructureError {
  #[error("Structure file not found: {0}")]
  Missing(PathBuf),
  #[error("Structure file {0} is outside the permitted data root")]
  OutsideDataRoot(PathBuf),
  #[error("Failed to read structure file {path}: {message}")]
  Unreadable { path: PathBuf, message: String },
  #[error("Chain '{chain_id}' has no residues in {path}")]
  NoProteinChain { path: PathBuf, chain_id: String },
  #[error("No ligand chain found in {0} for an interface mutation")]
  NoLigandChain(PathBuf),
  #[error("Malformed mutation '{0}'")]
  MalformedMutation(String),
  #[error("Mutation '{mutation}' does not match the extracted sequence (found '{found}')")]
  MutationMismatch { mutation: String, found: String },
}

/// Errors from the scoring sub-pipeline.
#[derive(Error, Debug)]
pub enum ScoringError {
  #[error("Scoring service request failed: {0}")]
  Transport(String),
  #[error("Unexpected scoring service response: {0}")]
  Protocol(String),
  #[error(transparent)]
  Structure(#[from] StructureError),
  #[error("Structure extraction worker failed: {0}")]
  Worker(String),
}

impl ScoringError {
  /// Splits off domain errors, which are never retried. Everything else is transient.
  pub fn into_domain(self) -> Result<StructureError, ScoringError> {
    match self {
      ScoringError::Structure(e) => Ok(e),
      other => Err(other),
    }
  }
}

/// Errors from the notification collaborator. Always logged, never propagated.
#[derive(Error, Debug)]
pub enum NotifyError {
  #[error("Notification delivery failed: {0}")]
  Delivery(String),
}

/// Errors while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read config file {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Failed to parse config: {0}")]
  Parse(#[from] toml::de::Error),
}

// --- Shutdown Errors ---

/// Errors related to the pipeline shutdown process (`JobSubmitter::shutdown`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (pipeline already shut down).")]
  SignalFailed,
  #[error("Timed out waiting for pipeline loops to stop.")]
  Timeout,
  #[error("A pipeline loop panicked during the shutdown process.")]
  TaskPanic,
  #[error("Shutdown already in progress or completed.")]
  AlreadyShuttingDown,
}
