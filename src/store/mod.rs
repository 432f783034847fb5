//! Persistent store boundary.
//!
//! The pipeline only needs a handful of idempotent reads and writes. Every write
//! is an upsert or a conditional update, so replaying it after a retry is safe.

pub mod memory;
#[cfg(feature = "mysql_store")]
pub mod mysql;

use std::collections::HashMap;

use futures::future::BoxFuture;

use crate::error::StoreResult;
use crate::job::{ClusterJobId, Fingerprint, JobFamily};
use crate::scoring::{SiteKind, SiteScores};

pub use memory::MemoryStore;
#[cfg(feature = "mysql_store")]
pub use mysql::MySqlStore;

/// One structure/mutation pair implicated by a mutation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteRecord {
  pub kind: SiteKind,
  /// Domain id (core sites) or domain-pair id (interface sites).
  pub domain_or_interface_id: i64,
  /// Structure path, relative to the data root or absolute.
  pub structure_file: String,
  pub chain_id: String,
  /// The mutation renumbered to the model (`mutation_modeller`).
  pub mutation: String,
}

/// Terminal status written for one mutation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde_snapshots", derive(serde::Serialize))]
pub enum MutationStatus {
  Done,
  Error,
}

pub trait Store: Send + Sync {
  /// Reads the whole fingerprint -> cluster job id cache table.
  fn load_precalculated(&self) -> BoxFuture<'_, StoreResult<HashMap<Fingerprint, ClusterJobId>>>;

  /// Upserts cache entries. Existing rows keep their job id.
  fn upsert_precalculated<'a>(
    &'a self,
    entries: &'a [(Fingerprint, ClusterJobId)],
  ) -> BoxFuture<'a, StoreResult<()>>;

  /// Marks the work unit(s) of a caller job as failed.
  /// `mutation = None` covers every mutation of the protein.
  fn mark_units_error<'a>(
    &'a self,
    job_id: &'a str,
    protein_id: &'a str,
    mutation: Option<&'a str>,
  ) -> BoxFuture<'a, StoreResult<u64>>;

  /// Writes done or error for one mutation depending on whether a core or interface
  /// ddG row exists. The affected type is `IN` if an interface row exists, else `CO`.
  fn finalize_mutation<'a>(
    &'a self,
    protein_id: &'a str,
    mutation: &'a str,
  ) -> BoxFuture<'a, StoreResult<MutationStatus>>;

  /// Marks a caller job as finished.
  fn mark_job_done<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, StoreResult<u64>>;

  /// Lists the core and interface sites of a (normalized) mutation.
  fn scoring_sites<'a>(
    &'a self,
    family: JobFamily,
    protein_id: &'a str,
    mutation: &'a str,
  ) -> BoxFuture<'a, StoreResult<Vec<SiteRecord>>>;

  /// Persists secondary scores, one row per site.
  fn save_scores<'a>(
    &'a self,
    family: JobFamily,
    protein_id: &'a str,
    scores: &'a [SiteScores],
  ) -> BoxFuture<'a, StoreResult<()>>;
}
