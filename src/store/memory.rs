//! In-memory store used by tests and local development.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use super::{MutationStatus, SiteRecord, Store};
use crate::error::{StoreError, StoreResult};
use crate::job::{ClusterJobId, Fingerprint, JobFamily};
use crate::scoring::{SiteKind, SiteScores};

/// A unit marked as failed via [`Store::mark_units_error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitError {
  pub job_id: String,
  pub protein_id: String,
  pub mutation: Option<String>,
}

#[derive(Debug, Default)]
struct Tables {
  precalculated: HashMap<Fingerprint, ClusterJobId>,
  unit_errors: Vec<UnitError>,
  mutation_status: HashMap<(String, String), (MutationStatus, SiteKind)>,
  /// (protein, mutation) pairs with a core stability result from the cluster pipeline.
  results: HashSet<(String, String)>,
  /// Same for interface results.
  interface_results: HashSet<(String, String)>,
  done_jobs: Vec<String>,
  sites: HashMap<(JobFamily, String, String), Vec<SiteRecord>>,
  scores: Vec<(JobFamily, String, SiteScores)>,
}

/// Thread-safe store backed by hash maps, with failure injection.
///
/// Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
  tables: Arc<Mutex<Tables>>,
  unavailable: Arc<AtomicBool>,
  failing_upserts: Arc<AtomicUsize>,
  upsert_calls: Arc<AtomicUsize>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// While set, every operation fails with [`StoreError::Unavailable`].
  pub fn set_unavailable(&self, unavailable: bool) {
    self.unavailable.store(unavailable, Ordering::SeqCst);
  }

  /// Makes the next `count` cache upserts fail.
  pub fn fail_next_upserts(&self, count: usize) {
    self.failing_upserts.store(count, Ordering::SeqCst);
  }

  pub fn upsert_calls(&self) -> usize {
    self.upsert_calls.load(Ordering::SeqCst)
  }

  pub fn insert_precalculated(&self, fingerprint: Fingerprint, job_id: ClusterJobId) {
    self.tables.lock().precalculated.insert(fingerprint, job_id);
  }

  pub fn precalculated(&self) -> HashMap<Fingerprint, ClusterJobId> {
    self.tables.lock().precalculated.clone()
  }

  /// Records a core stability result so that `finalize_mutation` reports done.
  pub fn insert_result(&self, protein_id: &str, mutation: &str) {
    self
      .tables
      .lock()
      .results
      .insert((protein_id.to_string(), mutation.to_string()));
  }

  /// Records an interface stability result.
  pub fn insert_interface_result(&self, protein_id: &str, mutation: &str) {
    self
      .tables
      .lock()
      .interface_results
      .insert((protein_id.to_string(), mutation.to_string()));
  }

  pub fn insert_sites(
    &self,
    family: JobFamily,
    protein_id: &str,
    mutation: &str,
    sites: Vec<SiteRecord>,
  ) {
    self
      .tables
      .lock()
      .sites
      .insert((family, protein_id.to_string(), mutation.to_string()), sites);
  }

  pub fn unit_errors(&self) -> Vec<UnitError> {
    self.tables.lock().unit_errors.clone()
  }

  pub fn mutation_status(&self, protein_id: &str, mutation: &str) -> Option<MutationStatus> {
    self
      .tables
      .lock()
      .mutation_status
      .get(&(protein_id.to_string(), mutation.to_string()))
      .map(|(status, _)| *status)
  }

  /// The `affectedType` written with the last terminal status.
  pub fn mutation_affected(&self, protein_id: &str, mutation: &str) -> Option<SiteKind> {
    self
      .tables
      .lock()
      .mutation_status
      .get(&(protein_id.to_string(), mutation.to_string()))
      .map(|(_, kind)| *kind)
  }

  pub fn done_jobs(&self) -> Vec<String> {
    self.tables.lock().done_jobs.clone()
  }

  pub fn scores(&self) -> Vec<(JobFamily, String, SiteScores)> {
    self.tables.lock().scores.clone()
  }

  fn check_available(&self) -> StoreResult<()> {
    if self.unavailable.load(Ordering::SeqCst) {
      Err(StoreError::Unavailable("memory store switched off".to_string()))
    } else {
      Ok(())
    }
  }
}

impl Store for MemoryStore {
  fn load_precalculated(&self) -> BoxFuture<'_, StoreResult<HashMap<Fingerprint, ClusterJobId>>> {
    Box::pin(async move {
      self.check_available()?;
      Ok(self.tables.lock().precalculated.clone())
    })
  }

  fn upsert_precalculated<'a>(
    &'a self,
    entries: &'a [(Fingerprint, ClusterJobId)],
  ) -> BoxFuture<'a, StoreResult<()>> {
    Box::pin(async move {
      self.upsert_calls.fetch_add(1, Ordering::SeqCst);
      self.check_available()?;
      let failing = self
        .failing_upserts
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
      if failing.is_ok() {
        return Err(StoreError::Unavailable("injected upsert failure".to_string()));
      }
      let mut tables = self.tables.lock();
      for (fingerprint, job_id) in entries {
        tables.precalculated.entry(fingerprint.clone()).or_insert(*job_id);
      }
      Ok(())
    })
  }

  fn mark_units_error<'a>(
    &'a self,
    job_id: &'a str,
    protein_id: &'a str,
    mutation: Option<&'a str>,
  ) -> BoxFuture<'a, StoreResult<u64>> {
    Box::pin(async move {
      self.check_available()?;
      let mut tables = self.tables.lock();
      let error = UnitError {
        job_id: job_id.to_string(),
        protein_id: protein_id.to_string(),
        mutation: mutation.map(str::to_string),
      };
      if !tables.unit_errors.contains(&error) {
        tables.unit_errors.push(error);
      }
      Ok(1)
    })
  }

  fn finalize_mutation<'a>(
    &'a self,
    protein_id: &'a str,
    mutation: &'a str,
  ) -> BoxFuture<'a, StoreResult<MutationStatus>> {
    Box::pin(async move {
      self.check_available()?;
      let mut tables = self.tables.lock();
      let key = (protein_id.to_string(), mutation.to_string());
      let (status, affected) = if tables.interface_results.contains(&key) {
        (MutationStatus::Done, SiteKind::Interface)
      } else if tables.results.contains(&key) {
        (MutationStatus::Done, SiteKind::Core)
      } else {
        (MutationStatus::Error, SiteKind::Core)
      };
      tables.mutation_status.insert(key, (status, affected));
      Ok(status)
    })
  }

  fn mark_job_done<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, StoreResult<u64>> {
    Box::pin(async move {
      self.check_available()?;
      let mut tables = self.tables.lock();
      if tables.done_jobs.iter().any(|j| j == job_id) {
        return Ok(0);
      }
      tables.done_jobs.push(job_id.to_string());
      Ok(1)
    })
  }

  fn scoring_sites<'a>(
    &'a self,
    family: JobFamily,
    protein_id: &'a str,
    mutation: &'a str,
  ) -> BoxFuture<'a, StoreResult<Vec<SiteRecord>>> {
    Box::pin(async move {
      self.check_available()?;
      Ok(
        self
          .tables
          .lock()
          .sites
          .get(&(family, protein_id.to_string(), mutation.to_string()))
          .cloned()
          .unwrap_or_default(),
      )
    })
  }

  fn save_scores<'a>(
    &'a self,
    family: JobFamily,
    protein_id: &'a str,
    scores: &'a [SiteScores],
  ) -> BoxFuture<'a, StoreResult<()>> {
    Box::pin(async move {
      self.check_available()?;
      let mut tables = self.tables.lock();
      for score in scores {
        tables
          .scores
          .retain(|(f, p, s)| !(*f == family && p == protein_id && s.same_row(score)));
        tables.scores.push((family, protein_id.to_string(), score.clone()));
      }
      Ok(())
    })
  }
}
