//! Two-tier cache of completed sequence/model work.
//!
//! `durable` mirrors the store's cache table. `buffer` holds completions that
//! have not been persisted yet. A small recency set short-circuits lookups of
//! hot fingerprints (the prerequisites of every mutation of a protein).

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::context::PipelineContext;
use crate::error::StoreResult;
use crate::job::{ClusterJobId, Fingerprint};
use crate::store::Store;

/// Capacity of the recency set.
pub const RECENT_CAPACITY: usize = 512;

#[derive(Debug)]
pub struct PrecalculatedCache {
  recent: Mutex<VecDeque<Fingerprint>>,
  buffer: Mutex<HashMap<Fingerprint, ClusterJobId>>,
  durable: Mutex<HashMap<Fingerprint, ClusterJobId>>,
  // Serializes `refresh` with itself and with flushes.
  refresh_lock: tokio::sync::Mutex<()>,
}

impl Default for PrecalculatedCache {
  fn default() -> Self {
    Self::new()
  }
}

impl PrecalculatedCache {
  pub fn new() -> Self {
    Self {
      recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
      buffer: Mutex::new(HashMap::new()),
      durable: Mutex::new(HashMap::new()),
      refresh_lock: tokio::sync::Mutex::new(()),
    }
  }

  /// Whether the unit is known to be complete (recency set, then buffer, then durable view).
  pub fn has(&self, fingerprint: &Fingerprint) -> bool {
    if self.recent.lock().contains(fingerprint) {
      return true;
    }
    let hit = self.buffer.lock().contains_key(fingerprint)
      || self.durable.lock().contains_key(fingerprint);
    if hit {
      let mut recent = self.recent.lock();
      if !recent.contains(fingerprint) {
        if recent.len() >= RECENT_CAPACITY {
          recent.pop_back();
        }
        recent.push_front(fingerprint.clone());
      }
    }
    hit
  }

  pub fn has_all(&self, fingerprints: &[Fingerprint]) -> bool {
    fingerprints.iter().all(|fingerprint| self.has(fingerprint))
  }

  /// Adds a completion to the write buffer.
  pub fn record(&self, fingerprint: Fingerprint, job_id: ClusterJobId) {
    debug!(unique_id = %fingerprint, cluster_job_id = %job_id, "Buffered precalculated result.");
    self.buffer.lock().insert(fingerprint, job_id);
  }

  /// Replaces the durable view with the store's contents.
  pub async fn refresh(&self, store: &dyn Store) -> StoreResult<usize> {
    let _guard = self.refresh_lock.lock().await;
    let entries = store.load_precalculated().await?;
    let count = entries.len();
    *self.durable.lock() = entries;
    info!(entries = count, "Loaded precalculated results from the store.");
    Ok(count)
  }

  /// Persists the buffer once. Returns the number of entries written.
  ///
  /// On failure nothing changes. On success the written entries move from the
  /// buffer to the durable view; entries buffered during the write stay buffered.
  pub async fn flush_once(&self, store: &dyn Store) -> StoreResult<usize> {
    let _guard = self.refresh_lock.lock().await;
    let pending: Vec<(Fingerprint, ClusterJobId)> = self
      .buffer
      .lock()
      .iter()
      .map(|(fingerprint, job_id)| (fingerprint.clone(), *job_id))
      .collect();
    if pending.is_empty() {
      return Ok(0);
    }

    store.upsert_precalculated(&pending).await?;

    self.durable.lock().extend(pending.iter().cloned());
    let mut buffer = self.buffer.lock();
    for (fingerprint, job_id) in &pending {
      if buffer.get(fingerprint) == Some(job_id) {
        buffer.remove(fingerprint);
      }
    }
    Ok(pending.len())
  }

  pub fn buffered(&self) -> HashMap<Fingerprint, ClusterJobId> {
    self.buffer.lock().clone()
  }

  pub fn durable(&self) -> HashMap<Fingerprint, ClusterJobId> {
    self.durable.lock().clone()
  }

  pub fn buffered_len(&self) -> usize {
    self.buffer.lock().len()
  }

  pub fn durable_len(&self) -> usize {
    self.durable.lock().len()
  }

  /// Number of fingerprints in the recency set. Never exceeds [`RECENT_CAPACITY`].
  pub fn recent_len(&self) -> usize {
    self.recent.lock().len()
  }
}

/// Write-behind loop. Store failures are retried silently after `error_delay`.
pub(crate) async fn flush_loop(ctx: PipelineContext) {
  info!("Precalculated flush loop started.");
  let mut shutdown = ctx.shutdown.clone();
  loop {
    let delay = match ctx.state.precalculated.flush_once(ctx.store.as_ref()).await {
      Ok(0) => ctx.config.timing.flush_interval,
      Ok(count) => {
        ctx.metrics.record_cache_flush(count);
        debug!(entries = count, "Flushed precalculated results.");
        ctx.config.timing.flush_interval
      }
      Err(e) => {
        ctx.metrics.record_cache_flush_failure();
        error!(
          error = %e,
          buffered = ctx.state.precalculated.buffered_len(),
          "Failed to persist precalculated results."
        );
        ctx.config.timing.error_delay
      }
    };
    if !shutdown.sleep(delay).await {
      break;
    }
  }
  info!("Precalculated flush loop stopped.");
}
