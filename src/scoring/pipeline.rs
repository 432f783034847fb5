use tracing::{debug, error, info, warn};

use super::structure::build_request;
use super::{RemoteStatus, ScoringRequest, ScoringSite, SiteResult, SiteScores};
use crate::context::PipelineContext;
use crate::error::{ScoringError, StructureError};
use crate::finalize::finalize_mutation;
use crate::job::{normalize_mutation, Item};
use crate::metrics::PipelineMetrics;
use crate::notify::{notify_admin_best_effort, AdminNotice};

// --- Submit loop ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitScoringOutcome {
  /// Sub-jobs posted; record moved to the running queue.
  Posted(usize),
  /// No structural site for this mutation; record finalized.
  NoSites,
  /// Structure problem; record finalized without secondary scores.
  DomainError(StructureError),
  /// Transient failure; record back on the pending queue.
  Requeued,
}

/// Fans validated mutation records out to the scoring service.
#[derive(Debug, Clone)]
pub struct ScoringSubmit {
  ctx: PipelineContext,
}

impl ScoringSubmit {
  pub fn new(ctx: PipelineContext) -> Self {
    Self { ctx }
  }

  pub async fn process(&self, mut item: Item) -> SubmitScoringOutcome {
    let ctx = &self.ctx;
    let Some(mutation) = item.mutation().map(normalize_mutation) else {
      warn!(unique_id = %item.unique_id(), "Only mutation records are scored.");
      return SubmitScoringOutcome::NoSites;
    };

    let sites = match ctx
      .store
      .scoring_sites(item.family(), item.protein_id(), mutation)
      .await
    {
      Ok(sites) => sites,
      Err(e) => {
        warn!(unique_id = %item.unique_id(), error = %e, "Failed to look up scoring sites. Requeueing...");
        ctx.state.scoring_pending_queue.push(item);
        return SubmitScoringOutcome::Requeued;
      }
    };
    if sites.is_empty() {
      info!(unique_id = %item.unique_id(), "No structural sites to score.");
      self.finish(&item).await;
      return SubmitScoringOutcome::NoSites;
    }

    let mut requests = Vec::with_capacity(sites.len());
    for site in &sites {
      match self.extract(site).await {
        Ok(request) => requests.push(request),
        Err(e) => match e.into_domain() {
          Ok(e) => {
            error!(unique_id = %item.unique_id(), site = ?site, error = %e, "Cannot score mutation.");
            let notice = AdminNotice::for_item(&item, String::new(), e.to_string(), false);
            notify_admin_best_effort(ctx.notifier.as_ref(), &notice).await;
            self.finish(&item).await;
            return SubmitScoringOutcome::DomainError(e);
          }
          Err(e) => {
            warn!(unique_id = %item.unique_id(), error = %e, "Structure extraction failed. Requeueing...");
            ctx.state.scoring_pending_queue.push(item);
            return SubmitScoringOutcome::Requeued;
          }
        },
      }
    }

    let mut posted: Vec<ScoringSite> = Vec::with_capacity(sites.len());
    for (site, request) in sites.into_iter().zip(&requests) {
      match ctx.scoring.post_job(request).await {
        Ok(web_url) => {
          debug!(unique_id = %item.unique_id(), %web_url, kind = site.kind.as_str(), "Posted scoring job.");
          PipelineMetrics::incr(&ctx.metrics.scoring_posts);
          posted.push(ScoringSite {
            site,
            web_url: Some(web_url),
          });
        }
        Err(e) => {
          warn!(unique_id = %item.unique_id(), error = %e, "Failed to post scoring job. Requeueing...");
          delete_remote(ctx, &item, &posted).await;
          ctx.state.scoring_pending_queue.push(item);
          return SubmitScoringOutcome::Requeued;
        }
      }
    }

    let count = posted.len();
    item.scoring_sites = posted;
    ctx.state.scoring_running_queue.push(item);
    SubmitScoringOutcome::Posted(count)
  }

  /// Runs structure parsing on the blocking pool, bounded by the context's permits.
  async fn extract(&self, site: &crate::store::SiteRecord) -> Result<ScoringRequest, ScoringError> {
    let _permit = self
      .ctx
      .blocking_permits
      .clone()
      .acquire_owned()
      .await
      .map_err(|e| ScoringError::Worker(e.to_string()))?;
    let data_root = self.ctx.config.data_dir.clone();
    let base_url = self.ctx.config.scoring.structure_base_url.clone();
    let site = site.clone();
    tokio::task::spawn_blocking(move || build_request(&data_root, &base_url, &site))
      .await
      .map_err(|e| ScoringError::Worker(e.to_string()))?
      .map_err(ScoringError::from)
  }

  async fn finish(&self, item: &Item) {
    finalize_mutation(&self.ctx, item).await;
    self.ctx.state.remove_from_monitored(item);
  }

  pub(crate) async fn run(self) {
    info!("Scoring submit loop started.");
    let mut shutdown = self.ctx.shutdown.clone();
    let queue = &self.ctx.state.scoring_pending_queue;
    let timing = &self.ctx.config.timing;
    loop {
      tokio::select! {
        biased;
        _ = shutdown.triggered() => break,
        _ = queue.wait_for_item(timing.sweep_interval) => {}
      }
      if let Some(item) = queue.pop() {
        let outcome = self.process(item).await;
        let delay = if outcome == SubmitScoringOutcome::Requeued {
          timing.error_delay
        } else {
          timing.loop_interval
        };
        if !shutdown.sleep(delay).await {
          break;
        }
      }
    }
    info!("Scoring submit loop stopped.");
  }
}

// --- Collect loop ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOutcome {
  /// At least one sub-job is still running; record requeued.
  Pending,
  /// Transient error; record requeued.
  Requeued,
  /// Scores committed and record finalized.
  Finalized { scored: usize, skipped: usize },
}

/// Polls posted scoring jobs and commits their results.
#[derive(Debug, Clone)]
pub struct ScoringCollect {
  ctx: PipelineContext,
}

impl ScoringCollect {
  pub fn new(ctx: PipelineContext) -> Self {
    Self { ctx }
  }

  pub async fn process(&self, item: Item) -> CollectOutcome {
    let ctx = &self.ctx;

    let sites = item.scoring_sites().to_vec();
    let mut terminal = Vec::with_capacity(sites.len());
    for site in &sites {
      let Some(web_url) = site.web_url.as_deref() else {
        continue;
      };
      match ctx.scoring.job_status(web_url).await {
        Ok(RemoteStatus::Pending) => {
          debug!(unique_id = %item.unique_id(), %web_url, "Scoring job still running.");
          ctx.state.scoring_running_queue.push(item);
          return CollectOutcome::Pending;
        }
        Ok(status) => terminal.push((site, status)),
        Err(e) => {
          warn!(unique_id = %item.unique_id(), %web_url, error = %e, "Failed to poll scoring job.");
          ctx.state.scoring_running_queue.push(item);
          return CollectOutcome::Requeued;
        }
      }
    }

    let version = ctx.config.scoring.version.as_str();
    let mut scores: Vec<SiteScores> = Vec::new();
    let mut skipped = 0;
    for (site, status) in terminal {
      let result_url = match status {
        RemoteStatus::Done { result_url } => result_url,
        _ => {
          warn!(unique_id = %item.unique_id(), site = ?site.site, "Scoring job failed. Skipping site.");
          skipped += 1;
          continue;
        }
      };
      let results = match ctx.scoring.fetch_results(&result_url).await {
        Ok(results) => results,
        Err(e) => {
          warn!(unique_id = %item.unique_id(), %result_url, error = %e, "Failed to fetch scoring results.");
          ctx.state.scoring_running_queue.push(item);
          return CollectOutcome::Requeued;
        }
      };
      match results
        .first()
        .and_then(|remote| SiteResult::from_remote(site.site.kind, remote))
      {
        Some(result) => scores.push(result.into_scores(&site.site, version)),
        None => {
          warn!(unique_id = %item.unique_id(), site = ?site.site, "Empty scoring result. Skipping site.");
          skipped += 1;
        }
      }
    }

    if !scores.is_empty() {
      if let Err(e) = ctx
        .store
        .save_scores(item.family(), item.protein_id(), &scores)
        .await
      {
        warn!(unique_id = %item.unique_id(), error = %e, "Failed to persist scores. Requeueing...");
        ctx.state.scoring_running_queue.push(item);
        return CollectOutcome::Requeued;
      }
    }

    delete_remote(ctx, &item, &sites).await;
    finalize_mutation(ctx, &item).await;
    ctx.state.remove_from_monitored(&item);
    PipelineMetrics::incr(&ctx.metrics.scoring_finalized);
    info!(
      unique_id = %item.unique_id(),
      scored = scores.len(),
      skipped,
      "Scoring finished."
    );
    CollectOutcome::Finalized {
      scored: scores.len(),
      skipped,
    }
  }

  /// Sweeps every record queued when the pass starts.
  pub async fn pass(&self) -> Vec<CollectOutcome> {
    let queue = &self.ctx.state.scoring_running_queue;
    let mut outcomes = Vec::new();
    for _ in 0..queue.len() {
      let Some(item) = queue.pop() else {
        break;
      };
      outcomes.push(self.process(item).await);
      if self.ctx.shutdown.is_triggered() {
        break;
      }
      tokio::time::sleep(self.ctx.config.timing.loop_interval).await;
    }
    outcomes
  }

  pub(crate) async fn run(self) {
    info!("Scoring collect loop started.");
    let mut shutdown = self.ctx.shutdown.clone();
    loop {
      self.pass().await;
      if !shutdown.sleep(self.ctx.config.timing.scoring_sweep_interval).await {
        break;
      }
    }
    info!("Scoring collect loop stopped.");
  }
}

/// Releases remote jobs. Failures are logged only.
pub(crate) async fn delete_remote(ctx: &PipelineContext, item: &Item, sites: &[ScoringSite]) {
  for web_url in sites.iter().filter_map(|site| site.web_url.as_deref()) {
    if let Err(e) = ctx.scoring.delete_job(web_url).await {
      warn!(unique_id = %item.unique_id(), %web_url, error = %e, "Failed to delete scoring job.");
    }
  }
}
