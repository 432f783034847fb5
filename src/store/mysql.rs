//! MySQL store. The cache table lives in its own database; job, mutation and
//! score tables live in the webserver database.

use std::collections::HashMap;

use futures::future::BoxFuture;
use sqlx::mysql::{MySql, MySqlPool, MySqlPoolOptions};
use sqlx::{QueryBuilder, Row};
use tracing::debug;

use super::{MutationStatus, SiteRecord, Store};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::job::{ClusterJobId, Fingerprint, JobFamily};
use crate::scoring::{SiteKind, SiteScores};

const MARK_JOB_DONE_SQL: &str = "\
UPDATE jobs
SET isDone = 1, dateFinished = now()
WHERE jobID = ?";

const MUTATION_HAS_DDG_SQL: &str = "\
SELECT
  EXISTS(
    SELECT 1 FROM elaspic_core_mutation
    WHERE protein_id = ? AND mutation = ? AND ddg IS NOT NULL
  ) OR EXISTS(
    SELECT 1 FROM elaspic_core_mutation_local
    WHERE protein_id = ? AND mutation = ? AND ddg IS NOT NULL
  ) AS has_core,
  EXISTS(
    SELECT 1 FROM elaspic_interface_mutation
    WHERE protein_id = ? AND mutation = ? AND ddg IS NOT NULL
  ) OR EXISTS(
    SELECT 1 FROM elaspic_interface_mutation_local
    WHERE protein_id = ? AND mutation = ? AND ddg IS NOT NULL
  ) AS has_interface";

const MUTATION_DONE_SQL: &str = "\
UPDATE muts
SET affectedType = ?, status = 'done', dateFinished = now(), error = NULL
WHERE protein = ? AND mut = ?";

const MUTATION_ERROR_SQL: &str = "\
UPDATE muts
SET affectedType = 'CO', status = 'error', dateFinished = now(),
    error = '1: ddG not calculated'
WHERE protein = ? AND mut = ?";

fn sites_sql(family: JobFamily, kind: SiteKind) -> &'static str {
  match (family, kind) {
    (JobFamily::Local, SiteKind::Core) => {
      "SELECT domain_id AS domain_or_interface_id, model_filename_wt, chain_modeller, mutation_modeller
       FROM elaspic_webserver.elaspic_core_mutation_local
       WHERE protein_id = ? AND mutation = ?"
    }
    (JobFamily::Local, SiteKind::Interface) => {
      "SELECT interface_id AS domain_or_interface_id, model_filename_wt, chain_modeller, mutation_modeller
       FROM elaspic_webserver.elaspic_interface_mutation_local
       WHERE protein_id = ? AND mutation = ?"
    }
    (JobFamily::Database, SiteKind::Core) => {
      "SELECT d.uniprot_domain_id AS domain_or_interface_id,
              CONCAT(d.path_to_data, mut.model_filename_wt) AS model_filename_wt,
              mut.chain_modeller, mut.mutation_modeller
       FROM elaspic.uniprot_domain_mutation mut
       JOIN elaspic.uniprot_domain d USING (uniprot_domain_id)
       WHERE mut.uniprot_id = ? AND mut.mutation = ?"
    }
    (JobFamily::Database, SiteKind::Interface) => {
      "SELECT d.uniprot_domain_pair_id AS domain_or_interface_id,
              CONCAT(d.path_to_data, mut.model_filename_wt) AS model_filename_wt,
              mut.chain_modeller, mut.mutation_modeller
       FROM elaspic.uniprot_domain_pair_mutation mut
       JOIN elaspic.uniprot_domain_pair d USING (uniprot_domain_pair_id)
       WHERE mut.uniprot_id = ? AND mut.mutation = ?"
    }
  }
}

fn save_scores_sql(family: JobFamily, kind: SiteKind) -> &'static str {
  match (family, kind) {
    (JobFamily::Local, SiteKind::Core) => {
      "UPDATE elaspic_webserver.elaspic_core_mutation_local
       SET protbert_score = ?, proteinsolver_score = ?, el2_score = ?, el2_version = ?
       WHERE domain_id = ? AND protein_id = ? AND mutation_modeller = ?"
    }
    (JobFamily::Local, SiteKind::Interface) => {
      "UPDATE elaspic_webserver.elaspic_interface_mutation_local
       SET protbert_score = ?, proteinsolver_score = ?, el2_score = ?, el2_version = ?
       WHERE interface_id = ? AND protein_id = ? AND mutation_modeller = ?"
    }
    (JobFamily::Database, SiteKind::Core) => {
      "UPDATE elaspic.uniprot_domain_mutation
       SET protbert_score = ?, proteinsolver_score = ?, el2_score = ?, el2_version = ?
       WHERE uniprot_domain_id = ? AND uniprot_id = ? AND mutation_modeller = ?"
    }
    (JobFamily::Database, SiteKind::Interface) => {
      "UPDATE elaspic.uniprot_domain_pair_mutation
       SET protbert_score = ?, proteinsolver_score = ?, el2_score = ?, el2_version = ?
       WHERE uniprot_domain_pair_id = ? AND uniprot_id = ? AND mutation_modeller = ?"
    }
  }
}

/// Persist pipeline state in the webserver's MySQL databases.
#[derive(Debug, Clone)]
pub struct MySqlStore {
  cache: MySqlPool,
  web: MySqlPool,
}

impl MySqlStore {
  pub fn new(cache: MySqlPool, web: MySqlPool) -> Self {
    Self { cache, web }
  }

  /// Opens lazily-connecting pools for both databases.
  pub fn connect_lazy(config: &StoreConfig) -> StoreResult<Self> {
    let cache = MySqlPoolOptions::new()
      .max_connections(2)
      .connect_lazy(&config.cache_url)?;
    let web = MySqlPoolOptions::new()
      .max_connections(4)
      .connect_lazy(&config.web_url)?;
    Ok(Self::new(cache, web))
  }

  async fn load_precalculated_impl(&self) -> StoreResult<HashMap<Fingerprint, ClusterJobId>> {
    let rows = sqlx::query("SELECT id, job_id FROM jobsubmitter_cache")
      .fetch_all(&self.cache)
      .await?;
    let mut entries = HashMap::with_capacity(rows.len());
    for row in rows {
      let id: String = row.try_get(0)?;
      let job_id: i64 = row.try_get(1)?;
      let job_id = u64::try_from(job_id)
        .map_err(|_| StoreError::Query(format!("negative cluster job id {job_id} for {id}")))?;
      entries.insert(Fingerprint::from_raw(id), ClusterJobId(job_id));
    }
    debug!(count = entries.len(), "Loaded precalculated entries.");
    Ok(entries)
  }

  async fn upsert_precalculated_impl(
    &self,
    entries: &[(Fingerprint, ClusterJobId)],
  ) -> StoreResult<()> {
    if entries.is_empty() {
      return Ok(());
    }
    let mut builder: QueryBuilder<MySql> =
      QueryBuilder::new("INSERT INTO jobsubmitter_cache (id, job_id) ");
    builder.push_values(entries.iter(), |mut row, (fingerprint, job_id)| {
      row.push_bind(fingerprint.as_str()).push_bind(job_id.0);
    });
    builder.push(" ON DUPLICATE KEY UPDATE job_id = job_id");
    builder.build().execute(&self.cache).await?;
    Ok(())
  }

  async fn mark_units_error_impl(
    &self,
    job_id: &str,
    protein_id: &str,
    mutation: Option<&str>,
  ) -> StoreResult<u64> {
    let mut builder: QueryBuilder<MySql> = QueryBuilder::new(
      "UPDATE muts \
       JOIN job_to_mut ON (job_to_mut.mut_id = muts.id) \
       JOIN jobs ON (jobs.jobID = job_to_mut.job_id) \
       SET muts.status = 'error' \
       WHERE jobs.jobID = ",
    );
    builder.push_bind(job_id);
    builder.push(" AND muts.protein = ").push_bind(protein_id);
    if let Some(mutation) = mutation {
      builder.push(" AND muts.mut = ").push_bind(mutation);
    }
    let result = builder.build().execute(&self.web).await?;
    Ok(result.rows_affected())
  }

  async fn finalize_mutation_impl(
    &self,
    protein_id: &str,
    mutation: &str,
  ) -> StoreResult<MutationStatus> {
    let mut tx = self.web.begin().await?;
    let mut query = sqlx::query(MUTATION_HAS_DDG_SQL);
    for _ in 0..4 {
      query = query.bind(protein_id).bind(mutation);
    }
    let row = query.fetch_one(&mut *tx).await?;
    let has_core: i64 = row.try_get("has_core")?;
    let has_interface: i64 = row.try_get("has_interface")?;
    // An interface result wins over a core result.
    let affected = if has_interface != 0 {
      Some(SiteKind::Interface)
    } else if has_core != 0 {
      Some(SiteKind::Core)
    } else {
      None
    };
    let status = match affected {
      Some(kind) => {
        sqlx::query(MUTATION_DONE_SQL)
          .bind(kind.affected_type())
          .bind(protein_id)
          .bind(mutation)
          .execute(&mut *tx)
          .await?;
        MutationStatus::Done
      }
      None => {
        sqlx::query(MUTATION_ERROR_SQL)
          .bind(protein_id)
          .bind(mutation)
          .execute(&mut *tx)
          .await?;
        MutationStatus::Error
      }
    };
    tx.commit().await?;
    debug!(protein_id, mutation, ?status, ?affected, "Finalized mutation row.");
    Ok(status)
  }

  async fn scoring_sites_impl(
    &self,
    family: JobFamily,
    protein_id: &str,
    mutation: &str,
  ) -> StoreResult<Vec<SiteRecord>> {
    let mut sites = Vec::new();
    for kind in [SiteKind::Core, SiteKind::Interface] {
      let rows = sqlx::query(sites_sql(family, kind))
        .bind(protein_id)
        .bind(mutation)
        .fetch_all(&self.web)
        .await?;
      for row in rows {
        sites.push(SiteRecord {
          kind,
          domain_or_interface_id: row.try_get(0)?,
          structure_file: row.try_get(1)?,
          chain_id: row.try_get(2)?,
          mutation: row.try_get(3)?,
        });
      }
    }
    Ok(sites)
  }

  async fn save_scores_impl(
    &self,
    family: JobFamily,
    protein_id: &str,
    scores: &[SiteScores],
  ) -> StoreResult<()> {
    let mut tx = self.web.begin().await?;
    for score in scores {
      sqlx::query(save_scores_sql(family, score.kind))
        .bind(score.protbert_score)
        .bind(score.proteinsolver_score)
        .bind(score.el2_score)
        .bind(&score.el2_version)
        .bind(score.domain_or_interface_id)
        .bind(protein_id)
        .bind(&score.mutation)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
  }
}

impl Store for MySqlStore {
  fn load_precalculated(&self) -> BoxFuture<'_, StoreResult<HashMap<Fingerprint, ClusterJobId>>> {
    Box::pin(self.load_precalculated_impl())
  }

  fn upsert_precalculated<'a>(
    &'a self,
    entries: &'a [(Fingerprint, ClusterJobId)],
  ) -> BoxFuture<'a, StoreResult<()>> {
    Box::pin(self.upsert_precalculated_impl(entries))
  }

  fn mark_units_error<'a>(
    &'a self,
    job_id: &'a str,
    protein_id: &'a str,
    mutation: Option<&'a str>,
  ) -> BoxFuture<'a, StoreResult<u64>> {
    Box::pin(self.mark_units_error_impl(job_id, protein_id, mutation))
  }

  fn finalize_mutation<'a>(
    &'a self,
    protein_id: &'a str,
    mutation: &'a str,
  ) -> BoxFuture<'a, StoreResult<MutationStatus>> {
    Box::pin(self.finalize_mutation_impl(protein_id, mutation))
  }

  fn mark_job_done<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, StoreResult<u64>> {
    Box::pin(async move {
      let result = sqlx::query(MARK_JOB_DONE_SQL)
        .bind(job_id)
        .execute(&self.web)
        .await?;
      Ok(result.rows_affected())
    })
  }

  fn scoring_sites<'a>(
    &'a self,
    family: JobFamily,
    protein_id: &'a str,
    mutation: &'a str,
  ) -> BoxFuture<'a, StoreResult<Vec<SiteRecord>>> {
    Box::pin(self.scoring_sites_impl(family, protein_id, mutation))
  }

  fn save_scores<'a>(
    &'a self,
    family: JobFamily,
    protein_id: &'a str,
    scores: &'a [SiteScores],
  ) -> BoxFuture<'a, StoreResult<()>> {
    Box::pin(self.save_scores_impl(family, protein_id, scores))
  }
}
