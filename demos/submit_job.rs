//! demos/submit_job.rs
//!
//! Runs a pipeline against the configured MySQL databases, cluster and scoring
//! service, submits one request read from a JSON file and reports progress
//! until every record has left the pipeline.
//!
//! Usage: `cargo run --example submit_job -- jobsubmitter.toml request.json`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use jobsubmitter::{Config, HttpScoringClient, JobRequest, JobSubmitter, MySqlStore, SshCluster};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_new("warn,jobsubmitter=info")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  let mut args = std::env::args().skip(1);
  let config_path = args.next().context("missing config path")?;
  let request_path = args.next().context("missing request path")?;

  let config = Config::load(&config_path)?;
  let raw = std::fs::read_to_string(&request_path)
    .with_context(|| format!("reading {request_path}"))?;
  let request: JobRequest = serde_json::from_str(&raw)?;

  // --- Build Pipeline ---
  let store = MySqlStore::connect_lazy(&config.store)?;
  let cluster = SshCluster::new(config.cluster.clone())?;
  let scoring = HttpScoringClient::new(&config.scoring)?;
  let submitter = JobSubmitter::builder()
    .config(config)
    .store(Arc::new(store))
    .cluster(Arc::new(cluster))
    .scoring(Arc::new(scoring))
    .build()?;

  let job_key = request.job_key();
  submitter.submit(request).await?;
  info!(job = %job_key, "Request submitted.");

  // --- Wait for Completion ---
  loop {
    tokio::time::sleep(Duration::from_secs(30)).await;
    let status = submitter.status();
    if !status.monitored_jobs.contains_key(&job_key) {
      break;
    }
    info!("Metrics: {:#?}", submitter.metrics_snapshot());
  }
  info!(job = %job_key, "Job complete.");

  // --- Shutdown ---
  let summary = submitter.shutdown(Some(Duration::from_secs(30))).await?;
  info!(?summary, "Pipeline stopped.");
  Ok(())
}
