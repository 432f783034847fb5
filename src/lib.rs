//! jobsubmitter: asynchronous dispatcher for protein-stability mutation jobs.
//!
//! A caller request (one or more proteins, each with a list of mutations) is
//! decomposed into job records: one sequence record and one model record per
//! protein, plus one mutation record per mutation. The records then flow
//! through a fixed set of independently scheduled Tokio loops that talk to
//! each other only through five FIFO queues and a few shared maps:
//!
//! ```text
//! submit() -> dependency gate -> submission -> validation -+-> precalculated cache
//!                                  ^    |                  |
//!                                  +----+ (retry)          +-> scoring submit -> scoring collect -> finalizer
//! ```
//!
//! # Features
//!
//! - Dependency gate: mutation records wait until their sequence and model
//!   results are known, bounded by a timeout.
//! - Cluster submission over `ssh` + `sbatch`, with exclusive lock files as the
//!   cross-process guard against duplicate work.
//! - Cluster status polling, with a freshness check before validation.
//! - Output validation against the `Finished successfully` marker.
//! - Bounded retries with exponential backoff and administrator notification.
//! - Two-tier write-behind cache of completed sequence/model work.
//! - Secondary scoring of mutations against a remote HTTP service
//!   (requires the `http_scoring` feature for the bundled client).
//! - MySQL persistence (requires the `mysql_store` feature).
//! - Status and metrics snapshots, with optional `Serialize` derives (`serde_snapshots`).
//! - Graceful shutdown that force-finalizes lingering records and clears lock files.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use jobsubmitter::{Config, JobRequest, JobSubmitter, ProteinRequest};
//! # use jobsubmitter::{cluster::Cluster, scoring::ScoringClient, store::Store};
//!
//! # async fn run(
//! #   store: Arc<dyn Store>,
//! #   cluster: Arc<dyn Cluster>,
//! #   scoring: Arc<dyn ScoringClient>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let submitter = JobSubmitter::builder()
//!   .config(Config::load("jobsubmitter.toml")?)
//!   .store(store)
//!   .cluster(cluster)
//!   .scoring(scoring)
//!   .build()?;
//!
//! let request = JobRequest::new(
//!   "42",
//!   Some("user@example.com".to_string()),
//!   "database",
//!   vec![ProteinRequest::new("P12345", vec!["G12A".into(), "V30L".into()])],
//! );
//! submitter.submit(request).await?;
//!
//! println!("{:#?}", submitter.status());
//! println!("{:#?}", submitter.metrics_snapshot());
//!
//! submitter.shutdown(Some(Duration::from_secs(30))).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! [`Config`] is read from TOML. Everything except the data root and the
//! cluster account has a default; see [`config`] for the individual sections.
//!
//! # Observability
//!
//! - [`JobSubmitter::metrics_snapshot`] returns counters and queue lengths. See [`MetricsSnapshot`].
//! - [`JobSubmitter::status`] returns the fingerprints held by every queue. See [`PipelineStatus`].
//! - Every loop logs through `tracing`; install a subscriber in the embedding binary.

pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod finalize;
pub mod job;
pub mod metrics;
pub mod monitor;
pub mod notify;
pub mod precalculated;
pub mod retry;
pub mod scoring;
pub mod shutdown;
pub mod state;
pub mod store;
pub mod submit;
pub mod submitter;

// --- Public Re-exports ---

pub use submitter::{enqueue_request, JobSubmitter, JobSubmitterBuilder, PipelineStatus};

pub use cluster::{Cluster, CommandOutput, SshCluster, SubmitRequest};
pub use config::Config;
pub use context::PipelineContext;
pub use error::{
  BuildError, ClusterError, ConfigError, NotifyError, RequestError, ScoringError, ShutdownError,
  StoreError, StructureError,
};
pub use job::{
  ClusterJobId, DataLayout, Fingerprint, Item, JobFamily, JobKey, JobRequest, ProteinRequest,
  RunType,
};
pub use metrics::MetricsSnapshot;
pub use notify::{AdminNotice, LogNotifier, NotificationKind, Notifier};
pub use scoring::ScoringClient;
#[cfg(feature = "http_scoring")]
pub use scoring::HttpScoringClient;
pub use state::DataStructures;
pub use store::{MemoryStore, Store};
#[cfg(feature = "mysql_store")]
pub use store::MySqlStore;
