//! Secondary mutation scoring against the remote scoring service.
//!
//! Each validated mutation record fans out into one remote job per structural
//! site (core domain or domain-pair interface). The submit loop posts them, the
//! collect loop waits until every one is terminal and commits the scores.

pub mod client;
pub mod pipeline;
pub mod structure;

use serde::Deserialize;

use crate::store::SiteRecord;

pub use client::{RemoteStatus, ScoringClient, ScoringRequest};
#[cfg(feature = "http_scoring")]
pub use client::HttpScoringClient;
pub use pipeline::{CollectOutcome, ScoringCollect, ScoringSubmit, SubmitScoringOutcome};

/// Structural context of a mutation site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde_snapshots", derive(serde::Serialize))]
pub enum SiteKind {
  Core,
  Interface,
}

impl SiteKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      SiteKind::Core => "core",
      SiteKind::Interface => "interface",
    }
  }

  /// `affectedType` code of the mutation table.
  pub fn affected_type(&self) -> &'static str {
    match self {
      SiteKind::Core => "CO",
      SiteKind::Interface => "IN",
    }
  }
}

/// One remote scoring job of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoringSite {
  pub site: SiteRecord,
  /// Polling URL returned by the service. `None` until posted.
  pub web_url: Option<String>,
}

/// Scores persisted for one site.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde_snapshots", derive(serde::Serialize))]
pub struct SiteScores {
  pub kind: SiteKind,
  pub domain_or_interface_id: i64,
  /// Mutation as numbered on the model.
  pub mutation: String,
  pub protbert_score: f64,
  pub proteinsolver_score: f64,
  /// Combined score.
  pub el2_score: f64,
  pub el2_version: String,
}

impl SiteScores {
  /// Whether both values address the same score row.
  pub fn same_row(&self, other: &SiteScores) -> bool {
    self.kind == other.kind
      && self.domain_or_interface_id == other.domain_or_interface_id
      && self.mutation == other.mutation
  }
}

/// One element of the service's result list. Core and interface scores are
/// reported in separate fields.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RemoteScore {
  #[serde(default)]
  pub protbert_core_score: Option<f64>,
  #[serde(default)]
  pub proteinsolver_core_score: Option<f64>,
  #[serde(default)]
  pub el2core_score: Option<f64>,
  #[serde(default)]
  pub protbert_interface_score: Option<f64>,
  #[serde(default)]
  pub proteinsolver_interface_score: Option<f64>,
  #[serde(default)]
  pub el2interface_score: Option<f64>,
}

/// The three scores of one site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreTriple {
  pub protbert: f64,
  pub proteinsolver: f64,
  pub combined: f64,
}

/// A remote result, tagged by the kind of site it belongs to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SiteResult {
  Core(ScoreTriple),
  Interface(ScoreTriple),
}

impl SiteResult {
  /// Reads the fields matching `kind`. `None` if any of them is missing.
  pub fn from_remote(kind: SiteKind, remote: &RemoteScore) -> Option<Self> {
    match kind {
      SiteKind::Core => Some(SiteResult::Core(ScoreTriple {
        protbert: remote.protbert_core_score?,
        proteinsolver: remote.proteinsolver_core_score?,
        combined: remote.el2core_score?,
      })),
      SiteKind::Interface => Some(SiteResult::Interface(ScoreTriple {
        protbert: remote.protbert_interface_score?,
        proteinsolver: remote.proteinsolver_interface_score?,
        combined: remote.el2interface_score?,
      })),
    }
  }

  pub fn kind(&self) -> SiteKind {
    match self {
      SiteResult::Core(_) => SiteKind::Core,
      SiteResult::Interface(_) => SiteKind::Interface,
    }
  }

  pub fn into_scores(self, site: &SiteRecord, version: &str) -> SiteScores {
    let (SiteResult::Core(triple) | SiteResult::Interface(triple)) = self;
    SiteScores {
      kind: self.kind(),
      domain_or_interface_id: site.domain_or_interface_id,
      mutation: site.mutation.clone(),
      protbert_score: triple.protbert,
      proteinsolver_score: triple.proteinsolver,
      el2_score: triple.combined,
      el2_version: version.to_string(),
    }
  }
}
