//! Incoming job requests and their decomposition into [`Item`]s.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use super::{DataLayout, Item, JobFamily, JobHeader, JobKey, JobKind};
use crate::error::RequestError;

/// A request as accepted by the front end.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
  pub job_id: String,
  #[serde(default)]
  pub job_email: Option<String>,
  /// `local` or `database`.
  pub job_family: String,
  pub proteins: Vec<ProteinRequest>,
}

/// Per-protein part of a request.
#[derive(Debug, Clone, Deserialize)]
pub struct ProteinRequest {
  pub protein_id: String,
  /// Mutation tokens. Entries may also be comma-separated lists (`M1A,G2A`).
  pub mutations: Vec<String>,
  #[serde(default)]
  pub structure_file: Option<String>,
  #[serde(default)]
  pub sequence_file: Option<String>,
  #[serde(default)]
  pub domain_pair_ids: Vec<String>,
}

/// The fixed DAG produced for one protein: sequence -> model -> {mutation}xN.
#[derive(Debug, Clone)]
pub struct ProteinJobs {
  pub sequence: Item,
  pub model: Item,
  pub mutations: Vec<Item>,
}

impl JobRequest {
  pub fn new(
    job_id: impl Into<String>,
    job_email: Option<String>,
    job_family: impl Into<String>,
    proteins: Vec<ProteinRequest>,
  ) -> Self {
    Self {
      job_id: job_id.into(),
      job_email,
      job_family: job_family.into(),
      proteins,
    }
  }

  pub fn job_key(&self) -> JobKey {
    JobKey::new(self.job_id.clone(), self.job_email.clone())
  }

  /// Validates the request and builds one [`ProteinJobs`] per protein.
  ///
  /// Nothing is created if any part of the request is invalid.
  pub fn decompose(&self, layout: &DataLayout) -> Result<Vec<ProteinJobs>, RequestError> {
    if self.job_id.trim().is_empty() {
      return Err(RequestError::EmptyJobId);
    }
    let family: JobFamily = self.job_family.parse()?;
    if self.proteins.is_empty() {
      return Err(RequestError::NoProteins);
    }

    let job_key = self.job_key();
    let mut out = Vec::with_capacity(self.proteins.len());
    for protein in &self.proteins {
      let (header, mutations) = protein.validate(family, job_key.clone())?;
      let header = Arc::new(header);
      out.push(ProteinJobs {
        sequence: Item::new(JobKind::Sequence, header.clone(), layout),
        model: Item::new(JobKind::Model, header.clone(), layout),
        mutations: mutations
          .into_iter()
          .map(|mutation| Item::new(JobKind::Mutation { mutation }, header.clone(), layout))
          .collect(),
      });
    }
    debug!(job_id = %self.job_id, proteins = out.len(), "Decomposed job request.");
    Ok(out)
  }
}

impl ProteinRequest {
  pub fn new(protein_id: impl Into<String>, mutations: Vec<String>) -> Self {
    Self {
      protein_id: protein_id.into(),
      mutations,
      structure_file: None,
      sequence_file: None,
      domain_pair_ids: Vec::new(),
    }
  }

  pub fn with_structure_file(mut self, path: impl Into<String>) -> Self {
    self.structure_file = Some(path.into());
    self
  }

  pub fn with_sequence_file(mut self, path: impl Into<String>) -> Self {
    self.sequence_file = Some(path.into());
    self
  }

  /// Returns the shared header and the deduplicated mutation tokens in request order.
  fn validate(
    &self,
    family: JobFamily,
    job_key: JobKey,
  ) -> Result<(JobHeader, Vec<String>), RequestError> {
    let protein_id = self.protein_id.trim();
    if !is_safe_token(protein_id) {
      return Err(RequestError::InvalidProteinId(self.protein_id.clone()));
    }

    let mut seen = BTreeSet::new();
    let mut mutations = Vec::new();
    for token in self.mutations.iter().flat_map(|m| m.split(',')) {
      let token = token.trim();
      if token.is_empty() {
        continue;
      }
      if !is_safe_token(token) {
        return Err(RequestError::InvalidMutation {
          protein_id: protein_id.to_string(),
          mutation: token.to_string(),
        });
      }
      if seen.insert(token.to_string()) {
        mutations.push(token.to_string());
      }
    }
    if mutations.is_empty() {
      return Err(RequestError::NoMutations {
        protein_id: protein_id.to_string(),
      });
    }

    let structure_file = non_empty(&self.structure_file);
    let sequence_file = non_empty(&self.sequence_file);
    if family == JobFamily::Local && structure_file.is_none() {
      return Err(RequestError::MissingStructureFile {
        protein_id: protein_id.to_string(),
      });
    }
    for file in structure_file.iter().chain(sequence_file.iter()) {
      if file.contains("..") || file.chars().any(is_shell_meta) {
        return Err(RequestError::InvalidFileReference(file.clone()));
      }
    }

    let domain_pair_ids = self
      .domain_pair_ids
      .iter()
      .flat_map(|d| d.split(','))
      .map(str::trim)
      .filter(|d| !d.is_empty())
      .map(|d| {
        if is_safe_token(d) {
          Ok(d.to_string())
        } else {
          Err(RequestError::InvalidFileReference(d.to_string()))
        }
      })
      .collect::<Result<Vec<_>, _>>()?;

    let header = JobHeader {
      job_key,
      family,
      protein_id: protein_id.to_string(),
      structure_file,
      sequence_file,
      domain_pair_ids,
    };
    Ok((header, mutations))
  }
}

fn non_empty(value: &Option<String>) -> Option<String> {
  value
    .as_deref()
    .map(str::trim)
    .filter(|v| !v.is_empty())
    .map(str::to_string)
}

fn is_shell_meta(c: char) -> bool {
  matches!(
    c,
    '\'' | '"' | '`' | '$' | ';' | '&' | '|' | '<' | '>' | '(' | ')' | '\\' | '\n' | '\r' | '*' | '?'
  ) || c.is_whitespace()
}

/// Identifiers end up in file names and remote shell commands.
fn is_safe_token(token: &str) -> bool {
  !token.is_empty()
    && !token.starts_with('.')
    && token
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn layout() -> DataLayout {
    DataLayout::new("/data")
  }

  #[test]
  fn rejects_unknown_family() {
    let req = JobRequest::new("1", None, "remote", vec![ProteinRequest::new("P1", vec!["A1B".into()])]);
    assert_eq!(
      req.decompose(&layout()).unwrap_err(),
      RequestError::UnknownJobFamily("remote".into())
    );
  }

  #[test]
  fn rejects_path_like_protein_id() {
    let req = JobRequest::new(
      "1",
      None,
      "database",
      vec![ProteinRequest::new("../etc", vec!["A1B".into()])],
    );
    assert!(matches!(
      req.decompose(&layout()),
      Err(RequestError::InvalidProteinId(_))
    ));
  }

  #[test]
  fn splits_and_dedups_mutations() {
    let req = JobRequest::new(
      "1",
      None,
      "database",
      vec![ProteinRequest::new("P1", vec!["A1B,C2D".into(), "A1B".into()])],
    );
    let jobs = req.decompose(&layout()).unwrap();
    let muts: Vec<_> = jobs[0].mutations.iter().filter_map(|m| m.mutation()).collect();
    assert_eq!(muts, vec!["A1B", "C2D"]);
  }
}
