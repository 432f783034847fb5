use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::RemoteScore;
use crate::error::ScoringError;

/// Body of `POST /jobs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScoringRequest {
  pub protein_structure_url: String,
  pub protein_sequence: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ligand_sequence: Option<String>,
  /// Comma-separated mutation list. One mutation per request here.
  pub mutations: String,
}

/// State of a remote job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
  Pending,
  /// Finished; scores are available at `result_url`.
  Done { result_url: String },
  /// Finished without results.
  Failed,
}

/// Raw `GET <web_url>` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusPayload {
  pub status: String,
  #[serde(default)]
  pub web_url: Option<String>,
}

impl RemoteStatus {
  pub fn from_payload(payload: StatusPayload) -> Result<Self, ScoringError> {
    match payload.status.to_ascii_lowercase().as_str() {
      "queued" | "submitted" | "running" => Ok(RemoteStatus::Pending),
      "done" | "finished" | "success" => match payload.web_url {
        Some(result_url) => Ok(RemoteStatus::Done { result_url }),
        None => Err(ScoringError::Protocol(
          "finished job without a result url".to_string(),
        )),
      },
      "error" | "failed" => Ok(RemoteStatus::Failed),
      other => Err(ScoringError::Protocol(format!("unknown job status '{other}'"))),
    }
  }
}

pub trait ScoringClient: Send + Sync {
  /// Posts one job. Returns its polling URL.
  fn post_job<'a>(
    &'a self,
    request: &'a ScoringRequest,
  ) -> BoxFuture<'a, Result<String, ScoringError>>;

  fn job_status<'a>(
    &'a self,
    web_url: &'a str,
  ) -> BoxFuture<'a, Result<RemoteStatus, ScoringError>>;

  /// Fetches the ordered per-mutation results of a finished job.
  fn fetch_results<'a>(
    &'a self,
    result_url: &'a str,
  ) -> BoxFuture<'a, Result<Vec<RemoteScore>, ScoringError>>;

  /// Releases a remote job.
  fn delete_job<'a>(&'a self, web_url: &'a str) -> BoxFuture<'a, Result<(), ScoringError>>;
}

#[cfg(feature = "http_scoring")]
mod http {
  use futures::future::BoxFuture;
  use serde::Deserialize;
  use tracing::trace;

  use super::{RemoteStatus, ScoringClient, ScoringRequest, StatusPayload};
  use crate::config::ScoringConfig;
  use crate::error::ScoringError;
  use crate::scoring::RemoteScore;

  #[derive(Deserialize)]
  struct PostResponse {
    web_url: String,
  }

  /// JSON-over-HTTP client of the scoring service.
  #[derive(Debug, Clone)]
  pub struct HttpScoringClient {
    client: reqwest::Client,
    jobs_url: String,
  }

  impl HttpScoringClient {
    pub fn new(config: &ScoringConfig) -> Result<Self, ScoringError> {
      let client = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .map_err(transport)?;
      Ok(Self {
        client,
        jobs_url: format!("{}/jobs", config.base_url.trim_end_matches('/')),
      })
    }

    async fn get_json<T>(&self, url: &str) -> Result<T, ScoringError>
    where
      T: serde::de::DeserializeOwned,
    {
      trace!(%url, "GET");
      let response = self
        .client
        .get(url)
        .send()
        .await
        .map_err(transport)?
        .error_for_status()
        .map_err(transport)?;
      response
        .json()
        .await
        .map_err(|e| ScoringError::Protocol(e.to_string()))
    }
  }

  fn transport(e: reqwest::Error) -> ScoringError {
    ScoringError::Transport(e.to_string())
  }

  impl ScoringClient for HttpScoringClient {
    fn post_job<'a>(
      &'a self,
      request: &'a ScoringRequest,
    ) -> BoxFuture<'a, Result<String, ScoringError>> {
      Box::pin(async move {
        let response = self
          .client
          .post(&self.jobs_url)
          .json(request)
          .send()
          .await
          .map_err(transport)?
          .error_for_status()
          .map_err(transport)?;
        let body: PostResponse = response
          .json()
          .await
          .map_err(|e| ScoringError::Protocol(e.to_string()))?;
        Ok(body.web_url)
      })
    }

    fn job_status<'a>(
      &'a self,
      web_url: &'a str,
    ) -> BoxFuture<'a, Result<RemoteStatus, ScoringError>> {
      Box::pin(async move {
        let payload: StatusPayload = self.get_json(web_url).await?;
        RemoteStatus::from_payload(payload)
      })
    }

    fn fetch_results<'a>(
      &'a self,
      result_url: &'a str,
    ) -> BoxFuture<'a, Result<Vec<RemoteScore>, ScoringError>> {
      Box::pin(self.get_json(result_url))
    }

    fn delete_job<'a>(&'a self, web_url: &'a str) -> BoxFuture<'a, Result<(), ScoringError>> {
      Box::pin(async move {
        self
          .client
          .delete(web_url)
          .send()
          .await
          .map_err(transport)?
          .error_for_status()
          .map_err(transport)?;
        Ok(())
      })
    }
  }
}

#[cfg(feature = "http_scoring")]
pub use http::HttpScoringClient;

#[cfg(test)]
mod tests {
  use super::*;

  fn payload(status: &str, web_url: Option<&str>) -> StatusPayload {
    StatusPayload {
      status: status.to_string(),
      web_url: web_url.map(str::to_string),
    }
  }

  #[test]
  fn status_mapping() {
    assert_eq!(
      RemoteStatus::from_payload(payload("running", None)).unwrap(),
      RemoteStatus::Pending
    );
    assert_eq!(
      RemoteStatus::from_payload(payload("done", Some("http://x/r"))).unwrap(),
      RemoteStatus::Done { result_url: "http://x/r".into() }
    );
    assert_eq!(
      RemoteStatus::from_payload(payload("failed", None)).unwrap(),
      RemoteStatus::Failed
    );
    assert!(RemoteStatus::from_payload(payload("done", None)).is_err());
    assert!(RemoteStatus::from_payload(payload("???", None)).is_err());
  }
}
