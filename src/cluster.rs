//! Batch cluster boundary: `sbatch` submission and `squeue` listing over ssh.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;

use futures::future::BoxFuture;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::config::{ClusterConfig, Config, ResourceProfile};
use crate::error::{BuildError, ClusterError};
use crate::job::{ClusterJobId, Item};

static JOB_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"(?m)^Submitted batch job (\d+)\s*$").expect("job id pattern is valid")
});

/// Captured result of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
  pub success: bool,
  /// Exit status as printed by the OS (`exit status: 1`).
  pub status: String,
  pub stdout: String,
  pub stderr: String,
}

/// Everything needed to submit one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
  /// `KEY=value` assignments exported to the cluster script.
  pub env: Vec<(String, String)>,
  pub profile: ResourceProfile,
  pub script: PathBuf,
}

impl SubmitRequest {
  pub fn for_item(item: &Item, config: &Config) -> Self {
    let run_type = item.run_type();
    let profile = config.profiles.for_run_type(run_type).clone();
    let header = item.header();
    let scripts_dir = config.scripts_dir();

    let mut env: Vec<(String, String)> = config
      .cluster
      .script_env
      .iter()
      .map(|(k, v)| (k.clone(), v.clone()))
      .collect();
    env.extend([
      ("lock_filename".to_string(), item.lock_path().display().to_string()),
      (
        "lock_filename_finished".to_string(),
        item.finished_lock_path().display().to_string(),
      ),
      ("protein_id".to_string(), header.protein_id.clone()),
      ("mutations".to_string(), item.mutation().unwrap_or_default().to_string()),
      ("uniprot_domain_pair_ids".to_string(), header.domain_pair_ids.join(",")),
      (
        "structure_file".to_string(),
        header.structure_file.clone().unwrap_or_default(),
      ),
      (
        "sequence_file".to_string(),
        header.sequence_file.clone().unwrap_or_default(),
      ),
      ("SCRIPTS_DIR".to_string(), scripts_dir.display().to_string()),
      ("run_type".to_string(), run_type.as_str().to_string()),
      ("elaspic_run_type".to_string(), profile.run_code.to_string()),
    ]);

    Self {
      env,
      script: scripts_dir.join(format!("{}.sh", header.family.as_str())),
      profile,
    }
  }

  /// Arguments of the remote command, already quoted for the remote shell.
  pub fn remote_args(&self, submit_program: &str) -> Vec<String> {
    let mut args: Vec<String> = self
      .env
      .iter()
      .map(|(key, value)| format!("{key}={}", shell_quote(value)))
      .collect();
    args.push(submit_program.to_string());
    args.push(format!("--time={}", self.profile.wall_time));
    args.push("--nodes=1".to_string());
    args.push(format!("--ntasks-per-node={}", self.profile.cores));
    args.push(format!("--mem={}", self.profile.memory));
    args.push(shell_quote(&self.script.display().to_string()));
    args
  }

  /// Human-readable command line, as included in admin notices.
  pub fn render(&self, cluster: &ClusterConfig) -> String {
    let mut parts = vec![
      cluster.ssh_program.clone(),
      format!("{}@{}", cluster.user, cluster.host),
    ];
    parts.extend(self.remote_args(&cluster.submit_program));
    parts.join(" ")
  }
}

/// Single-quotes a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
  format!("'{}'", value.replace('\'', r"'\''"))
}

/// Extracts the job id from `sbatch` output.
pub fn parse_job_id(stdout: &str) -> Option<ClusterJobId> {
  JOB_ID_RE
    .captures(stdout)
    .and_then(|caps| caps.get(1))
    .and_then(|m| m.as_str().parse().ok())
    .map(ClusterJobId)
}

/// Parses a whitespace-delimited job table whose first column is the job id.
/// Header lines and array-job ids are ignored.
pub fn parse_job_listing(stdout: &str) -> HashSet<ClusterJobId> {
  stdout
    .lines()
    .filter_map(|line| line.split_whitespace().next())
    .filter(|first| first.bytes().all(|b| b.is_ascii_digit()))
    .filter_map(|first| first.parse().ok())
    .map(ClusterJobId)
    .collect()
}

pub trait Cluster: Send + Sync {
  /// Runs the submission command. A non-zero exit is reported in the output, not as an error.
  fn submit<'a>(&'a self, request: &'a SubmitRequest)
    -> BoxFuture<'a, Result<CommandOutput, ClusterError>>;

  /// Returns the raw job listing of the service account.
  fn list_jobs(&self) -> BoxFuture<'_, Result<String, ClusterError>>;

  /// Command line shown to administrators for a request.
  fn describe(&self, request: &SubmitRequest) -> String;
}

/// Reaches the scheduler head node with `ssh user@host <command>`.
#[derive(Debug, Clone)]
pub struct SshCluster {
  config: ClusterConfig,
}

impl SshCluster {
  pub fn new(config: ClusterConfig) -> Result<Self, BuildError> {
    if config.user.trim().is_empty() || config.host.trim().is_empty() {
      return Err(BuildError::InvalidConfig(
        "cluster.user and cluster.host must be set".to_string(),
      ));
    }
    Ok(Self { config })
  }

  fn destination(&self) -> String {
    format!("{}@{}", self.config.user, self.config.host)
  }

  async fn run(&self, remote_args: Vec<String>) -> Result<CommandOutput, ClusterError> {
    let program = self.config.ssh_program.clone();
    trace!(%program, args = ?remote_args, "Running cluster command.");
    let output = Command::new(&program)
      .arg(self.destination())
      .args(&remote_args)
      .stdin(Stdio::null())
      .kill_on_drop(true)
      .output()
      .await
      .map_err(|source| ClusterError::Spawn { program, source })?;
    Ok(CommandOutput {
      success: output.status.success(),
      status: output.status.to_string(),
      stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
      stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
  }
}

impl Cluster for SshCluster {
  fn submit<'a>(
    &'a self,
    request: &'a SubmitRequest,
  ) -> BoxFuture<'a, Result<CommandOutput, ClusterError>> {
    Box::pin(self.run(request.remote_args(&self.config.submit_program)))
  }

  fn list_jobs(&self) -> BoxFuture<'_, Result<String, ClusterError>> {
    Box::pin(async move {
      let args = vec![
        self.config.list_program.clone(),
        "-u".to_string(),
        shell_quote(&self.config.user),
      ];
      let output = self.run(args).await?;
      // Anything on stderr means the listing may be partial.
      if !output.success || !output.stderr.trim().is_empty() {
        return Err(ClusterError::CommandFailed {
          status: output.status,
          stderr: output.stderr,
        });
      }
      debug!(bytes = output.stdout.len(), "Fetched cluster job listing.");
      Ok(output.stdout)
    })
  }

  fn describe(&self, request: &SubmitRequest) -> String {
    request.render(&self.config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn job_id_is_read_from_its_own_line() {
    let out = "some banner\nSubmitted batch job 4242\n";
    assert_eq!(parse_job_id(out), Some(ClusterJobId(4242)));
    assert_eq!(parse_job_id("Submitted batch job abc\n"), None);
    assert_eq!(parse_job_id("error: Submitted batch job 12 failed"), None);
  }

  #[test]
  fn listing_skips_headers_and_array_jobs() {
    let out = "JOBID PARTITION NAME\n  101 main x\n102_3 main y\n103 main z\n";
    let ids = parse_job_listing(out);
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&ClusterJobId(101)));
    assert!(ids.contains(&ClusterJobId(103)));
  }

  #[test]
  fn quoting_escapes_single_quotes() {
    assert_eq!(shell_quote("a'b"), r"'a'\''b'");
  }
}
