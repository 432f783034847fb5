use std::path::{Path, PathBuf};

use super::{ClusterJobId, JobFamily, RunType};

/// Filesystem layout below the shared data root.
///
/// ```text
/// <root>/locks/{sequence,model,mutation}/<protein>[.<mutation>].lock
/// <root>/locks/{sequence,model,mutation}/finished/<protein>[.<mutation>].lock
/// <root>/pbs-output/<job>.{out,err}                          (database family)
/// <root>/user_input/<protein>/pbs-output/<job>.{out,err}     (local family)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
  root: PathBuf,
}

impl DataLayout {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn lock_root(&self) -> PathBuf {
    self.root.join("locks")
  }

  pub fn lock_dir(&self, run_type: RunType, finished: bool) -> PathBuf {
    let dir = self.lock_root().join(run_type.as_str());
    if finished {
      dir.join("finished")
    } else {
      dir
    }
  }

  pub fn lock_path(
    &self,
    run_type: RunType,
    protein_id: &str,
    mutation: Option<&str>,
    finished: bool,
  ) -> PathBuf {
    let file_name = match mutation {
      Some(mutation) => format!("{protein_id}.{mutation}.lock"),
      None => format!("{protein_id}.lock"),
    };
    self.lock_dir(run_type, finished).join(file_name)
  }

  /// Expected `(stdout, stderr)` log paths of a cluster job.
  pub fn log_paths(
    &self,
    family: JobFamily,
    protein_id: &str,
    job_id: ClusterJobId,
  ) -> (PathBuf, PathBuf) {
    let dir = match family {
      JobFamily::Database => self.root.join("pbs-output"),
      JobFamily::Local => self.root.join("user_input").join(protein_id).join("pbs-output"),
    };
    (
      dir.join(format!("{job_id}.out")),
      dir.join(format!("{job_id}.err")),
    )
  }
}
