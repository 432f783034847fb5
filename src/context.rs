use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::cluster::Cluster;
use crate::config::Config;
use crate::job::DataLayout;
use crate::metrics::PipelineMetrics;
use crate::notify::Notifier;
use crate::scoring::ScoringClient;
use crate::shutdown::Shutdown;
use crate::state::DataStructures;
use crate::store::Store;

/// Everything a pipeline stage needs, passed explicitly to each loop.
///
/// Two contexts never share state unless built from the same parts, so several
/// pipelines can run side by side in one process.
#[derive(Clone)]
pub struct PipelineContext {
  pub config: Arc<Config>,
  pub layout: DataLayout,
  pub state: Arc<DataStructures>,
  pub store: Arc<dyn Store>,
  pub cluster: Arc<dyn Cluster>,
  pub scoring: Arc<dyn ScoringClient>,
  pub notifier: Arc<dyn Notifier>,
  pub metrics: PipelineMetrics,
  pub shutdown: Shutdown,
  /// Bounds concurrent structure parsing on the blocking pool.
  pub blocking_permits: Arc<Semaphore>,
}

impl PipelineContext {
  pub fn new(
    config: Config,
    store: Arc<dyn Store>,
    cluster: Arc<dyn Cluster>,
    scoring: Arc<dyn ScoringClient>,
    notifier: Arc<dyn Notifier>,
    shutdown: Shutdown,
  ) -> Self {
    let layout = DataLayout::new(config.data_dir.clone());
    let permits = config.scoring.blocking_workers.max(1);
    Self {
      config: Arc::new(config),
      layout,
      state: Arc::new(DataStructures::new()),
      store,
      cluster,
      scoring,
      notifier,
      metrics: PipelineMetrics::new(),
      shutdown,
      blocking_permits: Arc::new(Semaphore::new(permits)),
    }
  }
}

impl std::fmt::Debug for PipelineContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PipelineContext")
      .field("data_dir", &self.config.data_dir)
      .field("state", &self.state)
      .finish_non_exhaustive()
  }
}
