use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::api::{self, JobsApi, VolumesApi};
use crate::config::AgentConfig;
use crate::host::{ExecutionBackend, Host, JobStateStore, ProcessBackend};
use crate::volume::{DatasetOps, ProviderFactory, VolumeManager, ZfsCli};

/// Upper bound on how often finished jobs are pruned.
const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

/// The host agent: job store, execution backend, volume registry and the
/// HTTP API over them.
pub struct Node {
    pub config: AgentConfig,
    pub host: Host,
    pub volumes: Arc<VolumeManager>,
    factory: ProviderFactory,
}

impl Node {
    /// Build a node that runs jobs as local processes and manages zfs
    /// volumes through the `zfs` tool.
    pub fn new(config: AgentConfig) -> Self {
        let store = Arc::new(JobStateStore::new(config.listener_buffer));
        let backend = Arc::new(ProcessBackend::new(config.process.clone(), store.clone()));
        let datasets = Arc::new(ZfsCli::new(config.zfs.clone()));
        Self::from_parts(config, store, backend, datasets)
    }

    pub fn from_parts(
        config: AgentConfig,
        store: Arc<JobStateStore>,
        backend: Arc<dyn ExecutionBackend>,
        datasets: Arc<dyn DatasetOps>,
    ) -> Self {
        Self {
            host: Host::new(store, backend),
            volumes: Arc::new(VolumeManager::new()),
            factory: ProviderFactory::new(datasets),
            config,
        }
    }

    pub fn store(&self) -> &Arc<JobStateStore> {
        self.host.store()
    }

    pub fn router(&self) -> Router {
        let jobs = JobsApi::new(self.host.clone(), self.config.stream_check_interval);
        let volumes = VolumesApi::new(self.volumes.clone(), self.factory.clone());
        api::router(Arc::new(jobs), Arc::new(volumes))
    }

    /// Bind the configured address and serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve the API on an already-bound listener.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        if let Some(retention) = self.config.job_retention {
            tokio::spawn(retention_loop(
                self.store().clone(),
                retention,
                shutdown.clone(),
            ));
        }

        tracing::info!(addr = %listener.local_addr()?, "Host API listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }
}

/// Periodically drop finished jobs that ended more than `retention` ago.
async fn retention_loop(
    store: Arc<JobStateStore>,
    retention: Duration,
    shutdown: CancellationToken,
) {
    let Ok(max_age) = chrono::Duration::from_std(retention) else {
        tracing::warn!(?retention, "Job retention out of range, pruning disabled");
        return;
    };
    let period = retention.clamp(Duration::from_millis(100), PRUNE_INTERVAL);
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
                    continue;
                };
                let removed = store.prune_finished(cutoff);
                if removed > 0 {
                    tracing::info!(removed, "Pruned finished jobs");
                }
            }
        }
    }
}
