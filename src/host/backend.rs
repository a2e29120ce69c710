use async_trait::async_trait;

use crate::error::Result;
use crate::host::job::Job;

/// The component that actually starts and stops a job's process or container.
///
/// Backends report lifecycle progress back through
/// [`JobStateStore::set_status`](crate::host::JobStateStore::set_status);
/// on leaving `Starting` they must honour the returned force-stop flag.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Begin running a job that the store has just accepted in `Starting`.
    async fn run(&self, job: Job) -> Result<()>;

    /// Stop a running job.
    async fn stop(&self, id: &str) -> Result<()>;
}
