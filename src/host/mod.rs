//! Job lifecycle tracking for this host.
//!
//! - [`JobStateStore`]: the in-memory job map, the stop/force-stop state
//!   machine and the listener registry that fans status changes out
//! - [`ExecutionBackend`]: the narrow seam to whatever runs jobs
//! - [`ProcessBackend`]: a backend that runs jobs as local shell processes
//! - [`Host`]: ties the store to a backend
//!
//! # Stop requests
//!
//! | status     | effect                                  |
//! |------------|-----------------------------------------|
//! | `starting` | force stop recorded, backend untouched  |
//! | `running`  | backend `stop`, its result propagated   |
//! | terminal   | `AlreadyStopped`                        |
//! | unknown    | `UnknownJob`                            |

pub mod backend;
pub mod job;
pub mod process;
pub mod state;

use std::sync::Arc;

pub use backend::ExecutionBackend;
pub use job::{ActiveJob, Event, Job, JobStatus};
pub use process::ProcessBackend;
pub use state::{
    JobStateStore, Listener, ListenerKey, StatusChange, StatusUpdate, StopAction, ALL_JOBS,
};

use crate::error::Result;

/// A job store paired with the backend that executes its jobs.
#[derive(Clone)]
pub struct Host {
    store: Arc<JobStateStore>,
    backend: Arc<dyn ExecutionBackend>,
}

impl Host {
    pub fn new(store: Arc<JobStateStore>, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self { store, backend }
    }

    pub fn store(&self) -> &Arc<JobStateStore> {
        &self.store
    }

    /// Accept a job onto this host and hand it to the backend.
    ///
    /// If the backend refuses it the job is recorded as `Failed`.
    pub async fn add_job(&self, job: Job) -> Result<ActiveJob> {
        let active = self.store.add_job(job.clone())?;
        if let Err(e) = self.backend.run(job).await {
            tracing::warn!(job_id = %active.id(), error = %e, "Backend failed to run job");
            if let Err(update_err) = self
                .store
                .set_status(active.id(), StatusUpdate::failed(e.to_string()))
            {
                tracing::debug!(job_id = %active.id(), error = %update_err, "Job already moved on");
            }
            return Err(e);
        }
        Ok(active)
    }

    pub async fn stop_job(&self, id: &str) -> Result<()> {
        match self.store.begin_stop(id)? {
            StopAction::Deferred => {
                tracing::info!(job_id = %id, "Job still starting, force stop recorded");
                Ok(())
            }
            StopAction::Backend => self.backend.stop(id).await,
        }
    }
}
