//! HTTP surface of the agent.
//!
//! | route                                        | handler                |
//! |----------------------------------------------|------------------------|
//! | `GET /host/jobs`                             | all jobs, or stream    |
//! | `GET /host/jobs/{id}`                        | one job, or stream     |
//! | `PUT /host/jobs/{id}`                        | accept a job           |
//! | `DELETE /host/jobs/{id}`                     | stop a job             |
//! | `POST /volume/provider`                      | register a provider    |
//! | `POST /volume/provider/{provider_id}/newVolume` | issue a volume      |
//! | `PUT /volume/x/{id}/snapshot`                | snapshot a volume      |
//!
//! Requests with `Accept: text/event-stream` on the job reads switch to a
//! live event stream (see [`stream`]).

pub mod error;
pub mod jobs;
pub mod stream;
pub mod volumes;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

pub use error::{ApiError, ErrorBody, ErrorCode};
pub use jobs::JobsApi;
pub use volumes::VolumesApi;

pub fn router(jobs: Arc<JobsApi>, volumes: Arc<VolumesApi>) -> Router {
    Router::new()
        .merge(jobs.routes())
        .merge(volumes.routes())
        .layer(TraceLayer::new_for_http())
}
