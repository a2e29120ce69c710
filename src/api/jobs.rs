use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::header::ACCEPT;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use crate::api::error::ApiError;
use crate::api::stream::event_stream;
use crate::host::{Host, Job, ListenerKey};

/// Handlers for `/host/jobs`.
pub struct JobsApi {
    host: Host,
    stream_check_interval: Duration,
}

impl JobsApi {
    pub fn new(host: Host, stream_check_interval: Duration) -> Self {
        Self {
            host,
            stream_check_interval,
        }
    }

    pub fn routes(self: Arc<Self>) -> Router {
        Router::new()
            .route("/host/jobs", get(list_jobs))
            .route(
                "/host/jobs/{id}",
                get(get_job).put(add_job).delete(stop_job),
            )
            .with_state(self)
    }

    fn stream(&self, key: ListenerKey) -> Response {
        event_stream(self.host.store().clone(), key, self.stream_check_interval)
    }
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"))
}

async fn list_jobs(State(api): State<Arc<JobsApi>>, headers: HeaderMap) -> Response {
    if wants_event_stream(&headers) {
        return api.stream(ListenerKey::All);
    }
    Json(api.host.store().get()).into_response()
}

/// An unknown job is `200 null`, not a 404.
async fn get_job(
    State(api): State<Arc<JobsApi>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if wants_event_stream(&headers) {
        return api.stream(ListenerKey::parse(&id));
    }
    Json(api.host.store().get_job(&id)).into_response()
}

async fn add_job(
    State(api): State<Arc<JobsApi>>,
    Path(id): Path<String>,
    payload: Result<Json<Job>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(mut job) = payload?;
    job.id = id;
    api.host.add_job(job).await?;
    Ok(StatusCode::OK)
}

async fn stop_job(
    State(api): State<Arc<JobsApi>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    api.host.stop_job(&id).await?;
    Ok(StatusCode::OK)
}
