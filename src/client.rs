//! HTTP client for a remote host agent.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::{Response, StatusCode, Url};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::api::error::{ErrorBody, ErrorCode};
use crate::api::stream::ERROR_EVENT;
use crate::error::ClientError;
use crate::host::{ActiveJob, Event, Job, ALL_JOBS};
use crate::sse;
use crate::volume::{ProviderSpec, Volume};

const EVENT_BUFFER: usize = 64;

/// Client for one host agent.
#[derive(Debug, Clone)]
pub struct HostClient {
    http: reqwest::Client,
    base_url: String,
}

impl HostClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Base URL with `segments` appended, each percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", self.base_url, e)))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub async fn list_jobs(&self) -> Result<HashMap<String, ActiveJob>, ClientError> {
        let res = self.http.get(self.url(&["host", "jobs"])?).send().await?;
        Ok(check(res).await?.json().await?)
    }

    /// `Ok(None)` when the host does not know the job.
    pub async fn get_job(&self, id: &str) -> Result<Option<ActiveJob>, ClientError> {
        let res = self
            .http
            .get(self.url(&["host", "jobs", id])?)
            .send()
            .await?;
        Ok(check(res).await?.json().await?)
    }

    pub async fn add_job(&self, job: &Job) -> Result<(), ClientError> {
        let res = self
            .http
            .put(self.url(&["host", "jobs", &job.id])?)
            .json(job)
            .send()
            .await?;
        check(res).await?;
        Ok(())
    }

    pub async fn stop_job(&self, id: &str) -> Result<(), ClientError> {
        let res = self
            .http
            .delete(self.url(&["host", "jobs", id])?)
            .send()
            .await?;
        check(res).await?;
        Ok(())
    }

    /// Subscribe to job events. `id` may be a job ID or `"all"`.
    ///
    /// Returns once the host has accepted the stream. The returned sequence
    /// is one-shot: once it ends, call again to re-subscribe.
    pub async fn stream_events(&self, id: &str) -> Result<EventStream, ClientError> {
        let url = if id == ALL_JOBS {
            self.url(&["host", "jobs"])?
        } else {
            self.url(&["host", "jobs", id])?
        };
        let res = self
            .http
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        let res = check(res).await?;
        Ok(EventStream::spawn(res))
    }

    pub async fn create_provider(&self, spec: &ProviderSpec) -> Result<(), ClientError> {
        let res = self
            .http
            .post(self.url(&["volume", "provider"])?)
            .json(spec)
            .send()
            .await?;
        check(res).await?;
        Ok(())
    }

    /// Returns the new volume's ID.
    pub async fn new_volume(&self, provider_id: &str) -> Result<String, ClientError> {
        let res = self
            .http
            .post(self.url(&["volume", "provider", provider_id, "newVolume"])?)
            .send()
            .await?;
        Ok(check(res).await?.json().await?)
    }

    pub async fn snapshot(&self, volume_id: &str) -> Result<Volume, ClientError> {
        let res = self
            .http
            .put(self.url(&["volume", "x", volume_id, "snapshot"])?)
            .send()
            .await?;
        Ok(check(res).await?.json().await?)
    }
}

/// Pass successful responses through; turn anything else into a `ClientError`.
async fn check(res: Response) -> Result<Response, ClientError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }

    let text = res.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => (Some(body.code), body.message),
        Err(_) => (None, text),
    };

    Err(match (code, status) {
        (Some(ErrorCode::NotFound | ErrorCode::NoSuchJob), _) | (None, StatusCode::NOT_FOUND) => {
            ClientError::NotFound(message)
        }
        (Some(ErrorCode::Conflict | ErrorCode::AlreadyStopped), _)
        | (None, StatusCode::CONFLICT) => ClientError::Conflict(message),
        (Some(ErrorCode::ValidationError), _) | (None, StatusCode::BAD_REQUEST) => {
            ClientError::Validation(message)
        }
        (Some(ErrorCode::ServerError | ErrorCode::ListenerOverflow), _) => {
            ClientError::Server(message)
        }
        (None, status) if status.is_server_error() => ClientError::Server(message),
        (None, status) => ClientError::UnexpectedStatus {
            status: status.as_u16(),
            message,
        },
    })
}

/// How an [`EventStream`] ended.
#[derive(Debug)]
pub enum StreamOutcome {
    /// The host closed the stream cleanly.
    Ended,
    /// Reading or decoding failed, or the host ended the stream with an error.
    Failed(ClientError),
}

/// A finite sequence of events decoded from a host's event stream.
///
/// A background task reads the response body and feeds events into the
/// sequence. Once the sequence yields `None`, [`outcome`](Self::outcome)
/// reports why. Dropping the stream aborts the task and closes the
/// connection.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
    outcome_rx: oneshot::Receiver<StreamOutcome>,
    outcome: Option<StreamOutcome>,
    task: JoinHandle<()>,
}

impl EventStream {
    fn spawn(response: Response) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let task = tokio::spawn(decode_events(response, tx, outcome_tx));
        Self {
            rx,
            outcome_rx,
            outcome: None,
            task,
        }
    }

    pub async fn next_event(&mut self) -> Option<Event> {
        self.next().await
    }

    /// `None` while events may still arrive.
    pub fn outcome(&self) -> Option<&StreamOutcome> {
        self.outcome.as_ref()
    }

    /// The terminal error, if the stream ended with one.
    pub fn err(&self) -> Option<&ClientError> {
        match &self.outcome {
            Some(StreamOutcome::Failed(e)) => Some(e),
            _ => None,
        }
    }

    fn finish(&mut self) {
        if self.outcome.is_some() {
            return;
        }
        // The decode task reports its outcome before dropping the event sender.
        self.outcome = Some(self.outcome_rx.try_recv().unwrap_or_else(|_| {
            StreamOutcome::Failed(ClientError::Stream(
                "event decode task exited without reporting".to_string(),
            ))
        }));
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(event)),
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn decode_events(
    response: Response,
    tx: mpsc::Sender<Event>,
    outcome_tx: oneshot::Sender<StreamOutcome>,
) {
    let outcome = pump(response, &tx).await;
    match &outcome {
        StreamOutcome::Ended => tracing::debug!("Event stream ended"),
        StreamOutcome::Failed(e) => tracing::warn!(error = %e, "Event stream failed"),
    }
    let _ = outcome_tx.send(outcome);
}

async fn pump(response: Response, tx: &mpsc::Sender<Event>) -> StreamOutcome {
    let mut body = response.bytes_stream();
    let mut decoder = sse::Decoder::new();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return StreamOutcome::Failed(ClientError::Http(e)),
        };
        for frame in decoder.push(&chunk) {
            if frame.event.as_deref() == Some(ERROR_EVENT) {
                let message = serde_json::from_str::<ErrorBody>(&frame.data)
                    .map(|body| body.message)
                    .unwrap_or(frame.data);
                return StreamOutcome::Failed(ClientError::Stream(message));
            }
            let event: Event = match serde_json::from_str(&frame.data) {
                Ok(event) => event,
                Err(e) => return StreamOutcome::Failed(ClientError::Decode(e)),
            };
            if tx.send(event).await.is_err() {
                // consumer dropped the sequence
                return StreamOutcome::Ended;
            }
        }
    }
    if decoder.has_partial() {
        return StreamOutcome::Failed(ClientError::Stream(
            "stream closed in the middle of an event frame".to_string(),
        ));
    }
    StreamOutcome::Ended
}
