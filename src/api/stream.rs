//! Live job events as a long-lived server-sent-events response.
//!
//! The listener is registered before the response head is returned, so no
//! event that happens after the client sees `200` is missed. A session ends
//! when the client goes away, when encoding fails, when the store drops the
//! listener for falling behind, or when a quiet interval passes and the
//! requested job is not in the store. The wildcard stream is exempt from the
//! last one. Every end the client did not cause is announced with a final
//! `error` event carrying an [`ErrorBody`].

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;

use crate::api::error::{ErrorBody, ErrorCode};
use crate::host::{JobStateStore, Listener, ListenerKey};
use crate::sse;

/// SSE event name of the frame sent before the host closes a stream.
pub const ERROR_EVENT: &str = "error";

const BODY_BUFFER: usize = 16;

type FrameSender = mpsc::Sender<Result<SseEvent, Infallible>>;

#[derive(Debug)]
enum SessionEnd {
    Disconnected,
    ListenerOverflow,
    Encode(axum::Error),
    NoSuchJob,
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::Disconnected => write!(f, "client disconnected"),
            SessionEnd::ListenerOverflow => write!(f, "listener fell behind"),
            SessionEnd::Encode(e) => write!(f, "encode failed: {}", e),
            SessionEnd::NoSuchJob => write!(f, "no such job"),
        }
    }
}

/// Open an event stream for `key` and return the streaming response.
pub fn event_stream(
    store: Arc<JobStateStore>,
    key: ListenerKey,
    check_interval: Duration,
) -> Response {
    let listener = store.add_listener(key);
    let (tx, rx) = mpsc::channel(BODY_BUFFER);

    tokio::spawn(run_session(store, listener, tx, check_interval));

    (
        [(CONTENT_TYPE, sse::CONTENT_TYPE), (CACHE_CONTROL, "no-cache")],
        Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

async fn run_session(
    store: Arc<JobStateStore>,
    mut listener: Listener,
    tx: FrameSender,
    check_interval: Duration,
) {
    let key = listener.key().clone();
    tracing::info!(listener = %key, "Event stream opened");

    let mut liveness = tokio::time::interval_at(Instant::now() + check_interval, check_interval);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let end = loop {
        tokio::select! {
            // body dropped by the server: the connection is gone
            _ = tx.closed() => break SessionEnd::Disconnected,

            event = listener.recv() => {
                // the store only closes a listener it dropped for overflowing
                let Some(event) = event else {
                    break SessionEnd::ListenerOverflow;
                };
                let frame = match SseEvent::default().json_data(&event) {
                    Ok(frame) => frame,
                    Err(e) => break SessionEnd::Encode(e),
                };
                if tx.send(Ok(frame)).await.is_err() {
                    break SessionEnd::Disconnected;
                }
                liveness.reset();
            }

            _ = liveness.tick() => {
                let Some(job_id) = key.job_id() else {
                    continue;
                };
                if store.get_job(job_id).is_none() {
                    break SessionEnd::NoSuchJob;
                }
            }
        }
    };

    store.remove_listener(&listener);

    let closing = match &end {
        SessionEnd::Disconnected => None,
        SessionEnd::ListenerOverflow => Some(ErrorBody {
            code: ErrorCode::ListenerOverflow,
            message: format!(
                "listener for {} fell behind and was dropped; events were lost",
                key
            ),
        }),
        SessionEnd::Encode(e) => Some(ErrorBody {
            code: ErrorCode::ServerError,
            message: format!("failed to encode event: {}", e),
        }),
        SessionEnd::NoSuchJob => Some(ErrorBody {
            code: ErrorCode::NoSuchJob,
            message: format!("no such job: {}", key),
        }),
    };
    if let Some(body) = closing {
        send_error(&tx, &body).await;
    }

    tracing::info!(listener = %key, reason = %end, "Event stream closed");
}

async fn send_error(tx: &FrameSender, body: &ErrorBody) {
    match SseEvent::default().event(ERROR_EVENT).json_data(body) {
        Ok(frame) => {
            let _ = tx.send(Ok(frame)).await;
        }
        Err(e) => tracing::warn!(error = %e, "Failed to encode stream error frame"),
    }
}
