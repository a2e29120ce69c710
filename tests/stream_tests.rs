//! End-to-end event stream and client tests over a real socket.


use std::time::Duration;

use axum::http::header::CONTENT_TYPE;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use tokio::net::TcpListener;

use host_agent::client::{HostClient, StreamOutcome};
use host_agent::config::AgentConfig;
use host_agent::error::ClientError;
use host_agent::host::{Job, JobStatus, StatusUpdate};
use host_agent::volume::{ProviderSpec, PARENT_DATASET};
use test_harness::{assert_eventually, TestAgent};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn next_status(events: &mut host_agent::client::EventStream) -> (String, JobStatus) {
    let event = tokio::time::timeout(RECV_TIMEOUT, events.next())
        .await
        .expect("timed out waiting for event")
        .expect("stream ended early");
    (event.job_id, event.status)
}

async fn wait_for_listeners(agent: &TestAgent, count: usize) {
    let store = agent.store.clone();
    assert_eventually(
        || {
            let store = store.clone();
            async move { store.listener_count() == count }
        },
        RECV_TIMEOUT,
        &format!("expected {} stream listeners", count),
    )
    .await;
}

/// Serve `body` verbatim as the event stream of an otherwise empty host.
async fn canned_stream_client(body: &'static str) -> HostClient {
    let router = Router::new().route(
        "/host/jobs",
        get(move || async move { ([(CONTENT_TYPE, "text/event-stream")], body) }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    HostClient::new(format!("http://{}", addr))
}

async fn drain(events: &mut host_agent::client::EventStream) -> usize {
    let mut received = 0;
    while tokio::time::timeout(RECV_TIMEOUT, events.next_event())
        .await
        .expect("stream should terminate")
        .is_some()
    {
        received += 1;
    }
    received
}

// =============================================================================
// Event routing
// =============================================================================

#[tokio::test]
async fn test_all_stream_sees_every_job() {
    let agent = TestAgent::start(AgentConfig::default()).await;
    let mut events = agent.client.stream_events("all").await.unwrap();

    agent.client.add_job(&Job::new("a")).await.unwrap();
    agent.client.add_job(&Job::new("b")).await.unwrap();

    assert_eq!(next_status(&mut events).await, ("a".to_string(), JobStatus::Starting));
    assert_eq!(next_status(&mut events).await, ("b".to_string(), JobStatus::Starting));
}

#[tokio::test]
async fn test_job_stream_is_filtered_and_ordered() {
    let agent = TestAgent::start(AgentConfig::default()).await;
    agent.store.add_job(Job::new("x")).unwrap();
    agent.store.add_job(Job::new("y")).unwrap();
    let mut events = agent.client.stream_events("x").await.unwrap();

    agent.store.set_status("y", StatusUpdate::running()).unwrap();
    agent.store.set_status("x", StatusUpdate::running()).unwrap();
    agent.store.set_status("y", StatusUpdate::exited(1)).unwrap();
    agent.store.set_status("x", StatusUpdate::exited(0)).unwrap();

    assert_eq!(next_status(&mut events).await, ("x".to_string(), JobStatus::Running));
    assert_eq!(next_status(&mut events).await, ("x".to_string(), JobStatus::Done));
}

#[tokio::test]
async fn test_event_payload_carries_job_record() {
    let agent = TestAgent::start(AgentConfig::default()).await;
    let mut events = agent.client.stream_events("all").await.unwrap();

    agent
        .client
        .add_job(&Job::new("web").with_metadata("app", "frontend"))
        .await
        .unwrap();

    let event = tokio::time::timeout(RECV_TIMEOUT, events.next_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.job.id(), "web");
    assert_eq!(event.job.job.metadata["app"], "frontend");
}

// =============================================================================
// Session lifetime
// =============================================================================

#[tokio::test]
async fn test_stream_for_missing_job_ends_with_error() {
    let agent = TestAgent::with_stream_check(Duration::from_millis(200)).await;
    let mut events = agent.client.stream_events("never-existed").await.unwrap();

    let next = tokio::time::timeout(Duration::from_secs(3), events.next_event())
        .await
        .expect("stream for a missing job should terminate");

    assert!(next.is_none());
    match events.outcome() {
        Some(StreamOutcome::Failed(ClientError::Stream(message))) => {
            assert!(message.contains("never-existed"), "message: {}", message);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    wait_for_listeners(&agent, 0).await;
}

#[tokio::test]
async fn test_stream_for_pruned_job_ends_after_quiet_interval() {
    let agent = TestAgent::with_stream_check(Duration::from_millis(200)).await;
    agent.store.add_job(Job::new("a")).unwrap();
    let mut events = agent.client.stream_events("a").await.unwrap();

    agent.store.set_status("a", StatusUpdate::failed("boom")).unwrap();
    assert_eq!(next_status(&mut events).await, ("a".to_string(), JobStatus::Failed));
    agent
        .store
        .prune_finished(chrono::Utc::now() + chrono::Duration::seconds(1));

    let next = tokio::time::timeout(Duration::from_secs(3), events.next_event())
        .await
        .unwrap();
    assert!(next.is_none());
    assert!(matches!(events.err(), Some(ClientError::Stream(_))));
}

#[tokio::test]
async fn test_all_stream_survives_quiet_intervals() {
    let agent = TestAgent::with_stream_check(Duration::from_millis(100)).await;
    let mut events = agent.client.stream_events("all").await.unwrap();

    let quiet = tokio::time::timeout(Duration::from_millis(600), events.next_event()).await;
    assert!(quiet.is_err(), "wildcard stream should stay open while idle");
    assert!(events.outcome().is_none());

    agent.client.add_job(&Job::new("late")).await.unwrap();
    assert_eq!(next_status(&mut events).await, ("late".to_string(), JobStatus::Starting));
}

#[tokio::test]
async fn test_existing_job_stream_survives_quiet_intervals() {
    let agent = TestAgent::with_stream_check(Duration::from_millis(100)).await;
    agent.store.add_job(Job::new("a")).unwrap();
    let mut events = agent.client.stream_events("a").await.unwrap();

    let quiet = tokio::time::timeout(Duration::from_millis(500), events.next_event()).await;
    assert!(quiet.is_err());

    agent.store.set_status("a", StatusUpdate::running()).unwrap();
    assert_eq!(next_status(&mut events).await, ("a".to_string(), JobStatus::Running));
}

#[tokio::test]
async fn test_dropping_stream_releases_listener() {
    let agent = TestAgent::start(AgentConfig::default()).await;
    let events = agent.client.stream_events("all").await.unwrap();
    wait_for_listeners(&agent, 1).await;

    drop(events);

    // a write is what surfaces the disconnect on the server side
    for i in 0..100 {
        if agent.store.listener_count() == 0 {
            break;
        }
        agent.store.add_job(Job::new(format!("poke-{}", i))).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(agent.store.listener_count(), 0);
}

#[tokio::test]
async fn test_overflowed_listener_ends_with_error() {
    let agent = TestAgent::start(AgentConfig::default().with_listener_buffer(1)).await;
    let mut events = agent.client.stream_events("all").await.unwrap();
    wait_for_listeners(&agent, 1).await;

    // no await in between: the session cannot keep up
    for i in 0..50 {
        agent.store.add_job(Job::new(format!("burst-{}", i))).unwrap();
    }

    let received = drain(&mut events).await;
    assert!(received < 50, "received all {} events", received);
    match events.outcome() {
        Some(StreamOutcome::Failed(ClientError::Stream(message))) => {
            assert!(message.contains("fell behind"), "message: {}", message);
        }
        other => panic!("unexpected outcome after {} events: {:?}", received, other),
    }
    wait_for_listeners(&agent, 0).await;
}

// =============================================================================
// Client
// =============================================================================

#[tokio::test]
async fn test_malformed_event_payload_is_decode_error() {
    let client = canned_stream_client("data: not json\n\n").await;
    let mut events = client.stream_events("all").await.unwrap();

    assert_eq!(drain(&mut events).await, 0);
    assert!(
        matches!(events.err(), Some(ClientError::Decode(_))),
        "{:?}",
        events.outcome()
    );
}

#[tokio::test]
async fn test_truncated_frame_is_stream_error() {
    let client = canned_stream_client("data: {\"job_id\":\"a\",\"sta").await;
    let mut events = client.stream_events("all").await.unwrap();

    assert_eq!(drain(&mut events).await, 0);
    match events.outcome() {
        Some(StreamOutcome::Failed(ClientError::Stream(message))) => {
            assert!(message.contains("middle of an event frame"), "message: {}", message);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_clean_close_after_complete_frames_is_ended() {
    let client = canned_stream_client(": keep-alive\n\n").await;
    let mut events = client.stream_events("all").await.unwrap();

    assert_eq!(drain(&mut events).await, 0);
    assert!(matches!(events.outcome(), Some(StreamOutcome::Ended)));
}

#[tokio::test]
async fn test_client_escapes_job_ids() {
    let agent = TestAgent::start(AgentConfig::default()).await;
    let id = "batch/7?retry#1 x";

    agent.client.add_job(&Job::new(id)).await.unwrap();

    let job = agent.client.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.id(), id);
    assert!(agent.client.list_jobs().await.unwrap().contains_key(id));
    agent.client.stop_job(id).await.unwrap();
    assert!(agent.store.get_job(id).unwrap().force_stop);
}

#[tokio::test]
async fn test_client_error_mapping() {
    let agent = TestAgent::start(AgentConfig::default()).await;

    let err = agent.client.stop_job("ghost").await.unwrap_err();
    assert!(matches!(err, ClientError::NotFound(_)), "{:?}", err);

    agent.client.add_job(&Job::new("a")).await.unwrap();
    agent.store.set_status("a", StatusUpdate::failed("x")).unwrap();
    let err = agent.client.stop_job("a").await.unwrap_err();
    assert!(matches!(err, ClientError::Conflict(_)), "{:?}", err);

    let err = agent
        .client
        .create_provider(&ProviderSpec::new("nfs"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Validation(_)), "{:?}", err);

    let err = agent.client.new_volume("bogus").await.unwrap_err();
    assert!(matches!(err, ClientError::NotFound(_)), "{:?}", err);
}

#[tokio::test]
async fn test_client_jobs_round_trip() {
    let agent = TestAgent::start(AgentConfig::default()).await;
    assert!(agent.client.list_jobs().await.unwrap().is_empty());
    assert!(agent.client.get_job("a").await.unwrap().is_none());

    agent
        .client
        .add_job(&Job::new("a").with_command("true"))
        .await
        .unwrap();

    let jobs = agent.client.list_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    let job = agent.client.get_job("a").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Starting);
    assert_eq!(job.job.command.as_deref(), Some("true"));
    assert_eq!(agent.backend.runs(), vec!["a".to_string()]);
}

#[tokio::test]
async fn test_client_volume_flow() {
    let agent = TestAgent::start(AgentConfig::default()).await;
    let spec = ProviderSpec::new("zfs").with_metadata(PARENT_DATASET, "tank/flynn");

    agent.client.create_provider(&spec).await.unwrap();
    let volume_id = agent.client.new_volume("zfs").await.unwrap();
    let snapshot = agent.client.snapshot(&volume_id).await.unwrap();

    assert!(agent.datasets.contains(&format!("tank/flynn/{}", volume_id)));
    assert_eq!(snapshot.snapshot_of, Some(volume_id));
}
