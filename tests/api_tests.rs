//! HTTP API tests driven through the router without a socket.


use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use host_agent::config::AgentConfig;
use host_agent::host::{JobStateStore, JobStatus, StatusUpdate};
use host_agent::node::Node;
use test_harness::{MemoryDatasets, RecordingBackend};

struct TestApi {
    router: Router,
    store: Arc<JobStateStore>,
    backend: Arc<RecordingBackend>,
}

fn create_test_api() -> TestApi {
    let store = Arc::new(JobStateStore::default());
    let backend = RecordingBackend::new();
    let datasets = MemoryDatasets::with_dataset("tank/flynn");
    let node = Node::from_parts(
        AgentConfig::default(),
        store.clone(),
        backend.clone(),
        datasets,
    );
    TestApi {
        router: node.router(),
        store,
        backend,
    }
}

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = router
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

// =============================================================================
// Jobs
// =============================================================================

#[tokio::test]
async fn test_list_jobs_empty() {
    let api = create_test_api();

    let (status, json) = send(&api.router, Method::GET, "/host/jobs", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({}));
}

#[tokio::test]
async fn test_put_job_then_list_and_get() {
    let api = create_test_api();

    let (status, _) = send(
        &api.router,
        Method::PUT,
        "/host/jobs/web-1",
        Some(json!({"id": "ignored", "metadata": {"app": "web"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(api.backend.runs(), vec!["web-1".to_string()]);

    let (_, jobs) = send(&api.router, Method::GET, "/host/jobs", None).await;
    assert_eq!(jobs["web-1"]["status"], "starting");
    assert_eq!(jobs["web-1"]["job"]["metadata"]["app"], "web");

    let (status, job) = send(&api.router, Method::GET, "/host/jobs/web-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["job"]["id"], "web-1");
}

#[tokio::test]
async fn test_put_duplicate_job_conflicts() {
    let api = create_test_api();
    send(&api.router, Method::PUT, "/host/jobs/a", Some(json!({"id": "a"}))).await;

    let (status, body) =
        send(&api.router, Method::PUT, "/host/jobs/a", Some(json!({"id": "a"}))).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");
}

#[tokio::test]
async fn test_put_job_malformed_body() {
    let api = create_test_api();

    let (status, body) = send(
        &api.router,
        Method::PUT,
        "/host/jobs/a",
        Some(json!({"metadata": "not a map"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation_error");
    assert!(api.store.is_empty());
}

#[tokio::test]
async fn test_get_unknown_job_is_null() {
    let api = create_test_api();

    let (status, body) = send(&api.router, Method::GET, "/host/jobs/ghost", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn test_stop_job_status_codes() {
    let api = create_test_api();

    let (status, body) = send(&api.router, Method::DELETE, "/host/jobs/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    send(&api.router, Method::PUT, "/host/jobs/a", Some(json!({"id": "a"}))).await;
    let (status, _) = send(&api.router, Method::DELETE, "/host/jobs/a", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(api.store.get_job("a").unwrap().force_stop);
    assert!(api.backend.stops().is_empty());

    api.store.set_status("a", StatusUpdate::running()).unwrap();
    let (status, _) = send(&api.router, Method::DELETE, "/host/jobs/a", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(api.backend.stops(), vec!["a".to_string()]);

    api.store.set_status("a", StatusUpdate::stopped()).unwrap();
    let (status, body) = send(&api.router, Method::DELETE, "/host/jobs/a", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "already_stopped");
}

#[tokio::test]
async fn test_stop_backend_failure_is_server_error() {
    let api = create_test_api();
    send(&api.router, Method::PUT, "/host/jobs/a", Some(json!({"id": "a"}))).await;
    api.store.set_status("a", StatusUpdate::running()).unwrap();
    api.backend.fail_stops("kill failed");

    let (status, body) = send(&api.router, Method::DELETE, "/host/jobs/a", None).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "server_error");
    assert_eq!(api.store.get_job("a").unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn test_event_stream_response_headers() {
    let api = create_test_api();

    let response = api
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/host/jobs")
                .header(header::ACCEPT, "text/event-stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream; charset=utf-8"
    );
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    assert_eq!(api.store.listener_count(), 1);
}

// =============================================================================
// Volumes
// =============================================================================

#[tokio::test]
async fn test_create_provider_and_new_volume() {
    let api = create_test_api();

    let (status, body) = send(
        &api.router,
        Method::POST,
        "/volume/provider",
        Some(json!({"kind": "zfs", "metadata": {"parent_dataset": "tank/flynn"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));

    let (status, first) =
        send(&api.router, Method::POST, "/volume/provider/zfs/newVolume", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, second) =
        send(&api.router, Method::POST, "/volume/provider/zfs/newVolume", None).await;

    let first = first.as_str().unwrap();
    assert!(!first.is_empty());
    assert_ne!(first, second.as_str().unwrap());

    let (status, body) =
        send(&api.router, Method::POST, "/volume/provider/bogus/newVolume", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn test_create_provider_validation_errors() {
    let api = create_test_api();

    for spec in [
        json!({"kind": "zfs"}),
        json!({"kind": "zfs", "metadata": {"parent_dataset": ""}}),
        json!({"kind": "lvm", "metadata": {"parent_dataset": "tank/flynn"}}),
        json!({"kind": ""}),
        json!({"metadata": {}}),
        json!({"id": "", "kind": "zfs", "metadata": {"parent_dataset": "tank/flynn"}}),
    ] {
        let (status, body) =
            send(&api.router, Method::POST, "/volume/provider", Some(spec.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "spec: {}", spec);
        assert_eq!(body["code"], "validation_error", "spec: {}", spec);
    }
}

#[tokio::test]
async fn test_create_provider_backend_failure() {
    let api = create_test_api();

    let (status, body) = send(
        &api.router,
        Method::POST,
        "/volume/provider",
        Some(json!({"kind": "zfs", "metadata": {"parent_dataset": "tank/missing"}})),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "server_error");
}

#[tokio::test]
async fn test_create_duplicate_provider() {
    let api = create_test_api();
    let spec = json!({"id": "fast", "kind": "zfs", "metadata": {"parent_dataset": "tank/flynn"}});
    send(&api.router, Method::POST, "/volume/provider", Some(spec.clone())).await;

    let (status, body) = send(&api.router, Method::POST, "/volume/provider", Some(spec)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "conflict");

    let (status, _) =
        send(&api.router, Method::POST, "/volume/provider/fast/newVolume", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_duplicate_provider_rejected_before_building() {
    let api = create_test_api();
    let spec = json!({"id": "fast", "kind": "zfs", "metadata": {"parent_dataset": "tank/flynn"}});
    send(&api.router, Method::POST, "/volume/provider", Some(spec)).await;

    // would fail to build, but the ID is taken first
    let (status, body) = send(
        &api.router,
        Method::POST,
        "/volume/provider",
        Some(json!({"id": "fast", "kind": "zfs", "metadata": {"parent_dataset": "tank/missing"}})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "conflict");
}

#[tokio::test]
async fn test_snapshot_endpoint() {
    let api = create_test_api();
    send(
        &api.router,
        Method::POST,
        "/volume/provider",
        Some(json!({"kind": "zfs", "metadata": {"parent_dataset": "tank/flynn"}})),
    )
    .await;
    let (_, volume_id) =
        send(&api.router, Method::POST, "/volume/provider/zfs/newVolume", None).await;
    let volume_id = volume_id.as_str().unwrap();

    let (status, snapshot) = send(
        &api.router,
        Method::PUT,
        &format!("/volume/x/{}/snapshot", volume_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["snapshot_of"], volume_id);
    assert_ne!(snapshot["id"], volume_id);

    let (status, body) = send(&api.router, Method::PUT, "/volume/x/nope/snapshot", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}
