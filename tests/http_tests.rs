
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use cron_dispatch::http::{router, HttpServerHandle, HttpState};
use cron_dispatch::scheduler::{JobScheduler, Scheduler};
use cron_dispatch::shutdown::FrontEnd;
use cron_dispatch::store::{MemoryTaskLogStore, NewTaskLog, TaskLogStore};
use test_harness::{new_scheduler, start_shell_agent};

fn create_test_app() -> (Router, Arc<JobScheduler>, Arc<MemoryTaskLogStore>) {
    let (scheduler, store) = new_scheduler();
    scheduler.initialize();
    let app = router(HttpState {
        scheduler: scheduler.clone(),
        store: store.clone(),
    });
    (app, scheduler, store)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn seed_log(store: &MemoryTaskLogStore, hosts: Vec<&str>) -> i64 {
    store
        .create(NewTaskLog {
            task_id: 42,
            name: "cleanup".to_string(),
            command: "sleep 100".to_string(),
            hosts: hosts.into_iter().map(String::from).collect(),
        })
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_health() {
    let (app, _, _) = create_test_app();

    let (status, body) = send(&app, get("/api/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["accepting"], true);
    assert_eq!(body["running"], 0);
}

#[tokio::test]
async fn test_run_task_and_read_log() {
    let agent = start_shell_agent().await;
    let (app, scheduler, _) = create_test_app();

    let (status, body) = send(
        &app,
        post_json(
            "/api/tasks/run",
            json!({
                "task_id": 9,
                "name": "hello",
                "command": "echo via-http",
                "timeout": 5,
                "hosts": [agent.addr.to_string()],
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "running");
    let id = body["id"].as_i64().unwrap();

    scheduler.wait_and_exit().await;

    let (status, body) = send(&app, get(&format!("/api/task-logs/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "finish");
    assert_eq!(body["result"], "via-http\n");
    assert_eq!(body["name"], "hello");
}

#[tokio::test]
async fn test_run_task_rejects_invalid_job() {
    let (app, _, _) = create_test_app();

    let (status, body) = send(
        &app,
        post_json(
            "/api/tasks/run",
            json!({"task_id": 1, "command": "true", "hosts": []}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("no hosts"));
}

#[tokio::test]
async fn test_run_task_rejected_while_shutting_down() {
    let (app, scheduler, _) = create_test_app();
    scheduler.wait_and_exit().await;

    let (status, _) = send(
        &app,
        post_json(
            "/api/tasks/run",
            json!({"task_id": 1, "command": "true", "hosts": ["127.0.0.1:5921"]}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_stop_uses_recorded_hosts() {
    let (app, _, store) = create_test_app();
    let id = seed_log(&store, vec!["10.0.0.1:5921", "10.0.0.2:5921"]).await;

    let (status, body) = send(&app, post_json("/api/task-logs/stop", json!({"id": id}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["signalled"], 0);
    assert_eq!(body["orphaned"], 2);

    let (_, log) = send(&app, get(&format!("/api/task-logs/{id}"))).await;
    assert_eq!(log["status"], "cancel");
}

#[tokio::test]
async fn test_stop_unknown_log() {
    let (app, _, _) = create_test_app();

    let (status, _) = send(&app, post_json("/api/task-logs/stop", json!({"id": 404}))).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_get_unknown_log() {
    let (app, _, _) = create_test_app();

    let (status, body) = send(&app, get("/api/task-logs/999")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("999"));
}

#[tokio::test]
async fn test_server_handle_drains() {
    let (scheduler, store) = new_scheduler();
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let handle = HttpServerHandle::bind(
        addr,
        HttpState {
            scheduler,
            store: store.clone(),
        },
    )
    .await
    .unwrap();
    assert_ne!(handle.local_addr().port(), 0);

    let conn = tokio::net::TcpStream::connect(handle.local_addr()).await;
    assert!(conn.is_ok());
    drop(conn);

    handle.shutdown().await.unwrap();
    // A second drain is a no-op.
    handle.shutdown().await.unwrap();
}
