mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use common::{open_manager, program_registry, setup_db};
use cronflow::api::{router, ApiState};
use cronflow::jobs::Manager;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn app() -> (Router, Manager) {
    let manager = open_manager(setup_db().await, program_registry()).await;
    let app = router(ApiState {
        manager: manager.clone(),
    });
    (app, manager)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };

    let res = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
    };
    (status, value)
}

fn echo_job(name: &str) -> Value {
    json!({
        "name": name,
        "runner_type": "program",
        "runner_config": {"command": "echo", "args": ["hi"]},
        "trigger_type": "manual"
    })
}

#[tokio::test]
async fn health() {
    let (app, _) = app().await;
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("ok".into()));
}

#[tokio::test]
async fn job_lifecycle_over_http() {
    let (app, manager) = app().await;

    let (status, job) = send(&app, Method::POST, "/jobs", Some(echo_job("api-job"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(job["name"], "api-job");
    assert_eq!(job["runner_config"]["command"], "echo");
    assert_eq!(job["concurrency_policy"], "forbid");
    assert_eq!(job["next_run_at"], Value::Null);
    let id = job["id"].as_str().unwrap().to_string();

    let (status, list) = send(&app, Method::GET, "/jobs?limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["total"], 1);
    assert_eq!(list["limit"], 10);

    let (status, patched) = send(
        &app,
        Method::PATCH,
        &format!("/jobs/{id}"),
        Some(json!({
            "trigger_type": "cron",
            "trigger_config": {"expression": "*/5 * * * *", "timezone": "UTC"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(patched["trigger_type"], "cron");
    assert!(patched["next_run_at"].is_string());

    let (status, paused) = send(&app, Method::POST, &format!("/jobs/{id}/pause"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paused["enabled"], false);

    let (status, resumed) = send(&app, Method::POST, &format!("/jobs/{id}/resume"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resumed["enabled"], true);

    let (status, run) = send(&app, Method::POST, &format!("/jobs/{id}/trigger"), None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(run["status"], "queued");
    assert_eq!(run["trigger"], "manual");
    let run_id = run["id"].as_str().unwrap().to_string();

    // forbid: a second manual run is refused while the first is queued
    let (status, err) = send(&app, Method::POST, &format!("/jobs/{id}/trigger"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(err["error"].as_str().unwrap().contains("active run"));

    assert!(manager.worker(1).run_one().await.unwrap());

    let (status, run) = send(&app, Method::GET, &format!("/runs/{run_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(run["status"], "succeeded");
    assert_eq!(run["stdout"], "hi\n");

    let (status, runs) = send(&app, Method::GET, &format!("/runs?job_id={id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(runs["total"], 1);

    let (status, events) = send(&app, Method::GET, &format!("/runs/{run_id}/events"), None).await;
    assert_eq!(status, StatusCode::OK);
    let types: Vec<&str> = events["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(types, vec!["queued", "claimed", "started", "succeeded"]);

    let (status, _) = send(&app, Method::POST, &format!("/runs/{run_id}/cancel"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&app, Method::DELETE, &format!("/jobs/{id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);

    let (status, err) = send(&app, Method::GET, &format!("/jobs/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(err["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn bad_requests_are_400() {
    let (app, _) = app().await;

    let mut unknown = echo_job("extra");
    unknown["priority"] = json!(5);
    let (status, err) = send(&app, Method::POST, "/jobs", Some(unknown)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(err["error"].is_string());

    let mut bad_cron = echo_job("bad");
    bad_cron["trigger_type"] = json!("cron");
    bad_cron["trigger_config"] = json!({"expression": "* * *", "timezone": "UTC"});
    let (status, _) = send(&app, Method::POST, "/jobs", Some(bad_cron)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut bad_runner = echo_job("bad-runner");
    bad_runner["runner_type"] = json!("docker");
    let (status, _) = send(&app, Method::POST, "/jobs", Some(bad_runner)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_name_is_409() {
    let (app, _) = app().await;
    let (status, _) = send(&app, Method::POST, "/jobs", Some(echo_job("twin"))).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = send(&app, Method::POST, "/jobs", Some(echo_job("twin"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn unknown_ids_are_404() {
    let (app, _) = app().await;
    let id = uuid::Uuid::new_v4();

    for (method, uri) in [
        (Method::GET, format!("/jobs/{id}")),
        (Method::DELETE, format!("/jobs/{id}")),
        (Method::POST, format!("/jobs/{id}/trigger")),
        (Method::GET, format!("/runs/{id}")),
        (Method::GET, format!("/runs/{id}/events")),
        (Method::POST, format!("/runs/{id}/cancel")),
    ] {
        let (status, _) = send(&app, method.clone(), &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri}");
    }
}

#[tokio::test]
async fn closed_manager_is_503() {
    let (app, manager) = app().await;
    manager.close().await;
    let (status, _) = send(&app, Method::GET, "/jobs", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
