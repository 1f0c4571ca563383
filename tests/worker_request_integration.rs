//! End-to-end check of the worker's per-request path against a real HTTP
//! server (wiremock), covering the success, non-2xx, and response-check
//! cases a unit test against a fake client wouldn't exercise.

use std::collections::HashMap;
use std::time::Duration;

use peckmesh::model::{HttpMethod, Task, TransportFlags};
use peckmesh::scripting::{LiteralEqualityChecker, ResponseChecker};
use peckmesh::worker::request::execute_request;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn base_task(url: String) -> Task {
    Task {
        task_id: 1,
        plan_id: 1,
        name: "probe".into(),
        url,
        method: HttpMethod::Get,
        headers: HashMap::new(),
        query: vec![],
        body: None,
        timeout_secs: 5,
        max_connections: 10,
        flags: TransportFlags::default(),
        proxy: None,
        max_body_size: None,
        num: 1,
        max_num: None,
        step_num: None,
        dynamic_param_script: None,
        response_check_script: None,
    }
}

#[tokio::test]
async fn successful_request_reports_status_and_body_length() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let task = base_task(format!("{}/ok", server.uri()));

    let result = execute_request(
        &client,
        &task,
        None,
        None,
        Duration::from_secs(2),
        Duration::from_secs(2),
        None,
        256,
        false,
    )
    .await;

    assert_eq!(result.status_code, Some(200));
    assert_eq!(result.response_length, 5);
    assert!(result.err_string.is_none());
}

#[tokio::test]
async fn server_error_is_reported_without_an_err_string() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/boom"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let task = base_task(format!("{}/boom", server.uri()));

    let result = execute_request(
        &client, &task, None, None, Duration::from_secs(2), Duration::from_secs(2), None, 256, false,
    )
    .await;

    assert_eq!(result.status_code, Some(500));
    assert!(result.err_string.is_none());
}

#[tokio::test]
async fn response_checker_result_is_attached_on_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/check"))
        .respond_with(ResponseTemplate::new(200).set_body_string("expected"))
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let task = base_task(format!("{}/check", server.uri()));
    let checker = LiteralEqualityChecker::new("expected");

    let result = execute_request(
        &client,
        &task,
        None,
        Some(&checker as &dyn ResponseChecker),
        Duration::from_secs(2),
        Duration::from_secs(2),
        None,
        256,
        false,
    )
    .await;

    assert_eq!(result.body_check_result.as_deref(), Some("ok"));
}

#[tokio::test]
async fn connection_failure_is_reported_as_an_error() {
    let client = reqwest::Client::new();
    let task = base_task("http://127.0.0.1:1".into());

    let result = execute_request(
        &client, &task, None, None, Duration::from_secs(1), Duration::from_secs(1), None, 256, false,
    )
    .await;

    assert!(result.status_code.is_none());
    assert!(result.err_string.is_some());
}
