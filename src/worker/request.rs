//! Per-request execution (§4.2): build one HTTP request from a `Task` plus
//! an optional dynamic-param variant, run it under a timeout, and fold the
//! outcome into a `LiveResult`.
//!
//! Grounded on the teacher's `worker.rs` request-issuing loop for the
//! client-reuse and duration-measurement shape, with the error
//! categorization lifted from `errors.rs`'s `ErrorCategory`. The
//! variant-vs-base-task selection (a variant replaces headers/query/body
//! outright, it never merges with the task's own) follows
//! `request.go`'s `goRequest`/`constructRequest`.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::{Client, Method};
use tracing::debug;

use crate::errors::ErrorCategory;
use crate::metrics::{REQUESTS_TOTAL, REQUEST_DURATION_SECONDS};
use crate::model::{HttpMethod, LiveResult, Task};
use crate::scripting::{ParamVariant, ResponseChecker};

fn reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Truncates `message` to its last `max_len` bytes, at a char boundary, per
/// `ErrorCutLength` (§4.2): long reqwest error chains are otherwise mostly
/// noise from the connector's own retry bookkeeping.
fn cut_error(message: &str, max_len: usize) -> String {
    if message.len() <= max_len {
        return message.to_string();
    }
    let start = message.len() - max_len;
    let mut boundary = start;
    while boundary < message.len() && !message.is_char_boundary(boundary) {
        boundary += 1;
    }
    message[boundary..].to_string()
}

/// Executes one HTTP request built from `task`, optionally overridden by a
/// dynamic-param `variant`, with a response-check callable invoked on
/// success. `stop` is folded into the result so a worker cancelled
/// mid-flight is visible to the integrator (§4.2 Stop semantics).
pub async fn execute_request(
    client: &Client,
    task: &Task,
    variant: Option<&ParamVariant>,
    checker: Option<&dyn ResponseChecker>,
    timeout: Duration,
    max_timeout: Duration,
    max_body_size: Option<u64>,
    error_cut_length: usize,
    stop: bool,
) -> LiveResult {
    let mut builder = client.request(reqwest_method(task.method), &task.url);

    // A variant replaces the task's own headers/query/body wholesale rather
    // than merging with them — the request picks one or the other, never
    // both (§4.2).
    let (headers, query, body): (_, Vec<(String, String)>, _) = match variant {
        Some(variant) => (
            &variant.headers,
            variant.query.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            variant.body.clone(),
        ),
        None => (&task.headers, task.query.clone(), task.body.clone()),
    };

    for (k, v) in headers {
        builder = builder.header(k, v);
    }
    if !query.is_empty() {
        builder = builder.query(&query);
    }
    if let Some(body) = &body {
        builder = builder.json(body);
    }

    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, builder.send()).await;
    let mut duration = started.elapsed();
    if duration > max_timeout {
        duration = max_timeout;
    }

    let timestamp = now_secs();

    let response = match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            let category = ErrorCategory::from_reqwest_error(&e);
            debug!(task_id = task.task_id, ?category, "request failed");
            REQUESTS_TOTAL.with_label_values(&["error"]).inc();
            REQUEST_DURATION_SECONDS.observe(duration.as_secs_f64());
            return LiveResult {
                timestamp,
                duration_ms: duration.as_millis() as u64,
                status_code: None,
                response_length: 0,
                err_string: Some(cut_error(&e.to_string(), error_cut_length)),
                body_check_result: None,
                stop,
            };
        }
        Err(_) => {
            REQUESTS_TOTAL.with_label_values(&["timeout"]).inc();
            REQUEST_DURATION_SECONDS.observe(max_timeout.as_secs_f64());
            return LiveResult {
                timestamp,
                duration_ms: max_timeout.as_millis() as u64,
                status_code: None,
                response_length: 0,
                err_string: Some(cut_error("request timed out", error_cut_length)),
                body_check_result: None,
                stop,
            };
        }
    };

    let status_code = response.status().as_u16();
    let body_bytes = match read_capped_body(response, max_body_size).await {
        Ok(bytes) => bytes,
        Err(e) => {
            REQUESTS_TOTAL.with_label_values(&["error"]).inc();
            REQUEST_DURATION_SECONDS.observe(duration.as_secs_f64());
            return LiveResult {
                timestamp,
                duration_ms: duration.as_millis() as u64,
                status_code: Some(status_code),
                response_length: 0,
                err_string: Some(cut_error(&e.to_string(), error_cut_length)),
                body_check_result: None,
                stop,
            };
        }
    };

    let body_check_result = checker.map(|c| c.check(&String::from_utf8_lossy(&body_bytes)));

    REQUESTS_TOTAL.with_label_values(&["ok"]).inc();
    REQUEST_DURATION_SECONDS.observe(duration.as_secs_f64());
    LiveResult {
        timestamp,
        duration_ms: duration.as_millis() as u64,
        status_code: Some(status_code),
        response_length: body_bytes.len() as u64,
        err_string: None,
        body_check_result,
        stop,
    }
}

/// Reads the response body, stopping early once `max_body_size` bytes have
/// been read (§4.2: "read body up to `max_body_size` if set").
async fn read_capped_body(
    mut response: reqwest::Response,
    max_body_size: Option<u64>,
) -> Result<Vec<u8>, reqwest::Error> {
    let Some(limit) = max_body_size else {
        return Ok(response.bytes().await?.to_vec());
    };

    let mut buf = Vec::with_capacity(limit.min(64 * 1024) as usize);
    while let Some(chunk) = response.chunk().await? {
        buf.extend_from_slice(&chunk);
        if buf.len() as u64 >= limit {
            buf.truncate(limit as usize);
            break;
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cut_error_keeps_only_the_tail() {
        let message = "a".repeat(300) + "TAIL";
        let cut = cut_error(&message, 10);
        assert_eq!(cut.len(), 10);
        assert!(cut.ends_with("TAIL"));
    }

    #[test]
    fn cut_error_is_noop_for_short_messages() {
        assert_eq!(cut_error("boom", 256), "boom");
    }

    #[test]
    fn reqwest_method_maps_every_variant() {
        assert_eq!(reqwest_method(HttpMethod::Get), Method::GET);
        assert_eq!(reqwest_method(HttpMethod::Post), Method::POST);
        assert_eq!(reqwest_method(HttpMethod::Put), Method::PUT);
        assert_eq!(reqwest_method(HttpMethod::Delete), Method::DELETE);
    }
}
