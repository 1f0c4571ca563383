//! Operational metrics, separate from the analytics pipeline (§10): a
//! small set of process-level Prometheus series plus the `/metrics` scrape
//! endpoint, shared by all three binaries.
//!
//! Grounded on the teacher's `main.rs` metrics bootstrap (`lazy_static`
//! counters registered against the default registry, served by a bare
//! `hyper` service) — only the metric names and labels change, the
//! collection/serving shape is unchanged.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, TextEncoder};
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("peckmesh_requests_total", "HTTP requests issued by this worker, by outcome"),
        &["outcome"],
    )
    .unwrap();

    pub static ref REQUEST_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "peckmesh_request_duration_seconds",
            "Latency of HTTP requests issued by this worker",
        ),
    )
    .unwrap();

    pub static ref PLANS_ADMITTED_TOTAL: IntCounter = IntCounter::new(
        "peckmesh_plans_admitted_total",
        "Plans accepted by the controller's admission pipeline",
    )
    .unwrap();

    pub static ref ADMISSION_REJECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("peckmesh_admission_rejections_total", "Plans rejected at admission, by reason"),
        &["reason"],
    )
    .unwrap();

    pub static ref TASKS_INTEGRATED_TOTAL: IntCounter = IntCounter::new(
        "peckmesh_tasks_integrated_total",
        "Tasks the integrator has finished aggregating",
    )
    .unwrap();
}

/// Registers every series above with the default registry. A binary should
/// call this exactly once at startup; `prometheus::default_registry()`
/// rejects a duplicate registration.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    prometheus::default_registry().register(Box::new(REQUESTS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    prometheus::default_registry().register(Box::new(PLANS_ADMITTED_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(ADMISSION_REJECTIONS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(TASKS_INTEGRATED_TOTAL.clone()))?;
    Ok(())
}

async fn metrics_handler(_req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    Ok(Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap())
}

/// Serves `/metrics` on `addr` until the process exits, spawned as a
/// background task by every binary's `main` — a scrape failure here should
/// never take the worker/controller/integrator down with it.
pub async fn serve(addr: std::net::SocketAddr) {
    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, hyper::Error>(service_fn(metrics_handler)) });

    info!(%addr, "metrics server listening");
    if let Err(e) = Server::bind(&addr).serve(make_svc).await {
        error!(error = %e, "metrics server error");
    }
}

/// Spawns [`serve`] on the current Tokio runtime.
pub fn spawn(addr: std::net::SocketAddr) -> tokio::task::JoinHandle<()> {
    tokio::spawn(serve(addr))
}
