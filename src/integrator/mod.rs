//! Aggregation subsystem: per-task consumer fibers and percentile/histogram
//! computation (§4.3).

pub mod fibers;
pub mod percentile;

use std::time::Duration;

use tracing::info;

use crate::analytics::AnalyticsStore;
use crate::model::StressMode;
use crate::queue::Queue;
use crate::record_store::RecordStore;

use fibers::{run_aggregation_fiber, run_live_rate_fiber, IntervalSummary};

/// One task's worth of context the integrator needs to run its fiber pair,
/// mirroring the `IntegrateTask` proto message (§6).
pub struct IntegrateTaskContext {
    pub task_id: i64,
    pub plan_id: i64,
    pub url: String,
}

/// Drives both fibers for one task to completion and persists the result.
/// Grounded on `integrate.go`'s per-task orchestration: "Write the per-task
/// summaries array, serialized, into the task record and mark task_status
/// DONE" — applied per task id, not once per plan (§4.3 Persistence, §9
/// Open Question resolved: this is NOT batched across the whole plan).
pub async fn run_task_integration(
    ctx: IntegrateTaskContext,
    stress_mode: StressMode,
    stress_time_secs: u64,
    step_interval_secs: u64,
    interval_len: usize,
    queue: Queue,
    analytics: &AnalyticsStore,
    record_store: &RecordStore,
) {
    let deadline = Duration::from_secs(stress_time_secs + 10);

    let live_rate = run_live_rate_fiber(ctx.task_id, ctx.url.clone(), queue.clone(), analytics, deadline);
    let aggregation = run_aggregation_fiber(
        ctx.task_id,
        interval_len,
        stress_mode,
        stress_time_secs,
        step_interval_secs,
        queue,
        deadline,
    );

    let (_, summaries) = tokio::join!(live_rate, aggregation);

    persist_summaries(ctx.task_id, ctx.plan_id, summaries, record_store).await;
}

async fn persist_summaries(
    task_id: i64,
    plan_id: i64,
    summaries: Vec<IntervalSummary>,
    record_store: &RecordStore,
) {
    let stat_ext = match serde_json::to_value(
        summaries
            .iter()
            .map(|s| {
                serde_json::json!({
                    "interval": s.interval,
                    "num_res": s.num_res,
                    "fastest_ms": s.fastest_ms,
                    "slowest_ms": s.slowest_ms,
                    "size_total": s.size_total,
                    "average_ms": s.average_ms,
                    "rps": s.rps,
                    "error_dist": s.error_dist,
                    "status_code_dist": s.status_code_dist,
                    "body_check_result_map": s.body_check_result_map,
                    "latency_distribution": s.latency_distribution,
                    "histogram": s.histogram.iter().map(|h| serde_json::json!({
                        "mark": h.mark,
                        "count": h.count,
                        "frequency": h.frequency,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect::<Vec<_>>(),
    ) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(task_id, error = %e, "failed to serialize interval summaries");
            return;
        }
    };

    if let Err(e) = record_store.finalize_task(task_id, stat_ext).await {
        tracing::error!(task_id, error = %e, "failed to persist task summary");
    } else {
        crate::metrics::TASKS_INTEGRATED_TOTAL.inc();
        info!(task_id, plan_id, "task integration complete");
    }
}

