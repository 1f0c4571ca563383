//! The per-task consumer fibers (§4.3): a live-rate fiber that evicts
//! windowed buckets into the analytics store, and an aggregation fiber
//! that merges per-interval buckets into the final summary.
//!
//! Grounded on `integrate.go`'s two-goroutine-per-task consumer shape; the
//! `KST` window here mirrors `worker::stat`'s so both sides agree on how
//! many open timestamp buckets are tolerated before a forced eviction.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::analytics::AnalyticsStore;
use crate::model::{Aggregate, StressMode};
use crate::queue::Queue;
use crate::worker::stat::KST;

use super::percentile::{histogram, latency_distribution, HistogramBucket};

const LIVE_RATE_POLL_EMPTY_SLEEP: Duration = Duration::from_millis(50);
const AGGREGATION_POLL_EMPTY_SLEEP: Duration = Duration::from_millis(500);
const POLL_BATCH: usize = 64;

/// Drains the rate queue for `task_id`, merging received buckets by
/// timestamp into a `KST`-sized window; each eviction is percentile-summarized
/// and written to the analytics store. Runs for at most `deadline`.
pub async fn run_live_rate_fiber(
    task_id: i64,
    url: String,
    queue: Queue,
    analytics: &AnalyticsStore,
    deadline: Duration,
) {
    let start = Instant::now();
    let mut window: VecDeque<Aggregate> = VecDeque::new();

    loop {
        if start.elapsed() >= deadline {
            break;
        }
        let batch = match queue.drain_rate_aggregates(task_id, POLL_BATCH).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(task_id, error = %e, "rate queue pop failed, continuing");
                Vec::new()
            }
        };

        if batch.is_empty() {
            tokio::time::sleep(LIVE_RATE_POLL_EMPTY_SLEEP).await;
            continue;
        }

        let mut stop_seen = false;
        for bucket in batch {
            stop_seen |= bucket.stop;
            window.push_back(bucket);
            while window.len() > KST {
                if let Some(evicted) = window.pop_front() {
                    write_analytics_row(&evicted, &url, analytics).await;
                }
            }
        }
        if stop_seen {
            break;
        }
    }

    while let Some(evicted) = window.pop_front() {
        write_analytics_row(&evicted, &url, analytics).await;
    }

    if let Err(e) = queue.clear_task_queues(task_id).await {
        warn!(task_id, error = %e, "failed to clear rate/aggregate queues");
    }
}

async fn write_analytics_row(bucket: &Aggregate, url: &str, analytics: &AnalyticsStore) {
    let latency_map: HashMap<String, f64> = latency_distribution(&bucket.duration_map, bucket.total_num)
        .into_iter()
        .filter_map(|(k, v)| v.map(|ms| (k, ms as f64)))
        .collect();

    if let Err(e) = analytics.write_row(bucket, url, latency_map).await {
        warn!(task_id = bucket.task_id, error = %e, "analytics row write failed");
    }
}

/// The final computed per-interval statistics (§4.3 Summary computation).
#[derive(Debug, Clone)]
pub struct IntervalSummary {
    pub interval: u32,
    pub num_res: u64,
    pub fastest_ms: u64,
    pub slowest_ms: u64,
    pub size_total: u64,
    pub average_ms: f64,
    pub rps: f64,
    pub error_dist: HashMap<String, u64>,
    pub status_code_dist: HashMap<u16, u64>,
    pub body_check_result_map: HashMap<String, u64>,
    pub latency_distribution: HashMap<String, Option<u64>>,
    pub histogram: Vec<HistogramBucket>,
}

/// Drains the aggregate queue for `task_id`, merging by interval index into
/// `rs[interval_len]`, until the stop-marked final aggregate is seen or
/// `deadline` elapses. Returns the computed per-interval summaries.
pub async fn run_aggregation_fiber(
    task_id: i64,
    interval_len: usize,
    stress_mode: StressMode,
    stress_time_secs: u64,
    step_interval_secs: u64,
    queue: Queue,
    deadline: Duration,
) -> Vec<IntervalSummary> {
    let interval_len = interval_len.max(1);
    let mut rs: Vec<Aggregate> = (0..interval_len)
        .map(|i| Aggregate::new(0, task_id, i as u32, 0))
        .collect();

    let start = Instant::now();
    loop {
        if start.elapsed() >= deadline {
            break;
        }
        let batch = match queue.drain_interval_aggregates(task_id, POLL_BATCH).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(task_id, error = %e, "aggregate queue pop failed, continuing");
                Vec::new()
            }
        };

        if batch.is_empty() {
            tokio::time::sleep(AGGREGATION_POLL_EMPTY_SLEEP).await;
            continue;
        }

        let mut stop_seen = false;
        for piece in &batch {
            stop_seen |= piece.stop;
            let idx = (piece.interval as usize).min(interval_len - 1);
            rs[idx].merge(piece);
        }
        if stop_seen {
            break;
        }
    }

    let window_secs = match stress_mode {
        StressMode::Step => step_interval_secs.max(1),
        StressMode::Constant => stress_time_secs.max(1),
    };

    rs.into_iter().map(|r| summarize(r, window_secs)).collect()
}

fn summarize(aggregate: Aggregate, window_secs: u64) -> IntervalSummary {
    let num_res = aggregate.total_num;
    let (fastest, slowest, weighted_sum) = aggregate.duration_map.iter().fold(
        (u64::MAX, 0u64, 0u128),
        |(fastest, slowest, sum), (&ms, &count)| {
            (fastest.min(ms), slowest.max(ms), sum + (ms as u128 * count as u128))
        },
    );
    let (fastest, slowest) = if num_res == 0 { (0, 0) } else { (fastest, slowest) };
    let average_ms = if num_res == 0 {
        0.0
    } else {
        weighted_sum as f64 / num_res as f64
    };
    let rps = num_res as f64 / window_secs as f64;

    IntervalSummary {
        interval: aggregate.interval,
        num_res,
        fastest_ms: fastest,
        slowest_ms: slowest,
        size_total: aggregate.total_response_content_length,
        average_ms,
        rps,
        error_dist: aggregate.error_map.clone(),
        status_code_dist: aggregate.status_map.clone(),
        body_check_result_map: aggregate.body_check_result_map.clone(),
        latency_distribution: latency_distribution(&aggregate.duration_map, num_res),
        histogram: histogram(&aggregate.duration_map, fastest, slowest, num_res),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LiveResult;

    fn result(ms: u64) -> LiveResult {
        LiveResult {
            timestamp: 0,
            duration_ms: ms,
            status_code: Some(200),
            response_length: 10,
            err_string: None,
            body_check_result: None,
            stop: false,
        }
    }

    #[test]
    fn summarize_computes_rps_from_window_and_num_res() {
        let mut aggregate = Aggregate::new(1, 2, 0, 0);
        for ms in [10, 20, 30] {
            aggregate.record(&result(ms));
        }
        let summary = summarize(aggregate, 10);
        assert_eq!(summary.num_res, 3);
        assert_eq!(summary.rps, 0.3);
        assert_eq!(summary.fastest_ms, 10);
        assert_eq!(summary.slowest_ms, 30);
    }

    #[test]
    fn summarize_handles_empty_aggregate_without_panicking() {
        let aggregate = Aggregate::new(1, 2, 0, 0);
        let summary = summarize(aggregate, 10);
        assert_eq!(summary.num_res, 0);
        assert_eq!(summary.average_ms, 0.0);
    }

    #[test]
    fn summarize_p7_total_num_matches_fed_observations() {
        let mut aggregate = Aggregate::new(1, 2, 0, 0);
        for ms in [5, 5, 5] {
            aggregate.record(&result(ms));
        }
        let summary = summarize(aggregate, 1);
        assert_eq!(summary.num_res, 3);
    }
}
