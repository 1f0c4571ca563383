//! The stat pipeline (§4.2): a single consumer that folds the result
//! channel into a `KST`-sized sliding window of per-timestamp buckets (for
//! the rate queue) and a fixed `ags[intervalLen]` array (for the aggregate
//! queue), then finalizes the worker's share of the cost ledger.
//!
//! Grounded on the reference implementation's `stat.go`; `KST = 3` and the
//! pool-backed eviction push are carried over verbatim since they're the
//! mechanism that keeps queue pushes from serializing behind each other.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::warn;

use crate::ledger::{Ledger, LedgerEntry};
use crate::model::{Aggregate, LiveResult, NodeCost};
use crate::queue::Queue;

/// Size of the live-rate sliding window, shared with the integrator's own
/// windowing (§4.3) — both sides agree on how many open timestamp buckets
/// to tolerate before forcing an eviction.
pub const KST: usize = 3;

pub struct StatConfig {
    pub plan_id: i64,
    pub task_id: i64,
    pub run_start_secs: u64,
    pub interval_len: usize,
    pub step_interval_secs: u64,
    pub report_goroutine_num: usize,
}

/// Drains `result_rx` until the channel closes, pushing windowed rate
/// buckets and per-interval aggregates to `queue`, then releases this
/// task's share of `node_cost` back to the ledger.
pub async fn run_stat_pipeline(
    config: StatConfig,
    mut result_rx: mpsc::Receiver<LiveResult>,
    queue: Queue,
    ledger: &mut Ledger,
    mut node_cost_entry: LedgerEntry,
    task_cost: u64,
    is_rps: bool,
) {
    let interval_len = config.interval_len.max(1);
    let mut ags: Vec<Aggregate> = (0..interval_len)
        .map(|i| Aggregate::new(config.plan_id, config.task_id, i as u32, config.run_start_secs))
        .collect();
    let mut window: VecDeque<(u64, Aggregate)> = VecDeque::new();
    let mut any_stop = false;

    let sem = Arc::new(Semaphore::new(config.report_goroutine_num.max(1)));
    let mut evictions = Vec::new();

    while let Some(result) = result_rx.recv().await {
        if result.stop {
            any_stop = true;
        }
        let step = config.step_interval_secs.max(1);
        let interval = (((result.timestamp.saturating_sub(config.run_start_secs)) / step) as usize)
            .min(interval_len - 1);
        ags[interval].record(&result);
        fold_into_window(&mut window, &result, config.plan_id, config.task_id, interval as u32);

        while window.len() > KST {
            let (_, bucket) = window.pop_front().unwrap();
            evictions.push(spawn_eviction_push(sem.clone(), queue.clone(), config.task_id, bucket));
        }
    }

    while let Some((_, bucket)) = window.pop_front() {
        evictions.push(spawn_eviction_push(sem.clone(), queue.clone(), config.task_id, bucket));
    }
    for handle in evictions {
        let _ = handle.await;
    }

    let last = ags.len() - 1;
    for (i, mut aggregate) in ags.into_iter().enumerate() {
        if i == last && any_stop {
            aggregate.stop = true;
        }
        if let Err(e) = queue.push_interval_aggregate(config.task_id, &aggregate).await {
            warn!(task_id = config.task_id, interval = i, error = %e, "aggregate push failed");
        }
    }

    release_cost(&mut node_cost_entry.cost, task_cost, is_rps);
    if let Err(e) = ledger.finalize_node(&node_cost_entry).await {
        warn!(addr = %node_cost_entry.cost.addr, error = %e, "failed to release ledger cost on finalize");
    }
}

fn fold_into_window(
    window: &mut VecDeque<(u64, Aggregate)>,
    result: &LiveResult,
    plan_id: i64,
    task_id: i64,
    interval: u32,
) {
    if let Some((_, bucket)) = window.iter_mut().find(|(ts, _)| *ts == result.timestamp) {
        bucket.record(result);
    } else {
        let mut bucket = Aggregate::new(plan_id, task_id, interval, result.timestamp);
        bucket.record(result);
        window.push_back((result.timestamp, bucket));
    }
}

fn spawn_eviction_push(
    sem: Arc<Semaphore>,
    queue: Queue,
    task_id: i64,
    bucket: Aggregate,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let _permit = sem.acquire().await;
        if let Err(e) = queue.push_rate_aggregate(task_id, &bucket).await {
            warn!(task_id, error = %e, "rate bucket eviction push failed");
        }
    })
}

/// §4.2 finalize: "subtract this task's share, decrement
/// `running_task_count`" — the counterpart to placement's cost addition.
fn release_cost(cost: &mut NodeCost, task_cost: u64, is_rps: bool) {
    if is_rps {
        cost.rps_cost = cost.rps_cost.saturating_sub(task_cost);
    } else {
        cost.goroutine_cost = cost.goroutine_cost.saturating_sub(task_cost);
    }
    cost.running_task_count = cost.running_task_count.saturating_sub(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result(timestamp: u64) -> LiveResult {
        LiveResult {
            timestamp,
            duration_ms: 10,
            status_code: Some(200),
            response_length: 64,
            err_string: None,
            body_check_result: None,
            stop: false,
        }
    }

    #[test]
    fn release_cost_subtracts_rps_share_and_decrements_running_count() {
        let mut cost = NodeCost::new_empty("w1", 100, 0);
        cost.rps_cost = 30;
        cost.running_task_count = 2;
        release_cost(&mut cost, 10, true);
        assert_eq!(cost.rps_cost, 20);
        assert_eq!(cost.running_task_count, 1);
    }

    #[test]
    fn release_cost_never_underflows_p5() {
        let mut cost = NodeCost::new_empty("w1", 100, 0);
        release_cost(&mut cost, 10, true);
        assert_eq!(cost.rps_cost, 0);
        assert_eq!(cost.running_task_count, 0);
    }

    #[test]
    fn fold_into_window_merges_same_timestamp_into_one_bucket() {
        let mut window = VecDeque::new();
        fold_into_window(&mut window, &sample_result(100), 1, 1, 0);
        fold_into_window(&mut window, &sample_result(100), 1, 1, 0);
        fold_into_window(&mut window, &sample_result(101), 1, 1, 0);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].1.total_num, 2);
        assert_eq!(window[1].1.total_num, 1);
    }
}
