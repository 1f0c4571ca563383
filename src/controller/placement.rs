//! The placement algorithm (§4.1 steps 1-7): walk the live worker set in
//! registry order, greedily assign each task's load against remaining
//! per-worker capacity, and fail the whole task atomically if the pool
//! can't absorb it.
//!
//! Grounded on the reference implementation's `assignAndCalculateTask` in
//! `biz_stress_start.go`, kept pure (no I/O) so every invariant in §8
//! (P1-P3) is a plain unit test against in-memory `ServiceInstance`/
//! `NodeCost` fixtures; `controller::admission` is the only caller that
//! touches the registry/ledger over the network.

use std::collections::HashMap;

use crate::errors::PlacementError;
use crate::model::{Assignment, BindNode, NodeCost, ServiceInstance, StressMode, StressType, Task};

/// The outcome of placing one task: the assignment to record, and each
/// touched worker's post-placement `NodeCost` to CAS into the ledger.
pub struct PlacedTask {
    pub assignment: Assignment,
    pub updated_costs: Vec<NodeCost>,
}

/// Places `task` across `workers`, given the ledger's current view of their
/// cost (`ledger`, keyed by worker address; an absent entry is treated as
/// an empty `NodeCost` per §4.1 step 1).
pub fn place_task(
    task: &Task,
    stress_type: StressType,
    stress_mode: StressMode,
    interval_len: usize,
    workers: &[ServiceInstance],
    ledger: &HashMap<String, NodeCost>,
) -> Result<PlacedTask, PlacementError> {
    let total_num = match stress_mode {
        StressMode::Constant => task.num,
        StressMode::Step => task.num.max(task.max_num.unwrap_or(task.num)),
    };
    let schedule = task.step_schedule(interval_len);

    let mut remaining = total_num;
    // (worker_addr, add_cost, new_cost)
    let mut binds: Vec<(String, u64, NodeCost)> = Vec::new();

    for worker in workers {
        if remaining == 0 {
            break;
        }
        let cost = ledger.get(&worker.address).cloned().unwrap_or_else(|| {
            NodeCost::new_empty(
                worker.address.clone(),
                worker.max_rps_num(),
                worker.max_concurrency_num(),
            )
        });

        let left_num = match stress_type {
            StressType::Rps => {
                if cost.is_goroutine_pinned() {
                    0
                } else {
                    cost.rps_quota.saturating_sub(cost.rps_cost)
                }
            }
            StressType::Concurrency => {
                if cost.is_rps_pinned() {
                    0
                } else {
                    cost.goroutine_quota.saturating_sub(cost.goroutine_cost)
                }
            }
        };
        if left_num == 0 {
            continue;
        }

        let add_cost = remaining.min(left_num);
        remaining -= add_cost;

        let mut new_cost = cost;
        match stress_type {
            StressType::Rps => new_cost.rps_cost += add_cost,
            StressType::Concurrency => new_cost.goroutine_cost += add_cost,
        }
        new_cost.running_task_count += 1;

        binds.push((worker.address.clone(), add_cost, new_cost));
    }

    if remaining > 0 {
        return Err(PlacementError::NodesBusy {
            task_id: task.task_id,
            requested: total_num,
            remaining,
        });
    }

    let per_interval = split_step_schedule(&schedule, &binds, total_num);

    let updated_costs: Vec<NodeCost> = binds.iter().map(|(_, _, c)| c.clone()).collect();
    let bind_nodes: Vec<BindNode> = binds
        .into_iter()
        .zip(per_interval)
        .map(|((addr, add_cost, _), nums)| BindNode {
            worker_addr: addr,
            base_num: add_cost,
            per_interval_nums: nums,
        })
        .collect();

    Ok(PlacedTask {
        assignment: Assignment {
            task_id: task.task_id,
            binds: bind_nodes,
        },
        updated_costs,
    })
}

/// §4.1 step 5: proportionally splits each interval's target (`schedule[j]`)
/// across assigned workers by their share of `total_num`, with the last
/// assigned worker absorbing rounding so each interval's column sums
/// exactly to `schedule[j]`.
fn split_step_schedule(
    schedule: &[u64],
    binds: &[(String, u64, NodeCost)],
    total_num: u64,
) -> Vec<Vec<u64>> {
    let mut per_worker = vec![vec![0u64; schedule.len()]; binds.len()];
    if binds.is_empty() || total_num == 0 {
        return per_worker;
    }

    for (j, &target) in schedule.iter().enumerate() {
        let mut assigned_sum = 0u64;
        for (i, (_, add_cost, _)) in binds.iter().enumerate() {
            if i == binds.len() - 1 {
                break;
            }
            let share = ((target as f64) * (*add_cost as f64) / (total_num as f64)).round() as u64;
            per_worker[i][j] = share;
            assigned_sum += share;
        }
        let last = binds.len() - 1;
        per_worker[last][j] = target.saturating_sub(assigned_sum);
    }
    per_worker
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn worker(addr: &str, max_rps: u64, max_conc: u64) -> ServiceInstance {
        let mut metadata = Map::new();
        metadata.insert("max_rps_num".to_string(), max_rps.to_string());
        metadata.insert("max_concurrency_num".to_string(), max_conc.to_string());
        ServiceInstance {
            name: "pecker".into(),
            address: addr.into(),
            metadata,
        }
    }

    fn task(task_id: i64, num: u64, max_num: Option<u64>, step_num: Option<u64>) -> Task {
        Task {
            task_id,
            plan_id: 1,
            name: "t".into(),
            url: "http://example.com".into(),
            method: crate::model::HttpMethod::Get,
            headers: Map::new(),
            query: Vec::new(),
            body: None,
            timeout_secs: 5,
            max_connections: 100,
            flags: Default::default(),
            proxy: None,
            max_body_size: None,
            num,
            max_num,
            step_num,
            dynamic_param_script: None,
            response_check_script: None,
        }
    }

    #[test]
    fn constant_mode_splits_num_exactly_across_workers_p1() {
        let workers = vec![worker("w1", 30, 0), worker("w2", 100, 0)];
        let t = task(1, 50, None, None);
        let placed = place_task(
            &t,
            StressType::Rps,
            StressMode::Constant,
            1,
            &workers,
            &Map::new(),
        )
        .unwrap();

        let total: u64 = placed.assignment.binds.iter().map(|b| b.base_num).sum();
        assert_eq!(total, 50);
    }

    #[test]
    fn insufficient_capacity_fails_whole_task_not_partial_p7() {
        let workers = vec![worker("w1", 10, 0)];
        let t = task(1, 50, None, None);
        let err = place_task(
            &t,
            StressType::Rps,
            StressMode::Constant,
            1,
            &workers,
            &Map::new(),
        )
        .unwrap_err();
        assert!(matches!(err, PlacementError::NodesBusy { .. }));
    }

    #[test]
    fn rps_pinned_worker_is_unusable_for_concurrency_task_p3() {
        let workers = vec![worker("w1", 100, 100)];
        let mut ledger = Map::new();
        let mut cost = NodeCost::new_empty("w1", 100, 100);
        cost.rps_cost = 10;
        ledger.insert("w1".to_string(), cost);

        let t = task(1, 20, None, None);
        let err = place_task(
            &t,
            StressType::Concurrency,
            StressMode::Constant,
            1,
            &workers,
            &ledger,
        )
        .unwrap_err();
        assert!(matches!(err, PlacementError::NodesBusy { .. }));
    }

    #[test]
    fn placement_never_exceeds_quota_p2() {
        let workers = vec![worker("w1", 40, 0)];
        let t = task(1, 40, None, None);
        let placed = place_task(
            &t,
            StressType::Rps,
            StressMode::Constant,
            1,
            &workers,
            &Map::new(),
        )
        .unwrap();
        for cost in &placed.updated_costs {
            assert!(cost.rps_cost <= cost.rps_quota);
        }
    }

    #[test]
    fn step_mode_interval_columns_sum_to_schedule_target() {
        let workers = vec![worker("w1", 30, 0), worker("w2", 100, 0)];
        let t = task(1, 10, Some(50), Some(10));
        let interval_len = 4; // matches step_schedule's own ramp length
        let placed = place_task(
            &t,
            StressType::Rps,
            StressMode::Step,
            interval_len,
            &workers,
            &Map::new(),
        )
        .unwrap();

        let schedule = t.step_schedule(interval_len);
        for (j, &target) in schedule.iter().enumerate() {
            let column: u64 = placed
                .assignment
                .binds
                .iter()
                .map(|b| b.per_interval_nums[j])
                .sum();
            assert_eq!(column, target, "interval {j} column mismatch");
        }
    }
}
