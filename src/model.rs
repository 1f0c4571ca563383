//! Core data model: Plan, Task, worker ledger records, assignments, and the
//! message types that flow worker -> queue -> integrator -> record store.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// `stress_type` — Rps is rate-driven, Concurrency is fixed-worker-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StressType {
    Rps,
    Concurrency,
}

/// `stress_mode` — Constant is flat, Step is a piecewise-flat ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StressMode {
    Constant,
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Doing,
    Done,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Doing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Transport-level flags carried on a Task, mirroring the admission RPC's
/// `options[]` set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportFlags {
    pub disable_compression: bool,
    pub disable_keep_alive: bool,
    pub disable_redirects: bool,
    pub enable_h2: bool,
}

/// A single HTTP target within a Plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: i64,
    pub plan_id: i64,
    pub name: String,
    pub url: String,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub timeout_secs: u32,
    pub max_connections: u32,
    pub flags: TransportFlags,
    pub proxy: Option<String>,
    pub max_body_size: Option<u64>,
    /// Base load number. Rps: requests/sec. Concurrency: worker count.
    pub num: u64,
    /// Step mode only.
    pub max_num: Option<u64>,
    pub step_num: Option<u64>,
    pub dynamic_param_script: Option<String>,
    pub response_check_script: Option<String>,
}

impl Task {
    /// `Task.Nums[intervalLen]`, the per-interval ramp schedule derived from
    /// `{Num, StepNum, MaxNum}`. Constant mode has a single interval equal to
    /// `Num`.
    pub fn step_schedule(&self, interval_len: usize) -> Vec<u64> {
        let mut nums = Vec::with_capacity(interval_len);
        let mut start = self.num;
        let step = self.step_num.unwrap_or(0);
        let max = self.max_num.unwrap_or(self.num);
        for _ in 0..interval_len {
            nums.push(start);
            start = (start + step).min(max);
        }
        nums
    }
}

/// A user-submitted load test: a duration, a load shape, and its Tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: i64,
    pub user_id: i64,
    pub name: String,
    pub stress_type: StressType,
    pub stress_mode: StressMode,
    /// Seconds. Converted from minutes exactly once, at admission.
    pub stress_time: u64,
    /// Seconds; used only in Step mode.
    pub step_interval_time: u64,
    pub tasks: Vec<Task>,
}

impl Plan {
    /// `intervalLen`. Constant mode is always one interval spanning the
    /// whole run; Step mode is `ceil(D/S)`.
    pub fn interval_len(&self) -> u32 {
        match self.stress_mode {
            StressMode::Constant => 1,
            StressMode::Step => {
                let d = self.stress_time.max(1);
                let s = self.step_interval_time.max(1);
                ((d + s - 1) / s) as u32
            }
        }
    }

    /// The effective step interval: `D` itself in Constant mode (the whole
    /// run is one interval), `S` in Step mode.
    pub fn effective_step_interval(&self) -> u64 {
        match self.stress_mode {
            StressMode::Constant => self.stress_time,
            StressMode::Step => self.step_interval_time,
        }
    }
}

/// A worker's registry entry, joined with its advertised capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    pub address: String,
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    pub fn max_rps_num(&self) -> u64 {
        self.metadata
            .get("max_rps_num")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn max_concurrency_num(&self) -> u64 {
        self.metadata
            .get("max_concurrency_num")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

/// The authoritative per-worker record in the cost ledger, mutated only by
/// compare-and-swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCost {
    pub addr: String,
    pub rps_quota: u64,
    pub goroutine_quota: u64,
    pub rps_cost: u64,
    pub goroutine_cost: u64,
    pub running_task_count: u64,
}

impl NodeCost {
    pub fn new_empty(addr: impl Into<String>, rps_quota: u64, goroutine_quota: u64) -> Self {
        Self {
            addr: addr.into(),
            rps_quota,
            goroutine_quota,
            rps_cost: 0,
            goroutine_cost: 0,
            running_task_count: 0,
        }
    }

    pub fn is_rps_pinned(&self) -> bool {
        self.rps_cost > 0
    }

    pub fn is_goroutine_pinned(&self) -> bool {
        self.goroutine_cost > 0
    }
}

/// Per-task, per-worker binding produced by placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindNode {
    pub worker_addr: String,
    pub base_num: u64,
    pub per_interval_nums: Vec<u64>,
}

/// The full outcome of placing one Task across the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: i64,
    pub binds: Vec<BindNode>,
}

impl Assignment {
    pub fn total_base_num(&self) -> u64 {
        self.binds.iter().map(|b| b.base_num).sum()
    }

    pub fn interval_totals(&self, interval_len: usize) -> Vec<u64> {
        let mut totals = vec![0u64; interval_len];
        for bind in &self.binds {
            for (i, n) in bind.per_interval_nums.iter().enumerate() {
                if i < totals.len() {
                    totals[i] += n;
                }
            }
        }
        totals
    }
}

/// One HTTP response observation on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveResult {
    pub timestamp: u64,
    pub duration_ms: u64,
    pub status_code: Option<u16>,
    pub response_length: u64,
    pub err_string: Option<String>,
    pub body_check_result: Option<String>,
    pub stop: bool,
}

/// Time-bucketed counts produced by workers and drained by the integrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Aggregate {
    pub plan_id: i64,
    pub task_id: i64,
    pub interval: u32,
    pub timestamp: u64,
    pub total_num: u64,
    pub total_response_content_length: u64,
    pub duration_map: HashMap<u64, u64>,
    pub status_map: HashMap<u16, u64>,
    pub error_map: HashMap<String, u64>,
    pub body_check_result_map: HashMap<String, u64>,
    pub stop: bool,
}

impl Aggregate {
    pub fn new(plan_id: i64, task_id: i64, interval: u32, timestamp: u64) -> Self {
        Self {
            plan_id,
            task_id,
            interval,
            timestamp,
            ..Default::default()
        }
    }

    pub fn record(&mut self, result: &LiveResult) {
        self.total_num += 1;
        self.total_response_content_length += result.response_length;
        *self.duration_map.entry(result.duration_ms).or_insert(0) += 1;
        if let Some(code) = result.status_code {
            *self.status_map.entry(code).or_insert(0) += 1;
        }
        if let Some(err) = &result.err_string {
            *self.error_map.entry(err.clone()).or_insert(0) += 1;
        }
        if let Some(tag) = &result.body_check_result {
            *self.body_check_result_map.entry(tag.clone()).or_insert(0) += 1;
        }
        self.stop = self.stop || result.stop;
    }

    pub fn merge(&mut self, other: &Aggregate) {
        self.total_num += other.total_num;
        self.total_response_content_length += other.total_response_content_length;
        for (k, v) in &other.duration_map {
            *self.duration_map.entry(*k).or_insert(0) += v;
        }
        for (k, v) in &other.status_map {
            *self.status_map.entry(*k).or_insert(0) += v;
        }
        for (k, v) in &other.error_map {
            *self.error_map.entry(k.clone()).or_insert(0) += v;
        }
        for (k, v) in &other.body_check_result_map {
            *self.body_check_result_map.entry(k.clone()).or_insert(0) += v;
        }
        self.stop = self.stop || other.stop;
    }
}

/// Durable row for a Plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRecord {
    pub plan_id: i64,
    pub user_id: i64,
    pub name: String,
    pub status: PlanStatus,
    pub create_time: i64,
}

/// Durable row for a Task, including the integrator's computed summaries
/// once status flips to Done.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: i64,
    pub plan_id: i64,
    pub url: String,
    pub status: TaskStatus,
    pub stat_ext: Option<serde_json::Value>,
    pub create_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(num: u64, max_num: Option<u64>, step_num: Option<u64>) -> Task {
        Task {
            task_id: 1,
            plan_id: 1,
            name: "t".into(),
            url: "http://echo/ok".into(),
            method: HttpMethod::Get,
            headers: HashMap::new(),
            query: vec![],
            body: None,
            timeout_secs: 2,
            max_connections: 10,
            flags: TransportFlags::default(),
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
    fn constant_step_schedule_is_flat() {
        let t = task(10, None, None);
        assert_eq!(t.step_schedule(1), vec![10]);
    }

    #[test]
    fn step_schedule_ramps_and_caps_at_max() {
        let t = task(10, Some(30), Some(10));
        assert_eq!(t.step_schedule(3), vec![10, 20, 30]);
        // one more interval than the plan's interval_len still caps at max
        assert_eq!(t.step_schedule(4), vec![10, 20, 30, 30]);
    }

    #[test]
    fn interval_len_constant_is_one() {
        let plan = Plan {
            plan_id: 1,
            user_id: 1,
            name: "p".into(),
            stress_type: StressType::Rps,
            stress_mode: StressMode::Constant,
            stress_time: 60,
            step_interval_time: 0,
            tasks: vec![],
        };
        assert_eq!(plan.interval_len(), 1);
        assert_eq!(plan.effective_step_interval(), 60);
    }

    #[test]
    fn interval_len_step_ceils() {
        let plan = Plan {
            plan_id: 1,
            user_id: 1,
            name: "p".into(),
            stress_type: StressType::Rps,
            stress_mode: StressMode::Step,
            stress_time: 180,
            step_interval_time: 60,
            tasks: vec![],
        };
        assert_eq!(plan.interval_len(), 3);

        let plan2 = Plan {
            stress_time: 181,
            ..plan
        };
        assert_eq!(plan2.interval_len(), 4);
    }

    #[test]
    fn aggregate_merge_sums_maps() {
        let mut a = Aggregate::new(1, 1, 0, 100);
        a.record(&LiveResult {
            timestamp: 100,
            duration_ms: 5,
            status_code: Some(200),
            response_length: 10,
            err_string: None,
            body_check_result: None,
            stop: false,
        });
        let mut b = Aggregate::new(1, 1, 0, 100);
        b.record(&LiveResult {
            timestamp: 100,
            duration_ms: 5,
            status_code: Some(200),
            response_length: 20,
            err_string: None,
            body_check_result: None,
            stop: true,
        });
        a.merge(&b);
        assert_eq!(a.total_num, 2);
        assert_eq!(a.duration_map[&5], 2);
        assert_eq!(a.status_map[&200], 2);
        assert!(a.stop);
    }

    #[test]
    fn assignment_interval_totals_sum_across_binds() {
        let assignment = Assignment {
            task_id: 1,
            binds: vec![
                BindNode {
                    worker_addr: "a".into(),
                    base_num: 50,
                    per_interval_nums: vec![5, 10, 15],
                },
                BindNode {
                    worker_addr: "b".into(),
                    base_num: 30,
                    per_interval_nums: vec![3, 6, 9],
                },
            ],
        };
        assert_eq!(assignment.total_base_num(), 80);
        assert_eq!(assignment.interval_totals(3), vec![8, 16, 24]);
    }
}
