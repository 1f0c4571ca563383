//! Validation, id minting, the CAS-retry-once placement loop, dispatch, and
//! the stop/restart paths (§4.1).
//!
//! Grounded on `biz_stress_start.go`'s `preCheck`/`StartStress` for
//! admission and dispatch, and the sibling stop/restart biz files for
//! those two paths. The RPC transport is a generic `Dispatcher` so this
//! module stays testable without a live tonic client; `crate::rpc`
//! provides the real implementation over the generated `Pecker`/
//! `Integrator` services.

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::errors::{ErrorKind, LedgerError, PlacementError, Severity, ValidationError};
use crate::ids::IdGenerator;
use crate::ledger::{Ledger, LedgerEntry};
use crate::model::{
    Assignment, NodeCost, Plan, PlanRecord, PlanStatus, ServiceInstance, StressMode, Task,
    TaskRecord, TaskStatus,
};
use crate::queue::Queue;
use crate::record_store::RecordStore;
use crate::registry::Discovery;
use crate::scripting::{dry_run, ParamGenerator, ResponseChecker};

use super::placement::place_task;

const MAX_TASKS_PER_PLAN: usize = 50;
const MAX_PLACEMENT_RETRIES: u32 = 1;

#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Placement(#[from] PlacementError),
    #[error("dispatch failed for worker {addr}: {reason}")]
    Dispatch { addr: String, reason: String },
    #[error("record store error: {0}")]
    RecordStore(String),
}

impl ErrorKind for AdmissionError {
    fn kind(&self) -> Severity {
        match self {
            AdmissionError::Validation(e) => e.kind(),
            AdmissionError::Placement(e) => e.kind(),
            AdmissionError::Dispatch { .. } => Severity::Transient,
            AdmissionError::RecordStore(_) => Severity::Fatal,
        }
    }
}

/// What the controller sends to a worker and to the integrator, expressed
/// in domain terms; `crate::rpc`'s `Dispatcher` impl is responsible for the
/// protobuf encoding.
pub struct PeckOrder<'a> {
    pub plan: &'a Plan,
    pub task: &'a Task,
    pub assignment_for_worker: &'a crate::model::BindNode,
    pub interval_len: usize,
    pub self_addr: &'a str,
    /// Pre-rendered dynamic-param variants, one JSON-encoded `ParamVariant`
    /// per element, exactly as the `Peck` RPC carries them on the wire
    /// (§4.2: the worker picks one uniformly at random per request; it
    /// never executes a script itself).
    pub dynamic_params: &'a [Vec<u8>],
}

pub struct IntegrateOrder<'a> {
    pub plan: &'a Plan,
    pub interval_len: usize,
    pub start_time: u64,
}

/// The transport seam dispatch goes through. Implemented over tonic by
/// `crate::rpc`; a fake implementation drives `controller` unit tests
/// without a network.
pub trait Dispatcher {
    async fn peck(&self, order: PeckOrder<'_>) -> Result<(), String>;
    async fn stop(&self, worker_addr: &str, plan_id: i64, task_id: i64) -> Result<(), String>;
    async fn integrate(&self, order: IntegrateOrder<'_>) -> Result<(), String>;
}

/// Owns the id generators, registry/ledger handles, the durable record
/// store, and a worker-RPC dispatcher. One instance per controller process.
pub struct Controller<D: Dispatcher> {
    pub discovery: Discovery,
    pub ledger: Ledger,
    pub record_store: RecordStore,
    pub queue: Queue,
    pub plan_ids: IdGenerator,
    pub task_ids: IdGenerator,
    pub dispatcher: D,
    pub app_name: String,
    pub max_param_bytes: usize,
    /// `plan_id -> [(task_id, worker_addrs)]`, populated at admission so
    /// `/stress/stop` can best-effort `Stop` every bound worker without a
    /// durable-store round trip (§4.1 Stop). Not itself durable: a
    /// controller restart loses in-flight plans' bindings along with their
    /// process-local state, same as the stop-flag map on the worker side.
    pub bindings: Mutex<HashMap<i64, Vec<(i64, Vec<String>)>>>,
    /// The admitted `Plan` (post id-minting), cached so `/stress/restart`
    /// can re-admit an independent copy with fresh plan/task ids without a
    /// separate plan-definition store — `record_store` only durably tracks
    /// execution status, not the original task bodies/headers/scripts.
    pub plans: Mutex<HashMap<i64, Plan>>,
}

impl<D: Dispatcher> Controller<D> {
    /// §4.1 Admission: validates every task, mints ids, places load,
    /// dispatches, and journals. Returns the minted plan id on success.
    pub async fn admit(
        &mut self,
        mut plan: Plan,
        checkers: &HashMap<i64, Box<dyn ResponseChecker>>,
        generators: &HashMap<i64, Box<dyn ParamGenerator>>,
    ) -> Result<i64, AdmissionError> {
        if let Err(e) = validate_plan(&plan) {
            crate::metrics::ADMISSION_REJECTIONS_TOTAL
                .with_label_values(&["validation"])
                .inc();
            return Err(e.into());
        }
        for task in &plan.tasks {
            let url = task.url.clone();
            let reachable = tokio::task::spawn_blocking(move || check_url_reachable(&url))
                .await
                .map_err(|e| AdmissionError::Dispatch {
                    addr: task.url.clone(),
                    reason: e.to_string(),
                })?;
            if let Err(e) = reachable {
                crate::metrics::ADMISSION_REJECTIONS_TOTAL
                    .with_label_values(&["validation"])
                    .inc();
                return Err(e.into());
            }
        }
        for task in &plan.tasks {
            let checker = checkers.get(&task.task_id).map(|b| b.as_ref());
            let generator = generators.get(&task.task_id).map(|b| b.as_ref());
            dry_run(checker, generator, self.max_param_bytes).map_err(|reason| {
                AdmissionError::Validation(ValidationError::ScriptDryRunFailed {
                    name: task.name.clone(),
                    reason,
                })
            })?;
        }

        plan.plan_id = self.plan_ids.next_id();
        for task in &mut plan.tasks {
            task.task_id = self.task_ids.next_id();
            task.plan_id = plan.plan_id;
        }

        let interval_len = plan.interval_len() as usize;
        let workers = self
            .discovery
            .list(&self.app_name)
            .await
            .map_err(|e| AdmissionError::Dispatch {
                addr: "<registry>".into(),
                reason: e.to_string(),
            })?;

        let mut assignments = Vec::with_capacity(plan.tasks.len());
        for task in &plan.tasks {
            let assignment = self
                .place_with_retry(task, plan.stress_type, plan.stress_mode, interval_len, &workers)
                .await?;
            assignments.push(assignment);
        }

        self.persist_plan(&plan).await?;
        self.dispatch(&plan, &assignments, interval_len, generators).await;
        self.cache_node_counts(&assignments).await;

        let bound: Vec<(i64, Vec<String>)> = assignments
            .iter()
            .map(|a| (a.task_id, a.binds.iter().map(|b| b.worker_addr.clone()).collect()))
            .collect();
        self.bindings.lock().unwrap().insert(plan.plan_id, bound);
        self.plans.lock().unwrap().insert(plan.plan_id, plan.clone());

        crate::metrics::PLANS_ADMITTED_TOTAL.inc();
        info!(plan_id = plan.plan_id, tasks = plan.tasks.len(), "plan admitted");
        Ok(plan.plan_id)
    }

    /// Re-reads the ledger, attempts placement, and on a CAS conflict
    /// retries exactly once against a freshly re-read ledger before
    /// surfacing the failure — Open Question (a) in §9.
    async fn place_with_retry(
        &mut self,
        task: &Task,
        stress_type: crate::model::StressType,
        stress_mode: StressMode,
        interval_len: usize,
        workers: &[ServiceInstance],
    ) -> Result<Assignment, AdmissionError> {
        let mut attempt = 0;
        loop {
            let entries = self
                .ledger
                .all_node_costs()
                .await
                .map_err(PlacementError::from)?;
            let ledger_map: HashMap<String, NodeCost> = entries
                .iter()
                .map(|e| (e.cost.addr.clone(), e.cost.clone()))
                .collect();
            let rev_map: HashMap<String, i64> = entries
                .iter()
                .map(|e| (e.cost.addr.clone(), e.mod_revision))
                .collect();

            let placed = place_task(task, stress_type, stress_mode, interval_len, workers, &ledger_map)?;

            let updates: Vec<LedgerEntry> = placed
                .updated_costs
                .iter()
                .map(|cost| LedgerEntry {
                    cost: cost.clone(),
                    mod_revision: rev_map.get(&cost.addr).copied().unwrap_or(0),
                })
                .collect();

            match self.ledger.compare_and_update(&updates).await {
                Ok(()) => return Ok(placed.assignment),
                Err(LedgerError::Conflict { .. }) if attempt < MAX_PLACEMENT_RETRIES => {
                    attempt += 1;
                    warn!(task_id = task.task_id, attempt, "ledger CAS conflict, retrying placement");
                    continue;
                }
                Err(e) => return Err(PlacementError::from(e).into()),
            }
        }
    }

    async fn persist_plan(&self, plan: &Plan) -> Result<(), AdmissionError> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let plan_record = PlanRecord {
            plan_id: plan.plan_id,
            user_id: plan.user_id,
            name: plan.name.clone(),
            status: PlanStatus::Doing,
            create_time: now,
        };
        let task_records: Vec<TaskRecord> = plan
            .tasks
            .iter()
            .map(|t| TaskRecord {
                task_id: t.task_id,
                plan_id: t.plan_id,
                url: t.url.clone(),
                status: TaskStatus::Doing,
                stat_ext: None,
                create_time: now,
            })
            .collect();

        self.record_store
            .create_plan(&plan_record, &task_records)
            .await
            .map_err(|e| AdmissionError::RecordStore(e.to_string()))
    }

    async fn dispatch(
        &self,
        plan: &Plan,
        assignments: &[Assignment],
        interval_len: usize,
        generators: &HashMap<i64, Box<dyn ParamGenerator>>,
    ) {
        if let Err(e) = self
            .dispatcher
            .integrate(IntegrateOrder {
                plan,
                interval_len,
                start_time: 0,
            })
            .await
        {
            error!(plan_id = plan.plan_id, error = %e, "integrate RPC failed");
        }

        for (task, assignment) in plan.tasks.iter().zip(assignments) {
            let dynamic_params = render_dynamic_params(task, generators);
            for bind in &assignment.binds {
                let order = PeckOrder {
                    plan,
                    task,
                    assignment_for_worker: bind,
                    interval_len,
                    self_addr: &bind.worker_addr,
                    dynamic_params: &dynamic_params,
                };
                if let Err(e) = self.dispatcher.peck(order).await {
                    warn!(worker = %bind.worker_addr, task_id = task.task_id, error = %e, "peck RPC failed after retries");
                }
            }
        }
    }

    async fn cache_node_counts(&self, assignments: &[Assignment]) {
        for assignment in assignments {
            let count = assignment.binds.len() as u32;
            if let Err(e) = self
                .queue
                .cache_task_node_count(assignment.task_id, count)
                .await
            {
                warn!(task_id = assignment.task_id, error = %e, "failed to cache task node count");
            }
        }
    }

    /// §4.1 Stop: best-effort `Stop` to every bound worker, then the plan
    /// record flips to STOP. Double-stop and stopping a nonexistent plan
    /// are no-ops.
    pub async fn stop(&mut self, plan_id: i64, bound: &[(i64, Vec<String>)]) {
        for (task_id, worker_addrs) in bound {
            for addr in worker_addrs {
                if let Err(e) = self.dispatcher.stop(addr, plan_id, *task_id).await {
                    warn!(worker = %addr, task_id, error = %e, "stop RPC failed (best-effort)");
                }
            }
        }
        if let Err(e) = self.record_store.update_plan_status(plan_id, PlanStatus::Stop).await {
            warn!(plan_id, error = %e, "failed to flip plan status to stop");
        }
    }

    /// The bindings recorded for `plan_id` at admission time, if any. A
    /// nonexistent plan id yields an empty vec, matching stop's documented
    /// idempotent no-op behavior.
    pub fn bound_for(&self, plan_id: i64) -> Vec<(i64, Vec<String>)> {
        self.bindings.lock().unwrap().get(&plan_id).cloned().unwrap_or_default()
    }

    /// A fresh copy of `plan_id`'s admitted definition with `plan_id`/task
    /// ids zeroed out, ready to pass back into [`Controller::admit`] for
    /// `/stress/restart`. `None` if the plan was never admitted here.
    pub fn restartable_copy(&self, plan_id: i64) -> Option<Plan> {
        let mut plan = self.plans.lock().unwrap().get(&plan_id).cloned()?;
        plan.plan_id = 0;
        for task in &mut plan.tasks {
            task.task_id = 0;
        }
        Some(plan)
    }
}

/// §4.1 Admission validation. Does not perform the TCP-reachability or
/// script dry-run checks (those need I/O / callables respectively and are
/// done by the caller); this covers the purely structural invariants.
pub fn validate_plan(plan: &Plan) -> Result<(), ValidationError> {
    if plan.tasks.len() > MAX_TASKS_PER_PLAN {
        return Err(ValidationError::TooManyTasks {
            count: plan.tasks.len(),
            max: MAX_TASKS_PER_PLAN,
        });
    }
    if plan.stress_time == 0 {
        return Err(ValidationError::InvalidTask("stress_time must be >= 1".into()));
    }
    if plan.stress_mode == StressMode::Step && plan.step_interval_time > plan.stress_time {
        return Err(ValidationError::InvalidTask(
            "step_interval_time must be <= stress_time".into(),
        ));
    }
    for task in &plan.tasks {
        validate_task(task, plan.stress_mode)?;
    }
    Ok(())
}

fn validate_task(task: &Task, mode: StressMode) -> Result<(), ValidationError> {
    if !(task.url.starts_with("http://") || task.url.starts_with("https://")) {
        return Err(ValidationError::MalformedUrl(task.url.clone()));
    }
    if task.num < 1 {
        return Err(ValidationError::InvalidTask(format!(
            "task {} num must be >= 1",
            task.task_id
        )));
    }
    if mode == StressMode::Step {
        let max_num = task.max_num.unwrap_or(0);
        let step_num = task.step_num.unwrap_or(0);
        if max_num < task.num || step_num == 0 {
            return Err(ValidationError::InvalidTask(format!(
                "task {} step mode requires max_num >= num and step_num > 0",
                task.task_id
            )));
        }
    }
    Ok(())
}

/// Renders `task`'s dynamic-param generator, if any, into the wire shape:
/// one independently JSON-encoded `ParamVariant` per element (§4.2). A
/// generator failure at dispatch time is Transient — it's already passed
/// the admission dry-run, so a render error here is logged and the task
/// is dispatched without dynamic params rather than failing the whole plan.
fn render_dynamic_params(
    task: &Task,
    generators: &HashMap<i64, Box<dyn ParamGenerator>>,
) -> Vec<Vec<u8>> {
    let Some(generator) = generators.get(&task.task_id) else {
        return Vec::new();
    };
    match generator.generate() {
        Ok(variants) => variants
            .iter()
            .filter_map(|v| match serde_json::to_vec(v) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!(task_id = task.task_id, error = %e, "failed to encode param variant");
                    None
                }
            })
            .collect(),
        Err(e) => {
            warn!(task_id = task.task_id, error = %e, "dynamic param generator failed at dispatch");
            Vec::new()
        }
    }
}

/// §4.1 Admission: the host:port of `url` must be TCP-reachable. A
/// separate function so admission can apply a short timeout without
/// blocking validation of the other structural invariants.
pub fn check_url_reachable(url: &str) -> Result<(), ValidationError> {
    let parsed =
        reqwest::Url::parse(url).map_err(|_| ValidationError::MalformedUrl(url.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ValidationError::MalformedUrl(url.to_string()))?;
    let port = parsed
        .port_or_known_default()
        .ok_or_else(|| ValidationError::MalformedUrl(url.to_string()))?;
    (host, port)
        .to_socket_addrs()
        .map_err(|e| ValidationError::UrlUnreachable {
            url: url.to_string(),
            reason: e.to_string(),
        })?
        .next()
        .ok_or_else(|| ValidationError::UrlUnreachable {
            url: url.to_string(),
            reason: "no addresses resolved".to_string(),
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn sample_task(task_id: i64, num: u64) -> Task {
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
            max_num: None,
            step_num: None,
            dynamic_param_script: None,
            response_check_script: None,
        }
    }

    fn sample_plan(tasks: Vec<Task>) -> Plan {
        Plan {
            plan_id: 0,
            user_id: 1,
            name: "p".into(),
            stress_type: crate::model::StressType::Rps,
            stress_mode: StressMode::Constant,
            stress_time: 60,
            step_interval_time: 0,
            tasks,
        }
    }

    #[test]
    fn rejects_plans_over_max_tasks() {
        let tasks = (0..51).map(|i| sample_task(i, 1)).collect();
        let plan = sample_plan(tasks);
        let err = validate_plan(&plan).unwrap_err();
        assert!(matches!(err, ValidationError::TooManyTasks { .. }));
    }

    #[test]
    fn rejects_malformed_url() {
        let mut task = sample_task(1, 1);
        task.url = "not-a-url".to_string();
        let plan = sample_plan(vec![task]);
        let err = validate_plan(&plan).unwrap_err();
        assert!(matches!(err, ValidationError::MalformedUrl(_)));
    }

    #[test]
    fn accepts_well_formed_constant_plan() {
        let plan = sample_plan(vec![sample_task(1, 10)]);
        assert!(validate_plan(&plan).is_ok());
    }

    #[test]
    fn step_mode_requires_max_num_and_step_num() {
        let mut task = sample_task(1, 10);
        task.max_num = None;
        let mut plan = sample_plan(vec![task]);
        plan.stress_mode = StressMode::Step;
        plan.step_interval_time = 10;
        let err = validate_plan(&plan).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidTask(_)));
    }
}
