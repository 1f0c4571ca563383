//! gRPC transport: the generated `Pecker`/`Integrator` bindings, the
//! domain<->wire conversions, the concrete `Dispatcher` the controller
//! dials workers and the integrator through, and the server-side handlers
//! that turn an inbound `Peck`/`Stop`/`Integrate` call into real work.
//!
//! Grounded on the teacher's `grpc.rs`: `PeerClientPool`'s address-keyed
//! channel cache is reused for dialing workers from the controller side
//! (lazily, on first dispatch to a given address, since unlike the
//! teacher's fixed peer list the controller doesn't know its worker set
//! until a plan is placed), and the tonic-service/`#[tonic::async_trait]`
//! shape is reused directly for the worker- and integrator-side handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};
use tracing::warn;

use crate::analytics::AnalyticsStore;
use crate::config::WorkerTuning;
use crate::controller::admission::{Dispatcher, IntegrateOrder, PeckOrder};
use crate::integrator::{run_task_integration, IntegrateTaskContext};
use crate::ledger::{Ledger, LedgerEntry};
use crate::model::{HttpMethod, NodeCost, StressMode, StressType, Task, TransportFlags};
use crate::queue::Queue;
use crate::record_store::RecordStore;
use crate::scripting::{LiteralEqualityChecker, ParamGenerator, ParamVariant, ResponseChecker, StaticParamGenerator};
use crate::worker::driver::{run_concurrency_driver, run_rps_driver, run_stepped_rps_driver, RequestFn, StopFlag};
use crate::worker::pacer::{ConstantPacer, Pacer};
use crate::worker::request::execute_request;
use crate::worker::stat::{run_stat_pipeline, StatConfig};

pub mod proto {
    tonic::include_proto!("loadtest");
}

use proto::integrator_client::IntegratorClient;
use proto::integrator_server::{Integrator, IntegratorServer};
use proto::pecker_client::PeckerClient;
use proto::pecker_server::{Pecker, PeckerServer};
use proto::{IntegrateAck, IntegrateRequest, IntegrateTask, PeckAck, PeckRequest, StopAck, StopRequest};

pub use proto::{integrator_server, pecker_server};

const PECK_MAX_RETRIES: u32 = 3;
const INTEGRATE_DEADLINE: Duration = Duration::from_secs(3);

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn stress_type_to_proto(t: StressType) -> i32 {
    match t {
        StressType::Rps => proto::StressType::StressTypeRps as i32,
        StressType::Concurrency => proto::StressType::StressTypeConcurrency as i32,
    }
}

fn stress_type_from_proto(v: i32) -> StressType {
    if v == proto::StressType::StressTypeConcurrency as i32 {
        StressType::Concurrency
    } else {
        StressType::Rps
    }
}

fn stress_mode_to_proto(m: StressMode) -> i32 {
    match m {
        StressMode::Constant => proto::StressMode::StressModeConstant as i32,
        StressMode::Step => proto::StressMode::StressModeStep as i32,
    }
}

fn stress_mode_from_proto(v: i32) -> StressMode {
    if v == proto::StressMode::StressModeStep as i32 {
        StressMode::Step
    } else {
        StressMode::Constant
    }
}

fn parse_query_string(raw: &str) -> Vec<(String, String)> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split('&')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let k = parts.next()?.to_string();
            let v = parts.next().unwrap_or("").to_string();
            Some((k, v))
        })
        .collect()
}

fn render_query_string(query: &[(String, String)]) -> String {
    query
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn http_method_from_str(s: &str) -> HttpMethod {
    match s.to_uppercase().as_str() {
        "POST" => HttpMethod::Post,
        "PUT" => HttpMethod::Put,
        "DELETE" => HttpMethod::Delete,
        _ => HttpMethod::Get,
    }
}

const FLAG_DISABLE_COMPRESSION: &str = "disableCompression";
const FLAG_DISABLE_KEEP_ALIVE: &str = "disableKeepAlive";
const FLAG_DISABLE_REDIRECT: &str = "disableRedirect";
const FLAG_ENABLE_HTTP2: &str = "enableHttp2";

fn flags_to_wire(flags: &TransportFlags) -> Vec<String> {
    let mut out = Vec::new();
    if flags.disable_compression {
        out.push(FLAG_DISABLE_COMPRESSION.to_string());
    }
    if flags.disable_keep_alive {
        out.push(FLAG_DISABLE_KEEP_ALIVE.to_string());
    }
    if flags.disable_redirects {
        out.push(FLAG_DISABLE_REDIRECT.to_string());
    }
    if flags.enable_h2 {
        out.push(FLAG_ENABLE_HTTP2.to_string());
    }
    out
}

pub(crate) fn flags_from_wire(flags: &[String]) -> TransportFlags {
    TransportFlags {
        disable_compression: flags.iter().any(|f| f == FLAG_DISABLE_COMPRESSION),
        disable_keep_alive: flags.iter().any(|f| f == FLAG_DISABLE_KEEP_ALIVE),
        disable_redirects: flags.iter().any(|f| f == FLAG_DISABLE_REDIRECT),
        enable_h2: flags.iter().any(|f| f == FLAG_ENABLE_HTTP2),
    }
}

/// Builds the wire `PeckRequest` for one worker's share of one task (§6).
pub fn peck_request_from(order: &PeckOrder<'_>) -> PeckRequest {
    let task = order.task;
    let bind = order.assignment_for_worker;
    let body = task
        .body
        .as_ref()
        .map(|v| serde_json::to_vec(v).unwrap_or_default())
        .unwrap_or_default();

    PeckRequest {
        plan_id: order.plan.plan_id,
        task_id: task.task_id,
        stress_type: stress_type_to_proto(order.plan.stress_type),
        stress_mode: stress_mode_to_proto(order.plan.stress_mode),
        num: bind.base_num,
        nums: bind.per_interval_nums.clone(),
        step_interval_time: order.plan.effective_step_interval(),
        stress_time: order.plan.stress_time,
        max_connections: task.max_connections,
        max_idle_connections: task.max_connections,
        timeout_seconds: task.timeout_secs,
        method: task.method.as_str().to_string(),
        url: task.url.clone(),
        headers: task.headers.clone(),
        query: render_query_string(&task.query),
        body,
        dynamic_params: order.dynamic_params.to_vec(),
        response_check_script: task.response_check_script.clone().unwrap_or_default(),
        flags: flags_to_wire(&task.flags),
        max_body_size: task.max_body_size.unwrap_or(0),
        proxy: task.proxy.clone().unwrap_or_default(),
        addr: bind.worker_addr.clone(),
    }
}

/// Builds the wire `IntegrateRequest` for the whole plan (§6).
pub fn integrate_request_from(order: &IntegrateOrder<'_>) -> IntegrateRequest {
    let tasks = order
        .plan
        .tasks
        .iter()
        .map(|t| IntegrateTask {
            task_id: t.task_id,
            url: t.url.clone(),
            request_content_length: t
                .body
                .as_ref()
                .map(|b| serde_json::to_vec(b).map(|v| v.len() as u64).unwrap_or(0))
                .unwrap_or(0),
        })
        .collect();

    IntegrateRequest {
        plan_id: order.plan.plan_id,
        tasks,
        stress_time: order.plan.stress_time,
        stress_type: stress_type_to_proto(order.plan.stress_type),
        stress_mode: stress_mode_to_proto(order.plan.stress_mode),
        step_interval_time: order.plan.effective_step_interval(),
        interval_len: order.interval_len as u32,
        start_time: order.start_time as i64,
        user_id: order.plan.user_id,
    }
}

fn task_from_peck_request(req: &PeckRequest) -> Task {
    Task {
        task_id: req.task_id,
        plan_id: req.plan_id,
        name: format!("task-{}", req.task_id),
        url: req.url.clone(),
        method: http_method_from_str(&req.method),
        headers: req.headers.clone(),
        query: parse_query_string(&req.query),
        body: if req.body.is_empty() {
            None
        } else {
            serde_json::from_slice(&req.body).ok()
        },
        timeout_secs: req.timeout_seconds,
        max_connections: req.max_connections,
        flags: flags_from_wire(&req.flags),
        proxy: if req.proxy.is_empty() { None } else { Some(req.proxy.clone()) },
        max_body_size: if req.max_body_size == 0 { None } else { Some(req.max_body_size) },
        num: req.num,
        max_num: req.nums.last().copied(),
        step_num: None,
        dynamic_param_script: None,
        response_check_script: if req.response_check_script.is_empty() {
            None
        } else {
            Some(req.response_check_script.clone())
        },
    }
}

/// Lazily-connected, address-keyed channel cache. The controller's
/// dial-on-demand counterpart to the teacher's `PeerClientPool`, which
/// eagerly connects to a fixed peer list instead — the worker pool this
/// system dispatches to is only known once placement has run, not at
/// controller startup.
#[derive(Clone, Default)]
struct ChannelCache {
    channels: Arc<Mutex<HashMap<String, Channel>>>,
}

impl ChannelCache {
    async fn get_or_connect(&self, addr: &str) -> Result<Channel, String> {
        if let Some(channel) = self.channels.lock().unwrap().get(addr).cloned() {
            return Ok(channel);
        }
        let uri = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };
        let endpoint = Endpoint::from_shared(uri).map_err(|e| e.to_string())?;
        let channel = endpoint.connect().await.map_err(|e| e.to_string())?;
        self.channels.lock().unwrap().insert(addr.to_string(), channel.clone());
        Ok(channel)
    }

    fn drop_addr(&self, addr: &str) {
        self.channels.lock().unwrap().remove(addr);
    }
}

/// The concrete `Dispatcher` the controller uses in production: real tonic
/// calls to `Pecker`/`Integrator`, with the retry and timeout policy from
/// §4.1/§5 — up to 3 attempts for `Peck`, a 3-second deadline for
/// `Integrate`.
#[derive(Clone, Default)]
pub struct GrpcDispatcher {
    channels: ChannelCache,
    integrator_addr: String,
}

impl GrpcDispatcher {
    pub fn new(integrator_addr: impl Into<String>) -> Self {
        Self {
            channels: ChannelCache::default(),
            integrator_addr: integrator_addr.into(),
        }
    }
}

impl Dispatcher for GrpcDispatcher {
    async fn peck(&self, order: PeckOrder<'_>) -> Result<(), String> {
        let addr = order.assignment_for_worker.worker_addr.clone();
        let request = peck_request_from(&order);

        let mut last_err = "no attempts made".to_string();
        for attempt in 0..PECK_MAX_RETRIES {
            let channel = match self.channels.get_or_connect(&addr).await {
                Ok(c) => c,
                Err(e) => {
                    last_err = e;
                    continue;
                }
            };
            let mut client = PeckerClient::new(channel);
            match client.peck(Request::new(request.clone())).await {
                Ok(resp) if resp.into_inner().accepted => return Ok(()),
                Ok(resp) => last_err = resp.into_inner().message,
                Err(status) => {
                    last_err = status.to_string();
                    self.channels.drop_addr(&addr);
                }
            }
            warn!(worker = %addr, attempt, "peck RPC attempt failed");
        }
        Err(last_err)
    }

    async fn stop(&self, worker_addr: &str, plan_id: i64, task_id: i64) -> Result<(), String> {
        let channel = self.channels.get_or_connect(worker_addr).await?;
        let mut client = PeckerClient::new(channel);
        client
            .stop(Request::new(StopRequest { plan_id, task_id }))
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn integrate(&self, order: IntegrateOrder<'_>) -> Result<(), String> {
        let request = integrate_request_from(&order);
        let channel = self.channels.get_or_connect(&self.integrator_addr).await?;
        let mut client = IntegratorClient::new(channel);
        let call = client.integrate(Request::new(request));
        match tokio::time::timeout(INTEGRATE_DEADLINE, call).await {
            Ok(Ok(resp)) if resp.into_inner().accepted => Ok(()),
            Ok(Ok(resp)) => Err(resp.into_inner().message),
            Ok(Err(status)) => Err(status.to_string()),
            Err(_) => Err("integrate RPC timed out after 3s".to_string()),
        }
    }
}

/// Process-wide stop-flag map (§5): one entry per in-flight task, created
/// before `Peck` returns to the caller and removed once the stat pipeline's
/// finalizer runs.
#[derive(Clone, Default)]
struct StopRegistry {
    flags: Arc<Mutex<HashMap<(i64, i64), StopFlag>>>,
}

impl StopRegistry {
    fn register(&self, plan_id: i64, task_id: i64) -> StopFlag {
        let flag = StopFlag::new();
        self.flags.lock().unwrap().insert((plan_id, task_id), flag.clone());
        flag
    }

    fn take(&self, plan_id: i64, task_id: i64) -> Option<StopFlag> {
        self.flags.lock().unwrap().get(&(plan_id, task_id)).cloned()
    }

    fn remove(&self, plan_id: i64, task_id: i64) {
        self.flags.lock().unwrap().remove(&(plan_id, task_id));
    }
}

fn pick_variant(generator: Option<&dyn ParamGenerator>) -> Option<ParamVariant> {
    let variants = generator?.generate().ok()?;
    if variants.is_empty() {
        return None;
    }
    let idx = rand::thread_rng().gen_range(0..variants.len());
    Some(variants[idx].clone())
}

/// Builds the per-task HTTP client from a `Peck`'s transport flags.
/// `disableCompression`/`enableHttp2` are accepted on the wire but are
/// no-ops in this build: the `gzip`/`brotli`/`http2` reqwest features
/// aren't compiled in (see Cargo.toml), so there is nothing to toggle.
fn build_http_client(req: &PeckRequest) -> Result<reqwest::Client, String> {
    let mut builder = reqwest::Client::builder();
    if req.flags.iter().any(|f| f == FLAG_DISABLE_KEEP_ALIVE) {
        builder = builder.pool_max_idle_per_host(0);
    } else {
        builder = builder.pool_max_idle_per_host(req.max_idle_connections.max(1) as usize);
    }
    if req.flags.iter().any(|f| f == FLAG_DISABLE_REDIRECT) {
        builder = builder.redirect(reqwest::redirect::Policy::none());
    }
    if !req.proxy.is_empty() {
        let proxy = reqwest::Proxy::all(&req.proxy).map_err(|e| e.to_string())?;
        builder = builder.proxy(proxy);
    }
    builder.build().map_err(|e| e.to_string())
}

/// Worker-side `Pecker` handler: turns one `Peck` into a running driver +
/// stat pipeline, and `Stop` into flipping that task's cancellation flag.
pub struct PeckerService {
    stops: StopRegistry,
    queue: Queue,
    ledger: Arc<tokio::sync::Mutex<Ledger>>,
    tuning: WorkerTuning,
}

impl PeckerService {
    pub fn new(queue: Queue, ledger: Ledger, tuning: WorkerTuning) -> Self {
        Self {
            stops: StopRegistry::default(),
            queue,
            ledger: Arc::new(tokio::sync::Mutex::new(ledger)),
            tuning,
        }
    }
}

#[tonic::async_trait]
impl Pecker for PeckerService {
    async fn peck(&self, request: Request<PeckRequest>) -> Result<Response<PeckAck>, Status> {
        let req = request.into_inner();
        let plan_id = req.plan_id;
        let task_id = req.task_id;
        let stop_flag = self.stops.register(plan_id, task_id);

        let task = task_from_peck_request(&req);
        let checker: Option<Arc<dyn ResponseChecker>> = task
            .response_check_script
            .as_ref()
            .map(|s| Arc::new(LiteralEqualityChecker::new(s.clone())) as Arc<dyn ResponseChecker>);

        let generator: Option<Arc<dyn ParamGenerator>> = if req.dynamic_params.is_empty() {
            None
        } else {
            match StaticParamGenerator::from_json_variants(&req.dynamic_params) {
                Ok(g) => Some(Arc::new(g) as Arc<dyn ParamGenerator>),
                Err(e) => {
                    self.stops.remove(plan_id, task_id);
                    return Err(Status::invalid_argument(e));
                }
            }
        };

        let client = match build_http_client(&req) {
            Ok(c) => c,
            Err(e) => {
                self.stops.remove(plan_id, task_id);
                return Err(Status::invalid_argument(e));
            }
        };

        let task = Arc::new(task);
        let timeout = Duration::from_secs(task.timeout_secs.max(1) as u64);
        let max_timeout = Duration::from_secs(self.tuning.max_timeout_secs.max(task.timeout_secs as u64));
        let max_body_size = task.max_body_size;
        let error_cut_length = self.tuning.error_cut_length;
        let result_stop_flag = stop_flag.clone();

        let request_fn: RequestFn = {
            let client = client.clone();
            let task = task.clone();
            let checker = checker.clone();
            let generator = generator.clone();
            let result_stop_flag = result_stop_flag.clone();
            Arc::new(move || {
                let client = client.clone();
                let task = task.clone();
                let checker = checker.clone();
                let generator = generator.clone();
                let result_stop_flag = result_stop_flag.clone();
                Box::pin(async move {
                    let variant = pick_variant(generator.as_deref());
                    execute_request(
                        &client,
                        &task,
                        variant.as_ref(),
                        checker.as_deref(),
                        timeout,
                        max_timeout,
                        max_body_size,
                        error_cut_length,
                        result_stop_flag.is_set(),
                    )
                    .await
                })
            })
        };

        let stress_type = stress_type_from_proto(req.stress_type);
        let stress_mode = stress_mode_from_proto(req.stress_mode);
        let duration = Duration::from_secs(req.stress_time);
        let step_interval = Duration::from_secs(req.step_interval_time.max(1));

        let chan_size = if stress_type == StressType::Rps {
            (req.num as usize)
                .saturating_mul(self.tuning.rps_result_chan_blowup as usize)
                .min(self.tuning.max_result_chan_size)
                .max(1)
        } else {
            (req.num as usize).min(self.tuning.max_result_chan_size).max(1)
        };
        let (result_tx, result_rx) = mpsc::channel(chan_size);

        let entries = {
            let mut ledger = self.ledger.lock().await;
            ledger.all_node_costs().await
        };
        let entries = match entries {
            Ok(e) => e,
            Err(e) => {
                self.stops.remove(plan_id, task_id);
                return Err(Status::internal(e.to_string()));
            }
        };
        let node_cost_entry = entries.into_iter().find(|e| e.cost.addr == req.addr).unwrap_or_else(|| LedgerEntry {
            cost: NodeCost::new_empty(req.addr.clone(), 0, 0),
            mod_revision: 0,
        });

        let stat_config = StatConfig {
            plan_id,
            task_id,
            run_start_secs: now_secs(),
            interval_len: req.nums.len().max(1),
            step_interval_secs: req.step_interval_time.max(1),
            report_goroutine_num: self.tuning.report_goroutine_num,
        };

        let queue = self.queue.clone();
        let ledger = self.ledger.clone();
        let stops = self.stops.clone();
        let driver_stop = stop_flag.clone();
        let freqs: Vec<f64> = req.nums.iter().map(|&n| n as f64).collect();
        let concurrency_targets = req.nums.clone();
        let base_num = req.num;
        let is_rps = stress_type == StressType::Rps;

        tokio::spawn(async move {
            match (stress_type, stress_mode) {
                (StressType::Rps, StressMode::Step) => {
                    run_stepped_rps_driver(freqs, Duration::from_secs(1), step_interval, duration, driver_stop, request_fn, result_tx).await;
                }
                (StressType::Rps, StressMode::Constant) => {
                    let pacer: Box<dyn Pacer> = Box::new(ConstantPacer::new(base_num as f64, Duration::from_secs(1)));
                    run_rps_driver(pacer, duration, driver_stop, request_fn, result_tx).await;
                }
                (StressType::Concurrency, _) => {
                    run_concurrency_driver(base_num, concurrency_targets, step_interval, duration, driver_stop, request_fn, result_tx).await;
                }
            }
        });

        tokio::spawn(async move {
            let mut ledger_guard = ledger.lock().await;
            run_stat_pipeline(stat_config, result_rx, queue, &mut ledger_guard, node_cost_entry, base_num, is_rps).await;
            drop(ledger_guard);
            stops.remove(plan_id, task_id);
        });

        Ok(Response::new(PeckAck {
            accepted: true,
            message: String::new(),
        }))
    }

    async fn stop(&self, request: Request<StopRequest>) -> Result<Response<StopAck>, Status> {
        let req = request.into_inner();
        if let Some(flag) = self.stops.take(req.plan_id, req.task_id) {
            flag.set();
        }
        Ok(Response::new(StopAck {}))
    }
}

/// Integrator-side `Integrator` handler: spawns the fiber pair for every
/// task in the request and acknowledges immediately (§4.3 runs for up to
/// `stress_time + 10s` in the background, not inline with the RPC).
pub struct IntegratorService {
    queue: Queue,
    analytics: Arc<AnalyticsStore>,
    record_store: Arc<RecordStore>,
}

impl IntegratorService {
    pub fn new(queue: Queue, analytics: AnalyticsStore, record_store: RecordStore) -> Self {
        Self {
            queue,
            analytics: Arc::new(analytics),
            record_store: Arc::new(record_store),
        }
    }
}

#[tonic::async_trait]
impl Integrator for IntegratorService {
    async fn integrate(&self, request: Request<IntegrateRequest>) -> Result<Response<IntegrateAck>, Status> {
        let req = request.into_inner();
        let stress_mode = stress_mode_from_proto(req.stress_mode);
        let interval_len = req.interval_len.max(1) as usize;

        for task in req.tasks {
            let ctx = IntegrateTaskContext {
                task_id: task.task_id,
                plan_id: req.plan_id,
                url: task.url,
            };
            let queue = self.queue.clone();
            let analytics = self.analytics.clone();
            let record_store = self.record_store.clone();
            let stress_time = req.stress_time;
            let step_interval_time = req.step_interval_time;

            tokio::spawn(async move {
                run_task_integration(
                    ctx,
                    stress_mode,
                    stress_time,
                    step_interval_time,
                    interval_len,
                    queue,
                    &analytics,
                    &record_store,
                )
                .await;
            });
        }

        Ok(Response::new(IntegrateAck {
            accepted: true,
            message: String::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Assignment, BindNode, HttpMethod as Method, Plan};

    fn sample_task() -> crate::model::Task {
        crate::model::Task {
            task_id: 2,
            plan_id: 1,
            name: "t".into(),
            url: "http://example.com/ok".into(),
            method: Method::Post,
            headers: HashMap::new(),
            query: vec![("a".into(), "1".into())],
            body: Some(serde_json::json!({"x": 1})),
            timeout_secs: 5,
            max_connections: 100,
            flags: TransportFlags {
                disable_redirects: true,
                ..Default::default()
            },
            proxy: None,
            max_body_size: Some(1024),
            num: 10,
            max_num: None,
            step_num: None,
            dynamic_param_script: None,
            response_check_script: Some("pong".into()),
        }
    }

    fn sample_plan(task: crate::model::Task) -> Plan {
        Plan {
            plan_id: 1,
            user_id: 9,
            name: "p".into(),
            stress_type: StressType::Rps,
            stress_mode: StressMode::Constant,
            stress_time: 60,
            step_interval_time: 0,
            tasks: vec![task],
        }
    }

    #[test]
    fn peck_request_round_trips_method_query_and_flags() {
        let task = sample_task();
        let plan = sample_plan(task.clone());
        let bind = BindNode {
            worker_addr: "10.0.0.1:7100".into(),
            base_num: 7,
            per_interval_nums: vec![7],
        };
        let variants = vec![serde_json::to_vec(&crate::scripting::ParamVariant {
            headers: Default::default(),
            query: Default::default(),
            body: Some(serde_json::json!({"n": 1})),
        })
        .unwrap()];
        let order = PeckOrder {
            plan: &plan,
            task: &plan.tasks[0],
            assignment_for_worker: &bind,
            interval_len: 1,
            self_addr: &bind.worker_addr,
            dynamic_params: &variants,
        };
        let wire = peck_request_from(&order);
        assert_eq!(wire.method, "POST");
        assert_eq!(wire.query, "a=1");
        assert_eq!(wire.num, 7);
        assert_eq!(wire.addr, "10.0.0.1:7100");
        assert!(wire.flags.contains(&FLAG_DISABLE_REDIRECT.to_string()));
        assert_eq!(wire.dynamic_params, variants);

        let rebuilt = task_from_peck_request(&wire);
        assert_eq!(rebuilt.method, HttpMethod::Post);
        assert_eq!(rebuilt.query, vec![("a".to_string(), "1".to_string())]);
        assert!(rebuilt.flags.disable_redirects);
        assert_eq!(rebuilt.response_check_script.as_deref(), Some("pong"));
    }

    #[test]
    fn integrate_request_carries_every_task_and_plan_field() {
        let task = sample_task();
        let plan = sample_plan(task);
        let order = IntegrateOrder {
            plan: &plan,
            interval_len: 1,
            start_time: 1_700_000_000,
        };
        let wire = integrate_request_from(&order);
        assert_eq!(wire.plan_id, 1);
        assert_eq!(wire.tasks.len(), 1);
        assert_eq!(wire.tasks[0].task_id, 2);
        assert_eq!(wire.user_id, 9);
        assert_eq!(wire.start_time, 1_700_000_000);
    }

    #[test]
    fn stop_registry_register_take_remove_round_trip() {
        let registry = StopRegistry::default();
        let flag = registry.register(1, 2);
        assert!(!flag.is_set());
        let same = registry.take(1, 2).unwrap();
        same.set();
        assert!(flag.is_set());
        registry.remove(1, 2);
        assert!(registry.take(1, 2).is_none());
    }

    #[test]
    fn stress_type_and_mode_proto_round_trip() {
        assert_eq!(stress_type_from_proto(stress_type_to_proto(StressType::Rps)), StressType::Rps);
        assert_eq!(
            stress_type_from_proto(stress_type_to_proto(StressType::Concurrency)),
            StressType::Concurrency
        );
        assert_eq!(stress_mode_from_proto(stress_mode_to_proto(StressMode::Step)), StressMode::Step);
        assert_eq!(
            stress_mode_from_proto(stress_mode_to_proto(StressMode::Constant)),
            StressMode::Constant
        );
    }

    #[test]
    fn pick_variant_is_none_for_empty_generator() {
        use crate::scripting::FnParamGenerator;
        let empty = FnParamGenerator(|| Ok(vec![]));
        assert!(pick_variant(Some(&empty)).is_none());
        assert!(pick_variant(None).is_none());
    }

    #[allow(dead_code)]
    fn assignment_is_constructible(a: Assignment) -> Assignment {
        a
    }
}
