//! Controller entrypoint: loads the shared YAML config, wires up the
//! registry/ledger/queue/record-store clients, and serves the admin HTTP
//! API (§4.1, §6).
//!
//! Bootstrap shape grounded on the teacher's `main.rs`: parse flags, start
//! the `/metrics` server as a background task, then run the real service
//! to completion on the current Tokio runtime.

use std::net::SocketAddr;

use clap::Parser;
use etcd_client::Client as EtcdClient;
use peckmesh::config::ServerConfig;
use peckmesh::controller::{AdminApi, Controller};
use peckmesh::ids::IdGenerator;
use peckmesh::ledger::Ledger;
use peckmesh::queue::Queue;
use peckmesh::record_store::RecordStore;
use peckmesh::registry::Discovery;
use peckmesh::rpc::GrpcDispatcher;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "controller", about = "peckmesh admission/placement controller")]
struct Args {
    /// Path to the shared YAML config file.
    #[arg(short = 'f', long = "config")]
    config: String,
    /// Address the admin HTTP API binds to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,
    /// Address of the integrator this controller dispatches `Integrate` to.
    #[arg(long)]
    integrator_addr: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let args = Args::parse();
    let config = ServerConfig::from_file(&args.config)?;

    peckmesh::metrics::register_metrics()?;
    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr.parse()?;
        peckmesh::metrics::spawn(addr);
    }

    let etcd_for_discovery = EtcdClient::connect(&config.registry.endpoints, None).await?;
    let etcd_for_ledger = EtcdClient::connect(&config.registry.endpoints, None).await?;

    let discovery = Discovery::new(etcd_for_discovery, config.registry.namespace.clone());
    let ledger = Ledger::new(etcd_for_ledger, config.registry.namespace.clone());

    let redis_client = redis::Client::open(config.cache.url.clone())?;
    let conn = redis::aio::ConnectionManager::new(redis_client).await?;
    let queue = Queue::new(conn);

    let record_store_config = config
        .record_store
        .as_ref()
        .ok_or("controller config is missing record_store")?;
    let record_store = RecordStore::connect(
        &record_store_config.dsn,
        record_store_config.max_connections.unwrap_or(10),
    )
    .await?;

    let dispatcher = GrpcDispatcher::new(args.integrator_addr.clone());

    let controller = Controller {
        discovery,
        ledger,
        record_store,
        queue,
        plan_ids: IdGenerator::for_plans(1),
        task_ids: IdGenerator::for_tasks(1),
        dispatcher,
        app_name: config.registry.app_name.clone(),
        max_param_bytes: 64 * 1024,
        bindings: Default::default(),
        plans: Default::default(),
    };

    let bind_addr: SocketAddr = args.bind.parse()?;
    info!(%bind_addr, "controller admin API starting");
    AdminApi::new(controller).serve(bind_addr).await?;

    Ok(())
}
