//! Worker entrypoint: registers this node with the registry, then serves
//! the `Pecker` gRPC service workers receive `Peck`/`Stop` calls on (§4.2).
//!
//! Bootstrap shape grounded on the teacher's `main.rs`: parse flags, start
//! the `/metrics` server as a background task, then run the real service
//! to completion on the current Tokio runtime.

use std::net::SocketAddr;

use clap::Parser;
use etcd_client::Client as EtcdClient;
use peckmesh::config::ServerConfig;
use peckmesh::ledger::Ledger;
use peckmesh::model::ServiceInstance;
use peckmesh::queue::Queue;
use peckmesh::registry::Registrar;
use peckmesh::rpc::pecker_server::PeckerServer;
use peckmesh::rpc::PeckerService;
use tonic::transport::Server;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "worker", about = "peckmesh HTTP load-generation worker")]
struct Args {
    /// Path to the shared YAML config file.
    #[arg(short = 'f', long = "config")]
    config: String,
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

    let node = config
        .node
        .clone()
        .ok_or("worker config is missing the node identity block")?;

    let etcd_for_registry = EtcdClient::connect(&config.registry.endpoints, None).await?;
    let etcd_for_ledger = EtcdClient::connect(&config.registry.endpoints, None).await?;
    let ledger = Ledger::new(etcd_for_ledger, config.registry.namespace.clone());

    let instance = ServiceInstance {
        name: config.registry.app_name.clone(),
        address: node.addr.clone(),
        metadata: [
            ("max_rps_num".to_string(), node.max_rps_num.to_string()),
            (
                "max_concurrency_num".to_string(),
                node.max_concurrency_num.to_string(),
            ),
        ]
        .into_iter()
        .collect(),
    };
    let registrar = Registrar::register(etcd_for_registry, &config.registry, instance).await?;
    registrar.spawn_keepalive();

    let redis_client = redis::Client::open(config.cache.url.clone())?;
    let conn = redis::aio::ConnectionManager::new(redis_client).await?;
    let queue = Queue::new(conn);

    let bind_addr: SocketAddr = node.addr.parse()?;
    let service = PeckerService::new(queue, ledger, config.worker.clone());

    info!(%bind_addr, "worker starting");
    Server::builder()
        .add_service(PeckerServer::new(service))
        .serve(bind_addr)
        .await?;

    Ok(())
}
