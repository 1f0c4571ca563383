//! Integrator entrypoint: registers with the registry so the controller
//! can address it, then serves the `Integrator` gRPC service tasks land
//! on once a plan is admitted (§4.3).
//!
//! Bootstrap shape grounded on the teacher's `main.rs`: parse flags, start
//! the `/metrics` server as a background task, then run the real service
//! to completion on the current Tokio runtime.

use std::net::SocketAddr;

use clap::Parser;
use etcd_client::Client as EtcdClient;
use peckmesh::analytics::AnalyticsStore;
use peckmesh::config::ServerConfig;
use peckmesh::model::ServiceInstance;
use peckmesh::queue::Queue;
use peckmesh::record_store::RecordStore;
use peckmesh::registry::Registrar;
use peckmesh::rpc::integrator_server::IntegratorServer;
use peckmesh::rpc::IntegratorService;
use tonic::transport::Server;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "integrator", about = "peckmesh aggregation/analytics service")]
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
        .ok_or("integrator config is missing the node identity block")?;

    let etcd_for_registry = EtcdClient::connect(&config.registry.endpoints, None).await?;
    let instance = ServiceInstance {
        name: config.registry.app_name.clone(),
        address: node.addr.clone(),
        metadata: Default::default(),
    };
    let registrar = Registrar::register(etcd_for_registry, &config.registry, instance).await?;
    registrar.spawn_keepalive();

    let redis_client = redis::Client::open(config.cache.url.clone())?;
    let conn = redis::aio::ConnectionManager::new(redis_client).await?;
    let queue = Queue::new(conn);

    let analytics_config = config
        .analytics
        .as_ref()
        .ok_or("integrator config is missing analytics")?;
    let analytics = AnalyticsStore::connect(analytics_config);

    let record_store_config = config
        .record_store
        .as_ref()
        .ok_or("integrator config is missing record_store")?;
    let record_store = RecordStore::connect(
        &record_store_config.dsn,
        record_store_config.max_connections.unwrap_or(10),
    )
    .await?;

    let bind_addr: SocketAddr = node.addr.parse()?;
    let service = IntegratorService::new(queue, analytics, record_store);

    info!(%bind_addr, "integrator starting");
    Server::builder()
        .add_service(IntegratorServer::new(service))
        .serve(bind_addr)
        .await?;

    Ok(())
}
