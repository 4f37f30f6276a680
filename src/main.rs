use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use r_dispatch::{
    config::Config,
    container::{ContainerEngine, ContainerRunner, DockerEngine},
    db::Db,
    deployer::{Deployer, GitCli, SystemPortProbe},
    queue::{LibSqlQueue, WorkQueue},
    tasks::{LibSqlTaskStore, TaskStore},
    telemetry::init_tracing,
    worker::{ApiState, Dispatcher, HandlerRegistry, TaskServer},
};
use tokio::sync::Mutex;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    let _log_guard = init_tracing(&config.log);

    let docker = DockerEngine::connect(&config.docker.socket)
        .await
        .context("failed to connect to the container engine")?;
    let engine: Arc<dyn ContainerEngine> = Arc::new(docker);
    engine
        .ensure_network(&config.docker.network)
        .await
        .with_context(|| format!("failed to ensure network {}", config.docker.network))?;

    let db = Db::open_local(&config.database_path)
        .await
        .with_context(|| format!("failed to open database {}", config.database_path.display()))?;
    let queue: Arc<dyn WorkQueue> = Arc::new(LibSqlQueue::new(&db));
    let store: Arc<dyn TaskStore> = Arc::new(LibSqlTaskStore::new(&db));

    let runner = Arc::new(ContainerRunner::new(
        engine.clone(),
        config.docker.stop_grace,
    ));
    let deployer = Arc::new(Deployer::new(
        engine.clone(),
        Arc::new(GitCli),
        Arc::new(SystemPortProbe::new(
            engine.clone(),
            config.deploy.bind_host.clone(),
        )),
        store.clone(),
        config.deploy.clone(),
    ));
    deployer.start_cleanup_timer().await;

    let handlers = HandlerRegistry::standard(
        runner.clone(),
        config.conversion.clone(),
        deployer.clone(),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        queue.clone(),
        store.clone(),
        Arc::new(handlers),
        config.dispatch.clone(),
    ));
    let dispatch_loop = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.run().await }
    });

    let server = TaskServer::new(
        ApiState {
            store,
            queue,
            deployer: deployer.clone(),
            engine,
            sysinfo: Arc::new(Mutex::new(sysinfo::System::new_all())),
            started_at: Instant::now(),
        },
        &config.api_addr,
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
    };
    if let Err(e) = server.start_server(shutdown).await {
        error!(error = %e, "TaskServer failed");
    }

    dispatcher.stop();
    if let Err(e) = dispatch_loop.await {
        error!(error = %e, "Dispatch loop ended abnormally");
    }
    deployer.shutdown().await;
    runner.cleanup_all().await;
    info!("Shutdown complete");

    Ok(())
}
