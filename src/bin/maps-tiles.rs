use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use actix_web::dev::ServerHandle;
use clap::Parser;
use log::{error, info};
use maps_tiles::args::{Args, ConfigSource};
use maps_tiles::cluster::{EtcdStore, NodesMonitor};
use maps_tiles::config::{ConfigStore, EtcdConfig, JsonFileConfig};
use maps_tiles::render::engine::BlankEngine;
use maps_tiles::srv::{new_servers, ServerContext};
use maps_tiles::status::Status;
use maps_tiles::{Executor, TileServerError, TileServerResult};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const ETCD_PORT: u16 = 2379;
const MAINTENANCE_DRAIN: Duration = Duration::from_secs(10);

#[actix_web::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // Help and version requests print and exit cleanly.
            if e.use_stderr() {
                eprintln!("{e}");
                std::process::exit(1);
            }
            let _ = e.print();
            return;
        }
    };

    match run(args).await {
        Ok(()) => {}
        Err(e @ TileServerError::ConfigError(_)) => {
            error!("unable to load config: {e}");
            std::process::exit(-1);
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> TileServerResult<()> {
    info!("Starting maps-tiles v{VERSION}");
    let (host, public_port) = args.host_port()?;
    let internal_port = args.internal_port(public_port);
    let bind_addr = args.bind_addr.clone().unwrap_or_else(|| host.clone());

    let executor = Executor::current();
    let config = Arc::new(ConfigStore::new());
    let mut nodes: Option<Arc<NodesMonitor>> = None;
    let mut etcd_config: Option<Arc<EtcdConfig>> = None;

    match &args.config {
        ConfigSource::Json { path } => {
            info!("Using config file {}", path.display());
            JsonFileConfig::load(path, &config)?;
        }
        ConfigSource::Etcd { host: etcd_host } => {
            info!("Watching config in etcd at {etcd_host}");
            let store: Arc<dyn maps_tiles::cluster::ClusterStore> = Arc::new(
                EtcdStore::new(etcd_host, ETCD_PORT)
                    .map_err(|e| maps_tiles::config::ConfigError::Store(e.to_string()))?,
            );
            let watcher = EtcdConfig::start(Arc::clone(&store), Arc::clone(&config))
                .await
                .map_err(|e| maps_tiles::config::ConfigError::Store(e.to_string()))?;
            etcd_config = Some(watcher);
            let monitor = NodesMonitor::start(&host, internal_port, store);
            monitor.register();
            nodes = Some(monitor);
        }
    }

    if let Some(log_dir) = config
        .get_value("app")
        .and_then(|app| app.get("log_dir").and_then(|v| v.as_str().map(String::from)))
    {
        info!("log directory configured as {log_dir}");
    }

    let ctx = ServerContext::from_config(
        &config,
        Arc::new(BlankEngine),
        executor,
        nodes.clone(),
        &HashMap::new(),
    );

    let (public, internal) = new_servers(ctx.clone(), &bind_addr, public_port, internal_port)?;
    info!("maps-tiles listening on {bind_addr}:{public_port} (internal {internal_port})");

    spawn_sighup_handler(
        ctx.clone(),
        nodes.clone(),
        vec![public.handle(), internal.handle()],
    );

    let (public_result, internal_result) = futures::future::join(public, internal).await;
    if let Some(monitor) = &nodes {
        monitor.unregister().await;
        monitor.shutdown();
    }
    if let Some(watcher) = &etcd_config {
        watcher.shutdown();
    }
    ctx.render_manager.stop();
    public_result?;
    internal_result?;
    Ok(())
}

/// SIGHUP switches the node into maintenance: unregister from the peer
/// directory, drain for ten seconds, then stop both listeners.
fn spawn_sighup_handler(
    ctx: actix_web::web::Data<ServerContext>,
    nodes: Option<Arc<NodesMonitor>>,
    handles: Vec<ServerHandle>,
) {
    tokio::spawn(async move {
        let Ok(mut stream) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        else {
            error!("unable to install SIGHUP handler");
            return;
        };
        while stream.recv().await.is_some() {
            let previous = ctx.status.exchange_status(Status::Maintenance);
            if previous == Status::Maintenance {
                continue;
            }
            info!("switching to maintenance mode");
            if let Some(monitor) = &nodes {
                monitor.unregister().await;
            }
            tokio::time::sleep(MAINTENANCE_DRAIN).await;
            info!("stopping server");
            for handle in &handles {
                handle.stop(true).await;
            }
            return;
        }
    });
}
