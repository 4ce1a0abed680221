//! Server wiring: shared request context, the two listeners, and `/mon`.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use actix_web::dev::Server;
use actix_web::middleware::Logger;
use actix_web::web::Data;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use log::{info, warn};
use serde_json::Value;

use crate::cacher::{MemoryBackend, TileCacher};
use crate::cluster::NodesMonitor;
use crate::config::{parse_endpoints, ConfigObserver, ConfigStore, EndpointsMap};
use crate::loader::KvStore;
use crate::processor::TileProcessor;
use crate::provider::DataManager;
use crate::render::engine::SharedEngine;
use crate::render::{RenderManager, RenderManagerConfig};
use crate::srv::tiles::serve_tile;
use crate::status::StatusMonitor;
use crate::task::Executor;
use crate::{TileServerError, TileServerResult};

const DEFAULT_CACHE_CAPACITY: u64 = 512 * 1024 * 1024;

/// Marks which listener a request arrived on; internal-port requests are
/// peer-originated and always generate locally.
pub struct PortRole {
    pub internal: bool,
}

pub struct ServerContext {
    endpoints: RwLock<Arc<EndpointsMap>>,
    pub render_manager: RenderManager,
    pub processor: TileProcessor,
    pub data_manager: Arc<DataManager>,
    pub cacher: Option<Arc<TileCacher>>,
    pub nodes: Option<Arc<NodesMonitor>>,
    pub status: Arc<StatusMonitor>,
    pub executor: Executor,
    pub proxy_client: Option<reqwest::Client>,
}

impl ServerContext {
    /// Builds the full pipeline from the config store. Blocks until the
    /// render workers compiled their styles.
    pub fn from_config(
        config: &ConfigStore,
        engine: SharedEngine,
        executor: Executor,
        nodes: Option<Arc<NodesMonitor>>,
        kv_stores: &HashMap<String, Arc<dyn KvStore>>,
    ) -> Data<Self> {
        let render_manager = RenderManager::new(
            engine,
            RenderManagerConfig::from_config(config),
            executor.clone(),
        );
        render_manager.observe(config);

        let data_config = config.get_value("data");
        let data_manager = Arc::new(DataManager::new(
            data_config.as_deref(),
            kv_stores,
            &executor,
        ));

        let endpoints = config
            .get_value("server")
            .and_then(|server| {
                server
                    .get("endpoints")
                    .and_then(|endpoints| parse_endpoints(endpoints, &data_manager))
            })
            .unwrap_or_default();
        if endpoints.is_empty() {
            warn!("no endpoints provided");
        }

        let cacher = config.get_value("cacher").map(|cacher_config| {
            let conn_str = cacher_config
                .get("conn_str")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let backend: Arc<dyn crate::cacher::CacheBackend> = match conn_str
                .strip_prefix("file://")
            {
                Some(root) if !root.is_empty() => {
                    info!("using disk cache backend at {root}");
                    Arc::new(crate::cacher::DiskBackend::new(root))
                }
                _ => {
                    info!("using in-memory cache backend");
                    Arc::new(MemoryBackend::new(DEFAULT_CACHE_CAPACITY))
                }
            };
            TileCacher::new(backend, executor.clone())
        });
        if cacher.is_none() {
            info!("starting without cacher");
        }

        let proxy_client = nodes
            .as_ref()
            .and_then(|_| crate::srv::proxy::make_client());

        render_manager.wait_for_init();

        let ctx = Data::new(Self {
            endpoints: RwLock::new(Arc::new(endpoints)),
            processor: TileProcessor::new(render_manager.clone()),
            render_manager,
            data_manager,
            cacher,
            nodes,
            status: Arc::new(StatusMonitor::new()),
            executor,
            proxy_client,
        });

        // Endpoint updates re-parse the map and swap the snapshot.
        struct ServerUpdateObserver(Data<ServerContext>);
        impl ConfigObserver for ServerUpdateObserver {
            fn on_update(&self, value: Arc<Value>) {
                let Some(endpoints) = value
                    .get("endpoints")
                    .and_then(|e| parse_endpoints(e, &self.0.data_manager))
                else {
                    warn!("ignoring endpoints update with invalid shape");
                    return;
                };
                self.0.set_endpoints(endpoints);
            }
        }
        config.attach("server", Arc::new(ServerUpdateObserver(ctx.clone())));

        ctx
    }

    pub fn endpoints_snapshot(&self) -> Arc<EndpointsMap> {
        Arc::clone(
            &self
                .endpoints
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    pub fn set_endpoints(&self, endpoints: EndpointsMap) {
        *self
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(endpoints);
    }
}

/// Plain-text service status for load balancers and peers.
async fn get_mon(ctx: Data<ServerContext>) -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain")
        .body(ctx.status.status().as_str())
}

pub fn router(cfg: &mut web::ServiceConfig) {
    cfg.route("/mon", web::get().to(get_mon))
        .default_service(web::to(serve_tile));
}

/// Binds the public and internal listeners over one shared context.
pub fn new_servers(
    ctx: Data<ServerContext>,
    bind_addr: &str,
    public_port: u16,
    internal_port: u16,
) -> TileServerResult<(Server, Server)> {
    let public = bind_listener(ctx.clone(), bind_addr, public_port, false)?;
    let internal = bind_listener(ctx, bind_addr, internal_port, true)?;
    Ok((public, internal))
}

fn bind_listener(
    ctx: Data<ServerContext>,
    bind_addr: &str,
    port: u16,
    internal: bool,
) -> TileServerResult<Server> {
    let addr = format!("{bind_addr}:{port}");
    let server = HttpServer::new(move || {
        App::new()
            .app_data(ctx.clone())
            .app_data(Data::new(PortRole { internal }))
            .wrap(Logger::default())
            .configure(router)
    })
    .bind(&addr)
    .map_err(|e| TileServerError::BindingError(e, addr))?
    .shutdown_timeout(0)
    .run();
    Ok(server)
}
