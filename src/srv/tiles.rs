//! Per-request controller for the tile pipeline.
//!
//! Each request runs an explicit state machine: cache lookup, peer redirect
//! or local generation under a cache lock, response emission. Generation is
//! detached: when the request deadline fires the client gets a 408, but the
//! generator still finishes and writes its tiles through the cacher so the
//! work is not wasted and queued waiters are released.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use actix_web::http::{Method, StatusCode};
use actix_web::{web, HttpRequest, HttpResponse};
use log::{debug, error};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::cacher::{CacheGetTask, CachedTile, CacherLock, TileCacher, TtlPolicy};
use crate::cluster::PeerEntry;
use crate::config::EndpointKind;
use crate::processor::{MetatileTask, ProcessError, TileRequest};
use crate::srv::proxy::{self, ProxyError};
use crate::srv::router::{self, PathError, RoutedRequest};
use crate::srv::server::{PortRole, ServerContext};
use crate::task::Cancellable as _;
use crate::tile::{MetatileId, TileId};
use crate::util::TileExtension;

const REQUEST_DEADLINE: Duration = Duration::from_secs(20);

pub async fn serve_tile(
    req: HttpRequest,
    ctx: web::Data<ServerContext>,
    role: web::Data<PortRole>,
) -> HttpResponse {
    if req.method() != Method::GET {
        return status_response(StatusCode::METHOD_NOT_ALLOWED);
    }
    let endpoints = ctx.endpoints_snapshot();
    let routed = match router::route(req.path(), &endpoints) {
        Ok(routed) => routed,
        Err(PathError::BadRequest) => return status_response(StatusCode::BAD_REQUEST),
        Err(PathError::NotFound) => return status_response(StatusCode::NOT_FOUND),
    };
    let Some(metatile_id) = metatile_for(&routed) else {
        error!("error while computing metatile id for {}", routed.tile_id);
        return status_response(StatusCode::INTERNAL_SERVER_ERROR);
    };
    let layers = router::layers_from_query(req.query_string(), &routed.endpoint);
    let request = Arc::new(TileRequest {
        tile_id: routed.tile_id,
        metatile_id,
        tags: routed.tags,
        endpoint: routed.endpoint,
        layers,
        data_version: routed.data_version,
        ext: routed.ext,
    });

    let path_and_query = match req.query_string() {
        "" => req.path().to_string(),
        query => format!("{}?{}", req.path(), query),
    };
    let style_version = ctx
        .render_manager
        .style_version(&request.endpoint.style_name);
    let service = TileService {
        request_info: make_request_info(&request, style_version),
        ctx,
        request,
        internal: role.internal,
        path_and_query,
        deadline: Instant::now() + REQUEST_DEADLINE,
    };
    service.run().await
}

fn metatile_for(routed: &RoutedRequest) -> Option<MetatileId> {
    if routed.endpoint.auto_metatile_size {
        let provider = routed.endpoint.data_provider.as_ref()?;
        provider.optimal_metatile_id(&routed.tile_id, routed.endpoint.zoom_offset)
    } else {
        Some(MetatileId::new(
            routed.tile_id,
            routed.endpoint.metatile_width,
            routed.endpoint.metatile_height,
        ))
    }
}

fn status_response(status: StatusCode) -> HttpResponse {
    HttpResponse::build(status).finish()
}

/// Cache-key suffix carrying everything a tile's identity depends on beyond
/// its coordinates: tags, extension, style name and version, data version,
/// metatile dimensions, and the layer filter.
fn make_request_info(request: &TileRequest, style_version: Option<u32>) -> String {
    use std::fmt::Write as _;
    let mut info = String::new();
    for tag in &request.tags {
        info.push_str(tag);
        info.push('/');
    }
    let _ = write!(
        info,
        ".{}/{}/{}/",
        request.ext.as_str(),
        request.endpoint.style_name,
        request.data_version,
    );
    if let Some(version) = style_version {
        let _ = write!(info, "{version}");
    }
    let _ = write!(
        info,
        "/{}/{}/",
        request.metatile_id.width(),
        request.metatile_id.height()
    );
    if let Some(layers) = &request.layers {
        info.push_str("l:");
        for layer in layers {
            info.push_str(layer);
            info.push('/');
        }
    }
    info
}

fn cache_key(tile_id: &TileId, request_info: &str) -> String {
    format!("{}/{}/{}/{request_info}", tile_id.x, tile_id.y, tile_id.z)
}

enum Step {
    CacheLookup,
    PeerDecide,
    Proxy(PeerEntry),
    LockAndGenerate,
    Generate(Option<CacherLock>),
    WaitForCacheOrFail,
    RespondCached(Arc<CachedTile>),
    RespondData(Vec<u8>),
    PassThrough(HttpResponse),
    Reject(StatusCode),
}

struct TileService {
    ctx: web::Data<ServerContext>,
    request: Arc<TileRequest>,
    request_info: String,
    path_and_query: String,
    internal: bool,
    deadline: Instant,
}

impl TileService {
    async fn run(self) -> HttpResponse {
        let cacheable =
            self.ctx.cacher.is_some() && self.request.endpoint.kind != EndpointKind::Static;
        let mut step = if cacheable {
            Step::CacheLookup
        } else {
            Step::Generate(None)
        };
        loop {
            step = match step {
                Step::CacheLookup => self.cache_lookup().await,
                Step::PeerDecide => self.peer_decide(),
                Step::Proxy(peer) => self.proxy(peer).await,
                Step::LockAndGenerate => self.lock_and_generate(),
                Step::Generate(lock) => self.generate(lock).await,
                Step::WaitForCacheOrFail => self.wait_for_cache_or_fail().await,
                Step::RespondCached(tile) => {
                    return self.respond(tile.data.clone(), &tile.headers);
                }
                Step::RespondData(data) => return self.respond(data, &[]),
                Step::PassThrough(response) => return response,
                Step::Reject(status) => return status_response(status),
            };
        }
    }

    fn primary_cache_key(&self) -> String {
        cache_key(&self.request.tile_id, &self.request_info)
    }

    /// The keys a generator reserves: every tile of the metatile for render
    /// endpoints (so requests for sibling tiles rendezvous on one render),
    /// just the requested tile otherwise.
    fn lock_keys(&self) -> Vec<String> {
        if self.request.endpoint.kind == EndpointKind::Render {
            self.request
                .metatile_id
                .tile_ids()
                .iter()
                .map(|id| cache_key(id, &self.request_info))
                .collect()
        } else {
            vec![self.primary_cache_key()]
        }
    }

    async fn cache_lookup(&self) -> Step {
        let Some(cacher) = &self.ctx.cacher else {
            return Step::Generate(None);
        };
        let key = self.primary_cache_key();
        let (rx, task) = dispatch_cache_get(cacher, &key);
        match tokio::time::timeout_at(self.deadline, rx).await {
            Ok(Ok(Ok(Some(tile)))) => {
                cacher.touch(&key, tile.policy.expire());
                Step::RespondCached(tile)
            }
            Ok(Ok(Ok(None))) => {
                if !self.internal && self.ctx.nodes.is_some() {
                    Step::PeerDecide
                } else {
                    Step::LockAndGenerate
                }
            }
            // Cache unavailable: generate without writing through.
            Ok(Ok(Err(()))) | Ok(Err(_)) => Step::Generate(None),
            Err(_) => {
                task.cancel();
                Step::Reject(StatusCode::REQUEST_TIMEOUT)
            }
        }
    }

    fn peer_decide(&self) -> Step {
        let Some(nodes) = &self.ctx.nodes else {
            return Step::LockAndGenerate;
        };
        match nodes.pick_node(&self.request.metatile_id) {
            Some(peer) if !peer.is_self => Step::Proxy(peer),
            _ => Step::LockAndGenerate,
        }
    }

    async fn proxy(&self, peer: PeerEntry) -> Step {
        let Some(client) = &self.ctx.proxy_client else {
            return Step::LockAndGenerate;
        };
        debug!(
            "proxying {} for metatile {} to {}",
            self.path_and_query, self.request.metatile_id, peer.addr_str
        );
        let forwarded = tokio::time::timeout_at(
            self.deadline,
            proxy::forward(client, &peer, &self.path_and_query, self.deadline),
        )
        .await;
        match forwarded {
            Ok(Ok(response)) => Step::PassThrough(response),
            Ok(Err(ProxyError::Connect)) => Step::LockAndGenerate,
            Ok(Err(ProxyError::Protocol)) => Step::Reject(StatusCode::INTERNAL_SERVER_ERROR),
            Err(_) => Step::Reject(StatusCode::REQUEST_TIMEOUT),
        }
    }

    fn lock_and_generate(&self) -> Step {
        let Some(cacher) = &self.ctx.cacher else {
            return Step::Generate(None);
        };
        match cacher.lock_until_set(self.lock_keys()) {
            Some(lock) => Step::Generate(Some(lock)),
            None => Step::WaitForCacheOrFail,
        }
    }

    /// Another writer holds the lock; queue behind it and serve its result.
    async fn wait_for_cache_or_fail(&self) -> Step {
        let Some(cacher) = &self.ctx.cacher else {
            return Step::Generate(None);
        };
        let key = self.primary_cache_key();
        let (rx, task) = dispatch_cache_get(cacher, &key);
        match tokio::time::timeout_at(self.deadline, rx).await {
            Ok(Ok(Ok(Some(tile)))) => Step::RespondCached(tile),
            Ok(Ok(Ok(None))) => Step::Reject(StatusCode::INTERNAL_SERVER_ERROR),
            // The writer released without setting; do the work ourselves but
            // leave caching to whoever holds a lock.
            Ok(Ok(Err(()))) | Ok(Err(_)) => Step::Generate(None),
            Err(_) => {
                task.cancel();
                Step::Reject(StatusCode::REQUEST_TIMEOUT)
            }
        }
    }

    async fn generate(&self, lock: Option<CacherLock>) -> Step {
        let (tx, rx) = oneshot::channel::<Result<Vec<u8>, ProcessError>>();
        let sender = Arc::new(Mutex::new(Some(tx)));
        let shared_lock = Arc::new(Mutex::new(lock));

        let ctx = self.ctx.clone();
        let request_info = self.request_info.clone();
        let tile_id = self.request.tile_id;
        let metatile_id = self.request.metatile_id;
        let success_sender = Arc::clone(&sender);
        let success_lock = Arc::clone(&shared_lock);
        let error_sender = sender;
        let error_lock = shared_lock;

        let task = Arc::new(MetatileTask::with_executor(
            self.ctx.executor.clone(),
            move |metatile| {
                let write_through = {
                    let mut lock = success_lock.lock().unwrap_or_else(PoisonError::into_inner);
                    match lock.as_mut() {
                        Some(lock) => {
                            // The cache writes below satisfy the waiters;
                            // cancel so the drop doesn't error them.
                            lock.cancel();
                            true
                        }
                        None => false,
                    }
                };
                let mut response_data = None;
                for tile in &metatile.tiles {
                    if write_through {
                        if let Some(cacher) = &ctx.cacher {
                            let cached = Arc::new(CachedTile {
                                data: tile.data.clone(),
                                headers: Vec::new(),
                                policy: TtlPolicy::Regular,
                            });
                            cacher.set(
                                &cache_key(&tile.id, &request_info),
                                cached,
                                TtlPolicy::Regular.expire(),
                                None,
                            );
                        }
                    }
                    if tile.id == tile_id {
                        response_data = Some(tile.data.clone());
                    }
                }
                let result = match response_data {
                    Some(data) => Ok(data),
                    None => {
                        error!("requested tile {tile_id} not found in generated metatile {metatile_id}");
                        Err(ProcessError::Internal)
                    }
                };
                if let Some(tx) = success_sender
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                {
                    let _ = tx.send(result);
                }
            },
            move |e| {
                // Dropping the lock releases the reserved keys and errors the
                // queued waiters so they fall back to their own generation.
                error_lock
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(tx) = error_sender
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                {
                    let _ = tx.send(Err(e));
                }
            },
        ));
        // The generator is detached on purpose: a request timing out below
        // must not cancel the render, which still writes through the cache.
        let _handle = self.ctx.processor.process(Arc::clone(&self.request), task);

        match tokio::time::timeout_at(self.deadline, rx).await {
            Ok(Ok(Ok(data))) => Step::RespondData(data),
            Ok(Ok(Err(ProcessError::NotFound))) => Step::Reject(StatusCode::NOT_FOUND),
            Ok(Ok(Err(_))) => Step::Reject(StatusCode::INTERNAL_SERVER_ERROR),
            Ok(Err(_)) => Step::Reject(StatusCode::INTERNAL_SERVER_ERROR),
            Err(_) => Step::Reject(StatusCode::REQUEST_TIMEOUT),
        }
    }

    fn respond(&self, data: Vec<u8>, headers: &[(String, String)]) -> HttpResponse {
        let mut builder = HttpResponse::Ok();
        builder.insert_header(("Content-Type", self.request.ext.content_type()));
        builder.insert_header(("Pragma", "public"));
        builder.insert_header(("Cache-Control", "max-age=86400"));
        builder.insert_header(("access-control-allow-origin", "*"));
        if self.request.ext == TileExtension::Mvt && crate::util::is_gzip(&data) {
            builder.insert_header(("Content-Encoding", "deflate, gzip"));
        }
        for (name, value) in headers {
            builder.insert_header((name.as_str(), value.as_str()));
        }
        builder.body(data)
    }
}

/// Bridges a cacher get onto a oneshot the state machine can await with its
/// deadline; the returned task handle supports cancellation on expiry.
fn dispatch_cache_get(
    cacher: &Arc<TileCacher>,
    key: &str,
) -> (
    oneshot::Receiver<Result<Option<Arc<CachedTile>>, ()>>,
    Arc<CacheGetTask>,
) {
    let (tx, rx) = oneshot::channel();
    let sender = Arc::new(Mutex::new(Some(tx)));
    let ok_sender = Arc::clone(&sender);
    let task = Arc::new(CacheGetTask::new(
        move |tile| {
            if let Some(tx) = ok_sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                let _ = tx.send(Ok(tile));
            }
        },
        move |()| {
            if let Some(tx) = sender
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                let _ = tx.send(Err(()));
            }
        },
    ));
    cacher.get(key, Arc::clone(&task));
    (rx, task)
}
