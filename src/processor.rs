//! Orchestration of one metatile's production: load the base tile through
//! the data provider, then render or subtile it on the worker pool.

use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error};

use crate::config::{EndpointKind, EndpointParams};
use crate::loader::{LoadError, LoadTask};
use crate::render::{
    RenderError, RenderKind, RenderManager, RenderRequest, RenderTask, SubtileRequest,
};
use crate::task::{AsyncTask, Cancellable};
use crate::tile::{Metatile, Tile};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessError {
    NotFound,
    Internal,
    Rendering,
}

pub type MetatileTask = AsyncTask<Metatile, ProcessError>;

/// Immutable description of one resolved tile request, shared between the
/// state machine and its spawned sub-tasks.
#[derive(Debug)]
pub struct TileRequest {
    pub tile_id: crate::tile::TileId,
    pub metatile_id: crate::tile::MetatileId,
    pub tags: std::collections::BTreeSet<String>,
    pub endpoint: Arc<EndpointParams>,
    pub layers: Option<std::collections::BTreeSet<String>>,
    pub data_version: String,
    pub ext: crate::util::TileExtension,
}

impl TileRequest {
    pub fn is_retina(&self) -> bool {
        self.tags.contains("retina")
    }
}

/// Cancellation handle onto the processor's current sub-task.
#[derive(Clone)]
pub struct ProcessorHandle {
    pending: Arc<Mutex<Option<Arc<dyn Cancellable>>>>,
}

impl ProcessorHandle {
    fn set(&self, work: Arc<dyn Cancellable>) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(work);
    }

    fn clear(&self) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Cancellable for ProcessorHandle {
    fn cancel(&self) -> bool {
        let work = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        work.map(|work| work.cancel()).unwrap_or(false)
    }
}

pub struct TileProcessor {
    render_manager: RenderManager,
}

impl TileProcessor {
    pub fn new(render_manager: RenderManager) -> Self {
        Self { render_manager }
    }

    /// Starts producing the request's metatile; `task` fires on completion.
    /// The returned handle cancels whatever sub-task is currently in flight.
    pub fn process(&self, request: Arc<TileRequest>, task: Arc<MetatileTask>) -> ProcessorHandle {
        debug!(
            "starting processing of metatile {} style {}",
            request.metatile_id, request.endpoint.style_name
        );
        let handle = ProcessorHandle {
            pending: Arc::new(Mutex::new(None)),
        };
        if request.endpoint.data_provider.is_some() {
            self.load_tile(request, task, &handle);
        } else {
            match request.endpoint.kind {
                EndpointKind::Render => {
                    self.process_render(request, None, task, &handle);
                }
                EndpointKind::Mvt | EndpointKind::Static => {
                    // Static and subtile endpoints cannot exist without a
                    // data provider; configuration rejects them earlier.
                    error!(
                        "endpoint without data provider cannot serve {}",
                        request.metatile_id
                    );
                    task.complete_error(ProcessError::Internal);
                }
            }
        }
        handle
    }

    fn load_tile(&self, request: Arc<TileRequest>, task: Arc<MetatileTask>, handle: &ProcessorHandle) {
        let Some(provider) = request.endpoint.data_provider.clone() else {
            task.complete_error(ProcessError::Internal);
            return;
        };
        if !provider.has_version(&request.data_version) {
            task.complete_error(ProcessError::NotFound);
            return;
        }

        let manager = self.render_manager.clone();
        let success_handle = handle.clone();
        let success_request = Arc::clone(&request);
        let success_task = Arc::clone(&task);
        let error_request = Arc::clone(&request);
        let error_task = Arc::clone(&task);
        let load_task = Arc::new(LoadTask::new(
            move |tile: Tile| {
                success_handle.clear();
                on_tile_loaded(manager, success_request, success_task, &success_handle, tile);
            },
            move |e| {
                debug!(
                    "error while loading data for metatile {} style {}",
                    error_request.metatile_id, error_request.endpoint.style_name
                );
                error_task.complete_error(match e {
                    LoadError::NotFound => ProcessError::NotFound,
                    LoadError::Internal => ProcessError::Internal,
                });
            },
        ));
        handle.set(load_task.clone());
        provider.get_tile(
            load_task,
            request.tile_id,
            request.endpoint.zoom_offset,
            &request.data_version,
        );
    }

    fn process_render(
        &self,
        request: Arc<TileRequest>,
        data_tile: Option<Arc<Tile>>,
        task: Arc<MetatileTask>,
        handle: &ProcessorHandle,
    ) {
        let render_task = dispatch_render(self.render_manager.clone(), request, data_tile, task);
        handle.set(render_task);
    }
}

fn on_tile_loaded(
    manager: RenderManager,
    request: Arc<TileRequest>,
    task: Arc<MetatileTask>,
    handle: &ProcessorHandle,
    tile: Tile,
) {
    debug!("loaded data tile {}", tile.id);
    match request.endpoint.kind {
        EndpointKind::Static => {
            // The loaded tile becomes the metatile's only member.
            let mut metatile = Metatile::new(request.metatile_id);
            if metatile.tiles.len() != 1 || metatile.tiles[0].id != tile.id {
                error!(
                    "static endpoint produced tile {} outside metatile {}",
                    tile.id, request.metatile_id
                );
                task.complete_error(ProcessError::Internal);
                return;
            }
            metatile.tiles[0].data = tile.data;
            task.complete_success(metatile);
        }
        EndpointKind::Render => {
            let render_task = dispatch_render(manager, request, Some(Arc::new(tile)), task);
            handle.set(render_task);
        }
        EndpointKind::Mvt => {
            let subtile_task = dispatch_subtile(manager, request, tile, task);
            handle.set(subtile_task);
        }
    }
}

fn dispatch_render(
    manager: RenderManager,
    request: Arc<TileRequest>,
    data_tile: Option<Arc<Tile>>,
    task: Arc<MetatileTask>,
) -> Arc<RenderTask> {
    let render_request = RenderRequest {
        metatile_id: request.metatile_id,
        style_name: request.endpoint.style_name.clone(),
        utfgrid_key: request.endpoint.utfgrid_key.clone(),
        data_tile,
        layers: request.layers.clone(),
        kind: if request.ext == crate::util::TileExtension::Json
            || request.ext == crate::util::TileExtension::Html
        {
            RenderKind::Utfgrid
        } else {
            RenderKind::Png
        },
        retina: request.is_retina(),
    };
    let success_task = Arc::clone(&task);
    let error_request = Arc::clone(&request);
    manager.render(
        render_request,
        move |metatile| success_task.complete_success(metatile),
        move |e| {
            error!(
                "error while processing metatile {} style {}",
                error_request.metatile_id, error_request.endpoint.style_name
            );
            task.complete_error(map_render_error(e));
        },
    )
}

fn dispatch_subtile(
    manager: RenderManager,
    request: Arc<TileRequest>,
    tile: Tile,
    task: Arc<MetatileTask>,
) -> Arc<RenderTask> {
    let subtile_request = SubtileRequest {
        mvt_tile: tile,
        tile_id: request.tile_id,
        filter_table: request.endpoint.filter_table.clone(),
        layers: request.layers.clone(),
    };
    let success_task = Arc::clone(&task);
    let error_request = Arc::clone(&request);
    manager.make_subtile(
        subtile_request,
        move |metatile| success_task.complete_success(metatile),
        move |e| {
            error!(
                "error while subtiling {} style {}",
                error_request.metatile_id, error_request.endpoint.style_name
            );
            task.complete_error(map_render_error(e));
        },
    )
}

fn map_render_error(e: RenderError) -> ProcessError {
    match e {
        RenderError::Rendering => ProcessError::Rendering,
        RenderError::UnknownStyle | RenderError::InvalidTile => ProcessError::Internal,
    }
}
