use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::error;

use crate::mvt::{CachingFeatureset, LayerFeatureset};
use crate::pool::{Worker, WorkerError};
use crate::render::engine::{CompiledMap, RenderJob, SharedEngine};
use crate::render::style::StyleInfo;
use crate::render::subtiler::Subtiler;
use crate::render::utfgrid::encode_utfgrid;
use crate::render::{RenderError, RenderKind, RenderRequest, RenderWorkItem, SubtileRequest, WorkRequest};
use crate::tile::{Metatile, MetatileId, TILE_SIZE};

const RENDER_BUFFER: f64 = 128.0;
const SUBTILE_EXTENT: u32 = 4096;
const SUBTILE_BUFFER: i64 = 256;
const UTFGRID_RESOLUTION: u32 = 4;

struct MapSlot {
    map: Box<dyn CompiledMap>,
    version: u32,
    allow_grid_render: bool,
}

enum StagedSlot {
    /// The live map already has the right version and moves over on commit.
    Reuse,
    Fresh(MapSlot),
}

/// One render worker; owns its compiled map set exclusively on its thread.
pub struct RenderWorker {
    engine: SharedEngine,
    initial_styles: Arc<Vec<StyleInfo>>,
    maps: HashMap<String, MapSlot>,
    staged: HashMap<String, StagedSlot>,
    pending_token: Option<u64>,
}

impl RenderWorker {
    pub fn new(engine: SharedEngine, initial_styles: Arc<Vec<StyleInfo>>) -> Self {
        Self {
            engine,
            initial_styles,
            maps: HashMap::new(),
            staged: HashMap::new(),
            pending_token: None,
        }
    }

    fn load_style(&self, style: &StyleInfo) -> Option<MapSlot> {
        match self.engine.compile(style) {
            Ok(map) => Some(MapSlot {
                map,
                version: style.version,
                allow_grid_render: style.allow_grid_render,
            }),
            Err(e) => {
                error!("error while loading style {}: {e}", style.name);
                None
            }
        }
    }

    /// Stages the new style set. Compiled maps whose version is unchanged are
    /// reused; everything else is loaded fresh. Returns false when any load
    /// fails, leaving the live set untouched.
    pub fn update_styles(&mut self, styles: &[StyleInfo], token: u64) -> bool {
        self.staged.clear();
        self.pending_token = Some(token);
        for style in styles {
            if let Some(slot) = self.maps.get(&style.name) {
                if slot.version == style.version {
                    self.staged.insert(style.name.clone(), StagedSlot::Reuse);
                    continue;
                }
            }
            match self.load_style(style) {
                Some(slot) => {
                    self.staged.insert(style.name.clone(), StagedSlot::Fresh(slot));
                }
                None => return false,
            }
        }
        true
    }

    /// Replaces the live map set with the staged one.
    pub fn commit_update(&mut self, token: u64) -> bool {
        if self.pending_token != Some(token) {
            return false;
        }
        let staged = std::mem::take(&mut self.staged);
        let mut old_maps = std::mem::take(&mut self.maps);
        for (name, slot) in staged {
            match slot {
                StagedSlot::Reuse => {
                    if let Some(live) = old_maps.remove(&name) {
                        self.maps.insert(name, live);
                    }
                }
                StagedSlot::Fresh(slot) => {
                    self.maps.insert(name, slot);
                }
            }
        }
        self.pending_token = None;
        true
    }

    /// Drops the staged set without touching the live one.
    pub fn cancel_update(&mut self, token: u64) -> bool {
        if self.pending_token != Some(token) {
            return false;
        }
        self.staged.clear();
        self.pending_token = None;
        true
    }

    fn process_render(&mut self, task: &crate::render::RenderTask, request: RenderRequest) {
        if task.is_cancelled() {
            return;
        }
        let Some(slot) = self.maps.get_mut(&request.style_name) else {
            error!("style \"{}\" not found", request.style_name);
            task.complete_error(RenderError::UnknownStyle);
            return;
        };
        if request.kind == RenderKind::Utfgrid && !slot.allow_grid_render {
            error!("style \"{}\" does not allow grid rendering", request.style_name);
            task.complete_error(RenderError::Rendering);
            return;
        }

        let metatile_id = request.metatile_id;
        let scale = if request.retina { 2u32 } else { 1u32 };
        let job = RenderJob {
            extent: metatile_id.bbox(),
            buffer: RENDER_BUFFER,
            width: TILE_SIZE * metatile_id.width() * scale,
            height: TILE_SIZE * metatile_id.height() * scale,
            scale: f64::from(scale),
            utfgrid_key: request.utfgrid_key.clone(),
        };

        let map = slot.map.as_mut();
        activate_layers(map, &request);
        bind_mvt_layers(map, &request);

        if task.is_cancelled() {
            map.clear_bound_features();
            return;
        }

        let result = match request.kind {
            RenderKind::Png => map
                .render(&job)
                .and_then(|image| split_image(&image, metatile_id)),
            RenderKind::Utfgrid => map.render_grid(&job).and_then(|grid| {
                let mut metatile = Metatile::new(metatile_id);
                let tile_w = grid.width / metatile_id.width();
                let tile_h = grid.height / metatile_id.height();
                for (i, tile) in metatile.tiles.iter_mut().enumerate() {
                    let col = i as u32 % metatile_id.width();
                    let row = i as u32 / metatile_id.width();
                    let view = grid.crop(col * tile_w, row * tile_h, tile_w, tile_h);
                    tile.data = encode_utfgrid(&view, UTFGRID_RESOLUTION).into_bytes();
                }
                Ok(metatile)
            }),
        };
        map.clear_bound_features();

        match result {
            Ok(metatile) => task.complete_success(metatile),
            Err(e) => {
                error!("render error for {metatile_id}: {e}");
                task.complete_error(RenderError::Rendering);
            }
        }
    }

    fn process_subtile(&mut self, task: &crate::render::RenderTask, request: SubtileRequest) {
        let tile_id = request.tile_id;
        let subtiler = Subtiler::new(request.mvt_tile, request.filter_table);
        match subtiler.make_subtile(
            tile_id,
            SUBTILE_EXTENT,
            SUBTILE_BUFFER,
            request.layers.as_ref(),
        ) {
            Ok(data) => {
                let mut metatile = Metatile::new(MetatileId::square(tile_id, 1));
                metatile.tiles[0].data = data;
                task.complete_success(metatile);
            }
            Err(e) => {
                error!("mvt subtiling error for {tile_id}: {e}");
                task.complete_error(RenderError::Rendering);
            }
        }
    }
}

fn activate_layers(map: &mut dyn CompiledMap, request: &RenderRequest) {
    let unbound: HashSet<String> = map.unbound_layers().into_iter().collect();
    for name in map.layer_names() {
        if unbound.contains(&name) {
            continue;
        }
        let active = request
            .layers
            .as_ref()
            .map(|requested| requested.contains(&name))
            .unwrap_or(true);
        map.set_layer_active(&name, active);
    }
}

/// Binds the decoded source-tile layers to the map's datasource-less layers;
/// layers that remain without data are deactivated.
fn bind_mvt_layers(map: &mut dyn CompiledMap, request: &RenderRequest) {
    let unbound = map.unbound_layers();
    if unbound.is_empty() {
        return;
    }
    let mut decoded: HashMap<String, crate::mvt::CachingFeatureset> = HashMap::new();
    if let Some(data_tile) = &request.data_tile {
        match crate::mvt::decode_tile(&data_tile.data) {
            Ok(tile) => {
                for layer in tile.layers {
                    if let Some(requested) = &request.layers {
                        if !requested.contains(&layer.name) {
                            continue;
                        }
                    }
                    let name = layer.name.clone();
                    let featureset =
                        CachingFeatureset::new(Box::new(LayerFeatureset::new(layer)));
                    decoded.insert(name, featureset);
                }
            }
            Err(e) => error!("failed to decode source tile {}: {e}", data_tile.id),
        }
    }
    for name in unbound {
        match decoded.remove(&name) {
            Some(featureset) => {
                map.bind_layer_features(&name, Box::new(featureset));
                map.set_layer_active(&name, true);
            }
            None => map.set_layer_active(&name, false),
        }
    }
}

fn split_image(
    image: &crate::render::engine::RasterImage,
    metatile_id: MetatileId,
) -> Result<Metatile, crate::render::engine::EngineError> {
    let mut metatile = Metatile::new(metatile_id);
    let tile_w = image.width / metatile_id.width();
    let tile_h = image.height / metatile_id.height();
    for (i, tile) in metatile.tiles.iter_mut().enumerate() {
        let col = i as u32 % metatile_id.width();
        let row = i as u32 / metatile_id.width();
        let view = image.crop(col * tile_w, row * tile_h, tile_w, tile_h);
        tile.data = view.to_png()?;
    }
    Ok(metatile)
}

impl Worker for RenderWorker {
    type Task = RenderWorkItem;

    fn init(&mut self) -> Result<(), WorkerError> {
        let styles = Arc::clone(&self.initial_styles);
        for style in styles.iter() {
            let Some(slot) = self.load_style(style) else {
                return Err(WorkerError(format!("failed to load style '{}'", style.name)));
            };
            self.maps.insert(style.name.clone(), slot);
        }
        Ok(())
    }

    fn process(&mut self, item: RenderWorkItem) {
        if item.task.is_cancelled() {
            return;
        }
        match item.request {
            WorkRequest::Render(request) => self.process_render(&item.task, request),
            WorkRequest::Subtile(request) => self.process_subtile(&item.task, request),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::render::engine::BlankEngine;
    use crate::render::RenderTask;
    use crate::tile::TileId;

    fn style(name: &str, version: u32) -> StyleInfo {
        StyleInfo {
            name: name.to_string(),
            path: Some(format!("builtin://{name}")),
            version,
            ..Default::default()
        }
    }

    fn worker_with_style(name: &str, version: u32) -> RenderWorker {
        let mut worker = RenderWorker::new(
            Arc::new(BlankEngine),
            Arc::new(vec![style(name, version)]),
        );
        worker.init().unwrap();
        worker
    }

    #[test]
    fn render_produces_row_major_png_metatile() {
        let mut worker = worker_with_style("osm", 1);
        let (tx, rx) = mpsc::channel();
        let err_tx = tx.clone();
        let task = Arc::new(RenderTask::new(
            move |metatile| {
                let _ = tx.send(Ok(metatile));
            },
            move |e| {
                let _ = err_tx.send(Err(e));
            },
        ));
        worker.process(RenderWorkItem {
            task,
            request: WorkRequest::Render(RenderRequest {
                metatile_id: MetatileId::square(TileId::new(0, 0, 1), 2),
                style_name: "osm".to_string(),
                ..Default::default()
            }),
        });
        let metatile = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(metatile.validate());
        assert_eq!(metatile.tiles.len(), 4);
        for tile in &metatile.tiles {
            assert!(tile.data.starts_with(b"\x89PNG"));
        }
    }

    #[test]
    fn unknown_style_fails_the_task() {
        let mut worker = worker_with_style("osm", 1);
        let (tx, rx) = mpsc::channel();
        let task = Arc::new(RenderTask::new(
            |_| panic!("must not succeed"),
            move |e| {
                let _ = tx.send(e);
            },
        ));
        worker.process(RenderWorkItem {
            task,
            request: WorkRequest::Render(RenderRequest {
                metatile_id: MetatileId::square(TileId::new(0, 0, 1), 1),
                style_name: "other".to_string(),
                ..Default::default()
            }),
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            RenderError::UnknownStyle
        );
    }

    #[test]
    fn staged_updates_commit_or_cancel_atomically() {
        let mut worker = worker_with_style("osm", 1);

        // Same version is reused, commit keeps it live.
        assert!(worker.update_styles(&[style("osm", 1)], 7));
        assert!(worker.commit_update(7));
        assert!(worker.maps.contains_key("osm"));

        // A fresh version swaps in a new map; cancel leaves the old set.
        assert!(worker.update_styles(&[style("osm", 2), style("night", 1)], 8));
        assert!(worker.cancel_update(8));
        assert_eq!(worker.maps.len(), 1);
        assert_eq!(worker.maps.get("osm").map(|slot| slot.version), Some(1));

        assert!(worker.update_styles(&[style("night", 3)], 9));
        // A stale token neither commits nor cancels.
        assert!(!worker.commit_update(8));
        assert!(worker.commit_update(9));
        assert_eq!(worker.maps.len(), 1);
        assert_eq!(worker.maps.get("night").map(|slot| slot.version), Some(3));
    }
}
