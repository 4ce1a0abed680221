//! Zoom-group policy over a tile loader.
//!
//! Source tiles only exist at configured *zoom groups*; intermediate zooms
//! are served by subtiling from the nearest lower group member. The provider
//! resolves which base tile to fetch for a request and how large the
//! render metatile should be.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use log::{error, warn};

use crate::loader::{FileLoader, KvLoader, KvStore, LoadError, LoadTask, TileLoader};
use crate::task::Executor;
use crate::tile::{MetatileId, TileId};

/// Metatiles never exceed 8x8 tiles.
const MAX_METATILE_ZOOM_DELTA: u32 = 3;

pub struct DataProvider {
    loader: Arc<dyn TileLoader>,
    zoom_groups: BTreeSet<u32>,
    min_zoom: u32,
    max_zoom: u32,
}

impl DataProvider {
    pub fn new(
        loader: Arc<dyn TileLoader>,
        min_zoom: u32,
        max_zoom: u32,
        zoom_groups: BTreeSet<u32>,
    ) -> Self {
        Self {
            loader,
            zoom_groups,
            min_zoom,
            max_zoom,
        }
    }

    pub fn has_version(&self, version: &str) -> bool {
        self.loader.has_version(version)
    }

    /// Fetches the base tile backing `tile_id` at the request zoom offset by
    /// `zoom_offset` (a non-negative magnitude lowering the source zoom).
    pub fn get_tile(&self, task: Arc<LoadTask>, tile_id: TileId, zoom_offset: u32, version: &str) {
        let Some(base_tile) = self.base_tile_id(&tile_id, zoom_offset) else {
            task.complete_error(LoadError::Internal);
            return;
        };
        if !self.loader.has_version(version) {
            task.complete_error(LoadError::NotFound);
            return;
        }
        self.loader.load(task, base_tile, version);
    }

    /// The tile that actually exists in the backend for `tile_id`: the
    /// ancestor at the nearest zoom group at or below the offset zoom.
    pub fn base_tile_id(&self, tile_id: &TileId, zoom_offset: u32) -> Option<TileId> {
        let base_zoom = self.base_zoom(tile_id.z, zoom_offset)?;
        Some(tile_id.upper_zoom(tile_id.z - base_zoom))
    }

    /// The metatile to render for `tile_id`: sized `2^dz` where `dz` is the
    /// distance to the base zoom group, clamped to 8x8.
    pub fn optimal_metatile_id(&self, tile_id: &TileId, zoom_offset: u32) -> Option<MetatileId> {
        let base_zoom = self.base_zoom(tile_id.z, zoom_offset)?;
        let dz = (tile_id.z - base_zoom).min(MAX_METATILE_ZOOM_DELTA);
        Some(MetatileId::square(*tile_id, 1 << dz))
    }

    fn base_zoom(&self, request_zoom: u32, zoom_offset: u32) -> Option<u32> {
        let offset_zoom = request_zoom.checked_sub(zoom_offset).unwrap_or(0);
        if offset_zoom < self.min_zoom || offset_zoom > self.max_zoom {
            return None;
        }
        if self.zoom_groups.is_empty() {
            return Some(offset_zoom);
        }
        self.zoom_groups.range(..=offset_zoom).next_back().copied()
    }
}

/// Builds loaders and providers from the `data.loaders` / `data.providers`
/// config sections and hands them out by name.
pub struct DataManager {
    providers: HashMap<String, Arc<DataProvider>>,
}

impl DataManager {
    pub fn new(
        data_config: Option<&serde_json::Value>,
        kv_stores: &HashMap<String, Arc<dyn KvStore>>,
        executor: &Executor,
    ) -> Self {
        let mut loaders: HashMap<String, Arc<dyn TileLoader>> = HashMap::new();
        let mut providers = HashMap::new();
        let Some(data_config) = data_config else {
            return Self { providers };
        };

        if let Some(loader_defs) = data_config.get("loaders").and_then(|v| v.as_object()) {
            for (name, def) in loader_defs {
                match Self::build_loader(name, def, kv_stores, executor) {
                    Some(loader) => {
                        loaders.insert(name.clone(), loader);
                    }
                    None => warn!("skipping loader '{name}'"),
                }
            }
        }

        if let Some(provider_defs) = data_config.get("providers").and_then(|v| v.as_object()) {
            for (name, def) in provider_defs {
                let Some(loader_name) = def.get("loader").and_then(|v| v.as_str()) else {
                    error!("provider '{name}' has no loader");
                    continue;
                };
                let Some(loader) = loaders.get(loader_name) else {
                    error!("provider '{name}' references unknown loader '{loader_name}'");
                    continue;
                };
                let min_zoom = u32_field(def, "minzoom").unwrap_or(0);
                let max_zoom = u32_field(def, "maxzoom").unwrap_or(19);
                let zoom_groups = def
                    .get("zoom_groups")
                    .and_then(|v| v.as_array())
                    .map(|groups| {
                        groups
                            .iter()
                            .filter_map(|z| z.as_u64().map(|z| z as u32))
                            .collect()
                    })
                    .unwrap_or_default();
                providers.insert(
                    name.clone(),
                    Arc::new(DataProvider::new(
                        Arc::clone(loader),
                        min_zoom,
                        max_zoom,
                        zoom_groups,
                    )),
                );
            }
        }

        Self { providers }
    }

    pub fn provider(&self, name: &str) -> Option<Arc<DataProvider>> {
        self.providers.get(name).cloned()
    }

    fn build_loader(
        name: &str,
        def: &serde_json::Value,
        kv_stores: &HashMap<String, Arc<dyn KvStore>>,
        executor: &Executor,
    ) -> Option<Arc<dyn TileLoader>> {
        let versions: Vec<String> = def
            .get("versions")
            .and_then(|v| v.as_array())
            .map(|versions| {
                versions
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        match def.get("type").and_then(|v| v.as_str()) {
            Some("file") => {
                let base_path = def.get("path").and_then(|v| v.as_str()).unwrap_or("./");
                let auto_version = def
                    .get("auto_version")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                Some(Arc::new(FileLoader::new(
                    base_path,
                    versions,
                    auto_version,
                    executor.clone(),
                )))
            }
            Some("kv") => {
                let Some(store) = kv_stores.get(name) else {
                    error!("no key-value store registered for loader '{name}'");
                    return None;
                };
                Some(Arc::new(KvLoader::new(
                    Arc::clone(store),
                    versions,
                    executor.clone(),
                )))
            }
            other => {
                error!("unknown loader type {other:?} for '{name}'");
                None
            }
        }
    }
}

fn u32_field(value: &serde_json::Value, key: &str) -> Option<u32> {
    value.get(key).and_then(|v| v.as_u64()).map(|v| v as u32)
}
