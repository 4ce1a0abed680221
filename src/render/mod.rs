//! Rendering and MVT subtiling on a pool of dedicated worker threads, with
//! hot-swappable map styles.

pub mod engine;
mod manager;
mod style;
mod subtiler;
mod utfgrid;
mod worker;

pub use manager::{RenderManager, RenderManagerConfig};
pub use style::{parse_styles, StyleInfo, StyleKind};
pub use subtiler::Subtiler;
pub use utfgrid::encode_utfgrid;
pub use worker::RenderWorker;

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::mvt::FilterTable;
use crate::task::AsyncTask;
use crate::tile::{Metatile, MetatileId, Tile, TileId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderError {
    UnknownStyle,
    InvalidTile,
    Rendering,
}

pub type RenderTask = AsyncTask<Metatile, RenderError>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RenderKind {
    #[default]
    Png,
    Utfgrid,
}

/// A raster or UTF-grid render of one metatile.
#[derive(Debug, Default)]
pub struct RenderRequest {
    pub metatile_id: MetatileId,
    pub style_name: String,
    pub utfgrid_key: String,
    pub data_tile: Option<Arc<Tile>>,
    pub layers: Option<BTreeSet<String>>,
    pub kind: RenderKind,
    pub retina: bool,
}

/// Production of one higher-zoom MVT tile from a source tile.
#[derive(Debug, Default)]
pub struct SubtileRequest {
    pub mvt_tile: Tile,
    pub tile_id: TileId,
    pub filter_table: Option<Arc<FilterTable>>,
    pub layers: Option<BTreeSet<String>>,
}

#[derive(Debug)]
enum WorkRequest {
    Render(RenderRequest),
    Subtile(SubtileRequest),
}

/// Unit queued onto the render pool.
pub struct RenderWorkItem {
    task: Arc<RenderTask>,
    request: WorkRequest,
}
