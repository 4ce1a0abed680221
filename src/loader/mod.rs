//! Source-tile loaders.
//!
//! A loader fetches the raw vector-tile bytes for a `(z, x, y)` coordinate
//! and data version from a backing store, transparently decompressing
//! gzip/zlib payloads. Completion is delivered through an [`AsyncTask`] so
//! callers can cancel an in-flight load.

mod file;
mod kv;

pub use file::FileLoader;
pub use kv::{xy_to_index, KvError, KvLoader, KvStore, KV_BLOCK_SIZE};

use std::sync::Arc;

use crate::task::AsyncTask;
use crate::tile::{Tile, TileId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadError {
    NotFound,
    Internal,
}

pub type LoadTask = AsyncTask<Tile, LoadError>;

pub trait TileLoader: Send + Sync {
    /// Fires `task` with the tile bytes, or with [`LoadError::NotFound`] /
    /// [`LoadError::Internal`].
    fn load(&self, task: Arc<LoadTask>, tile_id: TileId, version: &str);

    fn has_version(&self, version: &str) -> bool;
}
