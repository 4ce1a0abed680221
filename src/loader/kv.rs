use std::sync::Arc;

use async_trait::async_trait;
use log::error;

use crate::loader::{LoadError, LoadTask, TileLoader};
use crate::task::Executor;
use crate::tile::{Tile, TileId};
use crate::util::maybe_decompress;

/// Tiles per index block in the key-value layout.
pub const KV_BLOCK_SIZE: u64 = 32_768;

#[derive(thiserror::Error, Debug)]
pub enum KvError {
    #[error("key-value store unavailable: {0}")]
    Unavailable(String),
    #[error("key-value query failed: {0}")]
    Query(String),
}

/// Client for the external key-value tile database. Rows are addressed by
/// `(version, zoom, index, block)` where `index` interleaves the tile's
/// `x`/`y` bits and `block = index / 32768`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn fetch(
        &self,
        version: &str,
        zoom: u32,
        index: u64,
        block: u64,
    ) -> Result<Option<Vec<u8>>, KvError>;
}

/// Interleaves the low bits of `x` and `y` alternately, starting from `x`'s
/// least significant bit.
pub fn xy_to_index(x: u32, y: u32) -> u64 {
    let (mut x, mut y) = (u64::from(x), u64::from(y));
    let mut mult = 1u64;
    let mut result = 0u64;
    while x != 0 || y != 0 {
        result += mult * (x % 2);
        x /= 2;
        mult *= 2;
        result += mult * (y % 2);
        y /= 2;
        mult *= 2;
    }
    result
}

pub struct KvLoader {
    store: Arc<dyn KvStore>,
    versions: Vec<String>,
    executor: Executor,
}

impl KvLoader {
    pub fn new(store: Arc<dyn KvStore>, versions: Vec<String>, executor: Executor) -> Self {
        Self {
            store,
            versions,
            executor,
        }
    }
}

impl TileLoader for KvLoader {
    fn load(&self, task: Arc<LoadTask>, tile_id: TileId, version: &str) {
        if !self.has_version(version) {
            task.complete_error(LoadError::NotFound);
            return;
        }
        let store = Arc::clone(&self.store);
        let version = version.to_string();
        let index = xy_to_index(tile_id.x, tile_id.y);
        let block = index / KV_BLOCK_SIZE;
        self.executor.handle().spawn(async move {
            match store.fetch(&version, tile_id.z, index, block).await {
                Ok(Some(raw)) => match maybe_decompress(raw) {
                    Ok(data) => task.complete_success(Tile { id: tile_id, data }),
                    Err(e) => {
                        error!("corrupt tile payload for {tile_id} ({version}): {e}");
                        task.complete_error(LoadError::Internal);
                    }
                },
                Ok(None) => task.complete_error(LoadError::NotFound),
                Err(e) => {
                    error!("tile fetch failed for {tile_id} ({version}): {e}");
                    task.complete_error(LoadError::Internal);
                }
            }
        });
    }

    fn has_version(&self, version: &str) -> bool {
        self.versions.iter().any(|v| v == version)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn index_interleaves_bits_from_x() {
        assert_eq!(xy_to_index(0, 0), 0);
        assert_eq!(xy_to_index(1, 0), 1);
        assert_eq!(xy_to_index(0, 1), 2);
        assert_eq!(xy_to_index(1, 1), 3);
        assert_eq!(xy_to_index(2, 0), 4);
        assert_eq!(xy_to_index(5, 3), 0b11011);
    }

    struct MapStore {
        rows: Mutex<HashMap<(String, u32, u64, u64), Vec<u8>>>,
    }

    #[async_trait]
    impl KvStore for MapStore {
        async fn fetch(
            &self,
            version: &str,
            zoom: u32,
            index: u64,
            block: u64,
        ) -> Result<Option<Vec<u8>>, KvError> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .get(&(version.to_string(), zoom, index, block))
                .cloned())
        }
    }

    #[tokio::test]
    async fn loads_by_interleaved_index() {
        let tile_id = TileId::new(5, 3, 6);
        let index = xy_to_index(5, 3);
        let mut rows = HashMap::new();
        rows.insert(
            ("v1".to_string(), 6, index, index / KV_BLOCK_SIZE),
            b"payload".to_vec(),
        );
        let loader = KvLoader::new(
            Arc::new(MapStore {
                rows: Mutex::new(rows),
            }),
            vec!["v1".to_string()],
            Executor::current(),
        );

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let err_tx = tx.clone();
        let task = Arc::new(LoadTask::new(
            move |tile: Tile| {
                let _ = tx.send(Ok(tile));
            },
            move |e| {
                let _ = err_tx.send(Err(e));
            },
        ));
        loader.load(task, tile_id, "v1");
        let tile = rx.recv().await.unwrap().unwrap();
        assert_eq!(tile.data, b"payload");

        // Unknown version short-circuits to not-found.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let err_tx = tx.clone();
        let task = Arc::new(LoadTask::new(
            move |tile: Tile| {
                let _ = tx.send(Ok(tile));
            },
            move |e| {
                let _ = err_tx.send(Err(e));
            },
        ));
        loader.load(task, tile_id, "v9");
        assert_eq!(rx.recv().await.unwrap().unwrap_err(), LoadError::NotFound);
    }
}
