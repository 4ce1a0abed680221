use std::path::PathBuf;
use std::sync::Arc;

use log::debug;

use crate::loader::{LoadError, LoadTask, TileLoader};
use crate::task::Executor;
use crate::tile::{Tile, TileId};
use crate::util::maybe_decompress;

/// Reads tiles from a `<base>/<version>/z/x/y.mvt` layout. With
/// `auto_version` disabled the version directory is skipped.
#[derive(Debug)]
pub struct FileLoader {
    base_path: PathBuf,
    versions: Vec<String>,
    auto_version: bool,
    executor: Executor,
}

impl FileLoader {
    pub fn new(
        base_path: impl Into<PathBuf>,
        versions: Vec<String>,
        auto_version: bool,
        executor: Executor,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            versions,
            auto_version,
            executor,
        }
    }

    fn tile_path(&self, tile_id: &TileId, version: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        if self.auto_version && !version.is_empty() {
            path.push(version);
        }
        path.push(tile_id.z.to_string());
        path.push(tile_id.x.to_string());
        path.push(format!("{}.mvt", tile_id.y));
        path
    }
}

impl TileLoader for FileLoader {
    fn load(&self, task: Arc<LoadTask>, tile_id: TileId, version: &str) {
        let path = self.tile_path(&tile_id, version);
        self.executor.dispatch_blocking(move || {
            let raw = match std::fs::read(&path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("tile file {} not found", path.display());
                    task.complete_error(LoadError::NotFound);
                    return;
                }
                Err(e) => {
                    log::error!("failed to read tile file {}: {e}", path.display());
                    task.complete_error(LoadError::Internal);
                    return;
                }
            };
            match maybe_decompress(raw) {
                Ok(data) => task.complete_success(Tile { id: tile_id, data }),
                Err(e) => {
                    log::error!("corrupt tile payload at {}: {e}", path.display());
                    task.complete_error(LoadError::Internal);
                }
            }
        });
    }

    fn has_version(&self, version: &str) -> bool {
        // With no configured version list any version maps onto the layout.
        self.versions.is_empty() || self.versions.iter().any(|v| v == version)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::util::encode_gzip;

    fn load_blocking(loader: &FileLoader, tile_id: TileId, version: &str) -> Result<Tile, LoadError> {
        let (tx, rx) = mpsc::channel();
        let err_tx = tx.clone();
        let task = Arc::new(LoadTask::new(
            move |tile| {
                let _ = tx.send(Ok(tile));
            },
            move |e| {
                let _ = err_tx.send(Err(e));
            },
        ));
        loader.load(task, tile_id, version);
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn loads_and_decompresses_versioned_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let tile_dir = dir.path().join("v3").join("5").join("10");
        std::fs::create_dir_all(&tile_dir).unwrap();
        let payload = b"mvt payload".to_vec();
        std::fs::write(tile_dir.join("12.mvt"), encode_gzip(&payload).unwrap()).unwrap();

        let loader = FileLoader::new(
            dir.path(),
            vec!["v3".to_string()],
            true,
            Executor::current(),
        );
        assert!(loader.has_version("v3"));
        assert!(!loader.has_version("v4"));

        let loaded = tokio::task::spawn_blocking({
            let tile_id = TileId::new(10, 12, 5);
            let loader = Arc::new(loader);
            move || load_blocking(&loader, tile_id, "v3")
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(loaded.id, TileId::new(10, 12, 5));
        assert_eq!(loaded.data, payload);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_tile_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Arc::new(FileLoader::new(
            dir.path(),
            Vec::new(),
            false,
            Executor::current(),
        ));
        let result = tokio::task::spawn_blocking({
            let loader = Arc::clone(&loader);
            move || load_blocking(&loader, TileId::new(0, 0, 0), "")
        })
        .await
        .unwrap();
        assert_eq!(result.unwrap_err(), LoadError::NotFound);
    }
}
