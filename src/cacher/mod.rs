//! Backend-agnostic tile cache coordination.
//!
//! Three mechanisms live here, all guarded by one mutex over the internal
//! maps (critical sections never run I/O or callbacks):
//!
//! - **single-flight get**: concurrent reads of one key share a single
//!   backend fetch;
//! - **lock-until-set**: a writer reserves a key set before generating, so
//!   readers arriving meanwhile wait for the write instead of rendering the
//!   same metatile again;
//! - **tmp cache**: a short-lived memory of freshly produced tiles that
//!   absorbs read bursts right after a write, bridging backend replication
//!   lag.

mod backend;
mod record;

pub use backend::{BackendError, CacheBackend, DiskBackend, MemoryBackend};
pub use record::{decode_cached_tile, encode_cached_tile};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::error;

use crate::task::{AsyncTask, Executor};

/// How long a freshly written tile stays in the tmp cache.
const TMP_CACHE_GRACE: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TtlPolicy {
    Error,
    #[default]
    Regular,
    Extended,
}

impl TtlPolicy {
    pub fn expire(&self) -> Duration {
        match self {
            Self::Regular => Duration::from_secs(86_400),
            Self::Extended => Duration::from_secs(259_200),
            Self::Error => Duration::from_secs(20),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CachedTile {
    pub data: Vec<u8>,
    pub headers: Vec<(String, String)>,
    pub policy: TtlPolicy,
}

/// Resolves with the cached tile, `None` on a clean miss, or an error when
/// the cache is unavailable or a held lock was released without a set.
pub type CacheGetTask = AsyncTask<Option<Arc<CachedTile>>, ()>;
pub type CacheSetTask = AsyncTask<bool, ()>;

type WaiterVec = Vec<Arc<CacheGetTask>>;

#[derive(Default)]
struct CacherMaps {
    get_waiters: HashMap<String, WaiterVec>,
    set_waiters: HashMap<String, WaiterVec>,
    tmp_cache: HashMap<String, Arc<CachedTile>>,
}

pub struct TileCacher {
    maps: Mutex<CacherMaps>,
    backend: Arc<dyn CacheBackend>,
    executor: Executor,
}

impl TileCacher {
    pub fn new(backend: Arc<dyn CacheBackend>, executor: Executor) -> Arc<Self> {
        Arc::new(Self {
            maps: Mutex::new(CacherMaps::default()),
            backend,
            executor,
        })
    }

    fn lock_maps(&self) -> MutexGuard<'_, CacherMaps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Single-flight get. The first reader of a key dispatches the backend
    /// fetch; readers arriving while it is in flight (or while the key is
    /// locked until set) are queued and share the eventual outcome.
    pub fn get(self: &Arc<Self>, key: &str, task: Arc<CacheGetTask>) {
        debug_assert!(!key.is_empty());
        {
            let mut maps = self.lock_maps();
            if let Some(tile) = maps.tmp_cache.get(key) {
                let tile = Arc::clone(tile);
                drop(maps);
                task.complete_success(Some(tile));
                return;
            }
            if let Some(waiters) = maps.set_waiters.get_mut(key) {
                waiters.push(task);
                return;
            }
            if let Some(waiters) = maps.get_waiters.get_mut(key) {
                waiters.push(task);
                return;
            }
            maps.get_waiters.insert(key.to_string(), vec![task]);
        }
        let cacher = Arc::clone(self);
        let key = key.to_string();
        self.executor.handle().spawn(async move {
            match cacher.backend.get(&key).await {
                Ok(tile) => cacher.on_retrieved(&key, tile),
                Err(e) => {
                    error!("cache get failed for {key}: {e}");
                    cacher.on_retrieve_error(&key);
                }
            }
        });
    }

    /// Publishes a produced tile: the tmp cache takes it immediately, any
    /// set-waiters are released with the value, then the backend write is
    /// dispatched.
    pub fn set(
        self: &Arc<Self>,
        key: &str,
        tile: Arc<CachedTile>,
        expire: Duration,
        task: Option<Arc<CacheSetTask>>,
    ) {
        debug_assert!(!key.is_empty());
        let waiters = {
            let mut maps = self.lock_maps();
            maps.tmp_cache.insert(key.to_string(), Arc::clone(&tile));
            maps.set_waiters.remove(key).unwrap_or_default()
        };
        for waiter in waiters {
            waiter.complete_success(Some(Arc::clone(&tile)));
        }
        let cacher = Arc::clone(self);
        let key_owned = key.to_string();
        self.executor.handle().spawn(async move {
            match cacher.backend.set(&key_owned, Arc::clone(&tile), expire).await {
                Ok(()) => {
                    if let Some(task) = task {
                        task.complete_success(true);
                    }
                }
                Err(e) => {
                    error!("cache set failed for {key_owned}: {e}");
                    if let Some(task) = task {
                        task.complete_error(());
                    }
                }
            }
        });
        self.schedule_tmp_removal(key.to_string());
    }

    /// Extends a key's TTL in the backend; no coordination state changes.
    pub fn touch(self: &Arc<Self>, key: &str, expire: Duration) {
        let cacher = Arc::clone(self);
        let key = key.to_string();
        self.executor.handle().spawn(async move {
            if let Err(e) = cacher.backend.touch(&key, expire).await {
                error!("cache touch failed for {key}: {e}");
            }
        });
    }

    /// Reserves every key in `keys` for one writer. Returns `None` when any
    /// key is already reserved by someone else.
    pub fn lock_until_set(self: &Arc<Self>, keys: Vec<String>) -> Option<CacherLock> {
        {
            let mut maps = self.lock_maps();
            if keys.iter().any(|key| maps.set_waiters.contains_key(key)) {
                return None;
            }
            for key in &keys {
                maps.set_waiters.insert(key.clone(), Vec::new());
            }
        }
        Some(CacherLock {
            cacher: Arc::clone(self),
            keys,
            locked: true,
        })
    }

    fn unlock(&self, keys: &[String]) {
        for key in keys {
            let waiters = {
                let mut maps = self.lock_maps();
                maps.set_waiters.remove(key)
            };
            let Some(waiters) = waiters else {
                continue;
            };
            // The writer gave up; waiters fall back to their own re-lookup.
            for waiter in waiters {
                waiter.complete_error(());
            }
        }
    }

    fn on_retrieved(self: &Arc<Self>, key: &str, tile: Option<Arc<CachedTile>>) {
        let waiters = {
            let mut maps = self.lock_maps();
            let Some(waiters) = maps.get_waiters.remove(key) else {
                return;
            };
            if let Some(tile) = &tile {
                maps.tmp_cache.insert(key.to_string(), Arc::clone(tile));
            }
            waiters
        };
        for waiter in waiters {
            waiter.complete_success(tile.clone());
        }
        if tile.is_some() {
            self.schedule_tmp_removal(key.to_string());
        }
    }

    fn on_retrieve_error(self: &Arc<Self>, key: &str) {
        let waiters = {
            let mut maps = self.lock_maps();
            maps.get_waiters.remove(key)
        };
        let Some(waiters) = waiters else {
            return;
        };
        for waiter in waiters {
            waiter.complete_error(());
        }
    }

    fn schedule_tmp_removal(self: &Arc<Self>, key: String) {
        let cacher = Arc::downgrade(self);
        self.executor.dispatch_after(TMP_CACHE_GRACE, move || {
            if let Some(cacher) = cacher.upgrade() {
                cacher.lock_maps().tmp_cache.remove(&key);
            }
        });
    }
}

/// Holds the reserved key set of one writer. Dropping the lock (or calling
/// [`CacherLock::unlock`]) releases the keys and errors the queued waiters so
/// they retry; [`CacherLock::cancel`] releases without erroring, for the case
/// where the set path already satisfied them.
pub struct CacherLock {
    cacher: Arc<TileCacher>,
    keys: Vec<String>,
    locked: bool,
}

impl CacherLock {
    pub fn unlock(&mut self) {
        if self.locked {
            self.cacher.unlock(&self.keys);
            self.locked = false;
        }
    }

    pub fn cancel(&mut self) {
        self.locked = false;
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Drop for CacherLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;

    /// Backend whose gets block until released, counting calls.
    struct GatedBackend {
        gets: AtomicUsize,
        release: Notify,
        tile: Option<CachedTile>,
    }

    #[async_trait]
    impl CacheBackend for GatedBackend {
        async fn get(&self, _key: &str) -> Result<Option<Arc<CachedTile>>, BackendError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(self.tile.clone().map(Arc::new))
        }

        async fn set(
            &self,
            _key: &str,
            _tile: Arc<CachedTile>,
            _expire: Duration,
        ) -> Result<(), BackendError> {
            Ok(())
        }

        async fn touch(&self, _key: &str, _expire: Duration) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn get_task(
        tx: tokio::sync::mpsc::UnboundedSender<Result<Option<Arc<CachedTile>>, ()>>,
    ) -> Arc<CacheGetTask> {
        let err_tx = tx.clone();
        Arc::new(CacheGetTask::new(
            move |tile| {
                let _ = tx.send(Ok(tile));
            },
            move |()| {
                let _ = err_tx.send(Err(()));
            },
        ))
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_backend_fetch() {
        let backend = Arc::new(GatedBackend {
            gets: AtomicUsize::new(0),
            release: Notify::new(),
            tile: Some(CachedTile {
                data: b"tile".to_vec(),
                ..Default::default()
            }),
        });
        let cacher = TileCacher::new(Arc::clone(&backend) as Arc<dyn CacheBackend>, Executor::current());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        cacher.get("k", get_task(tx.clone()));
        cacher.get("k", get_task(tx.clone()));
        cacher.get("k", get_task(tx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.release.notify_waiters();

        for _ in 0..3 {
            let tile = rx.recv().await.unwrap().unwrap().unwrap();
            assert_eq!(tile.data, b"tile");
        }
        assert_eq!(backend.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lock_until_set_is_all_or_nothing() {
        let backend = Arc::new(MemoryBackend::new(16 * 1024 * 1024));
        let cacher = TileCacher::new(backend, Executor::current());

        let lock = cacher
            .lock_until_set(vec!["a".to_string(), "b".to_string()])
            .unwrap();
        // Any overlap refuses.
        assert!(cacher
            .lock_until_set(vec!["b".to_string(), "c".to_string()])
            .is_none());
        // Disjoint sets lock fine.
        let mut other = cacher.lock_until_set(vec!["d".to_string()]).unwrap();
        other.unlock();
        drop(lock);
        // After release, the keys are free again.
        assert!(cacher
            .lock_until_set(vec!["a".to_string(), "b".to_string()])
            .is_some());
    }

    #[tokio::test]
    async fn set_releases_waiters_and_feeds_tmp_cache() {
        let backend = Arc::new(MemoryBackend::new(16 * 1024 * 1024));
        let cacher = TileCacher::new(backend, Executor::current());

        let mut lock = cacher.lock_until_set(vec!["k".to_string()]).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        cacher.get("k", get_task(tx.clone()));

        let tile = Arc::new(CachedTile {
            data: b"fresh".to_vec(),
            ..Default::default()
        });
        cacher.set("k", Arc::clone(&tile), TtlPolicy::Regular.expire(), None);
        let received = rx.recv().await.unwrap().unwrap().unwrap();
        assert_eq!(received.data, b"fresh");

        // The set path satisfied the waiters; cancel so drop doesn't error
        // anybody, then a fresh get hits the tmp cache synchronously.
        lock.cancel();
        drop(lock);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        cacher.get("k", get_task(tx));
        let received = rx.recv().await.unwrap().unwrap().unwrap();
        assert_eq!(received.data, b"fresh");
    }

    #[tokio::test]
    async fn unlock_errors_waiters_for_retry() {
        let backend = Arc::new(MemoryBackend::new(16 * 1024 * 1024));
        let cacher = TileCacher::new(backend, Executor::current());

        let lock = cacher.lock_until_set(vec!["k".to_string()]).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        cacher.get("k", get_task(tx));
        drop(lock);
        assert!(rx.recv().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn policy_expiry_mapping() {
        assert_eq!(TtlPolicy::Regular.expire(), Duration::from_secs(86_400));
        assert_eq!(TtlPolicy::Extended.expire(), Duration::from_secs(259_200));
        assert_eq!(TtlPolicy::Error.expire(), Duration::from_secs(20));
    }
}
