use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;

use crate::cacher::CachedTile;

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache backend operation failed: {0}")]
    Operation(String),
}

/// The three primitive operations a concrete cache backend provides. All
/// coordination (single-flight, lock-until-set, tmp cache) stays in
/// [`super::TileCacher`].
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Arc<CachedTile>>, BackendError>;

    async fn set(
        &self,
        key: &str,
        tile: Arc<CachedTile>,
        expire: Duration,
    ) -> Result<(), BackendError>;

    async fn touch(&self, key: &str, expire: Duration) -> Result<(), BackendError>;
}

#[derive(Clone)]
struct MemoryEntry {
    tile: Arc<CachedTile>,
    ttl: Duration,
}

struct PerEntryExpiry;

impl Expiry<String, MemoryEntry> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &MemoryEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache backend with per-entry TTLs, weighted by payload size.
pub struct MemoryBackend {
    cache: Cache<String, MemoryEntry>,
}

impl MemoryBackend {
    pub fn new(max_capacity_bytes: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity_bytes)
            .weigher(|_key, entry: &MemoryEntry| {
                entry.tile.data.len().try_into().unwrap_or(u32::MAX)
            })
            .expire_after(PerEntryExpiry)
            .build();
        Self { cache }
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Arc<CachedTile>>, BackendError> {
        Ok(self.cache.get(key).await.map(|entry| entry.tile))
    }

    async fn set(
        &self,
        key: &str,
        tile: Arc<CachedTile>,
        expire: Duration,
    ) -> Result<(), BackendError> {
        self.cache
            .insert(key.to_string(), MemoryEntry { tile, ttl: expire })
            .await;
        Ok(())
    }

    async fn touch(&self, key: &str, expire: Duration) -> Result<(), BackendError> {
        // Re-inserting resets the entry's creation time with the new TTL.
        if let Some(entry) = self.cache.get(key).await {
            self.cache
                .insert(
                    key.to_string(),
                    MemoryEntry {
                        tile: entry.tile,
                        ttl: expire.max(entry.ttl),
                    },
                )
                .await;
        }
        Ok(())
    }
}

/// Filesystem cache backend. Entries are stored as the wire record prefixed
/// with their absolute expiry; the original key is kept inside the file and
/// verified on read, so hash collisions degrade to misses.
pub struct DiskBackend {
    root: std::path::PathBuf,
}

impl DiskBackend {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_path(&self, key: &str) -> std::path::PathBuf {
        use std::hash::{Hash as _, Hasher as _};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish();
        self.root
            .join(format!("{:02x}", hash & 0xff))
            .join(format!("{hash:016x}.tile"))
    }

    fn now_secs() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn read_entry(path: &std::path::Path, key: &str) -> Option<(CachedTile, u64)> {
        let bytes = std::fs::read(path).ok()?;
        let (header, record) = parse_entry(&bytes)?;
        if header.key != key {
            return None;
        }
        let tile = crate::cacher::decode_cached_tile(record).ok()?;
        Some((tile, header.expires_at))
    }

    fn write_entry(
        path: &std::path::Path,
        key: &str,
        tile: &CachedTile,
        expires_at: u64,
    ) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let record = crate::cacher::encode_cached_tile(tile);
        let mut bytes = Vec::with_capacity(record.len() + key.len() + 16);
        bytes.extend_from_slice(&expires_at.to_be_bytes());
        bytes.extend_from_slice(&(key.len() as u64).to_be_bytes());
        bytes.extend_from_slice(key.as_bytes());
        bytes.extend_from_slice(&record);
        std::fs::write(path, bytes)
    }
}

struct EntryHeader<'a> {
    key: &'a str,
    expires_at: u64,
}

fn parse_entry(bytes: &[u8]) -> Option<(EntryHeader<'_>, &[u8])> {
    if bytes.len() < 16 {
        return None;
    }
    let expires_at = u64::from_be_bytes(bytes[..8].try_into().ok()?);
    let key_len = u64::from_be_bytes(bytes[8..16].try_into().ok()?) as usize;
    if bytes.len() < 16 + key_len {
        return None;
    }
    let key = std::str::from_utf8(&bytes[16..16 + key_len]).ok()?;
    Some((EntryHeader { key, expires_at }, &bytes[16 + key_len..]))
}

#[async_trait]
impl CacheBackend for DiskBackend {
    async fn get(&self, key: &str) -> Result<Option<Arc<CachedTile>>, BackendError> {
        let path = self.entry_path(key);
        let key = key.to_string();
        let result = tokio::task::spawn_blocking(move || {
            let Some((tile, expires_at)) = Self::read_entry(&path, &key) else {
                return None;
            };
            if expires_at <= Self::now_secs() {
                let _ = std::fs::remove_file(&path);
                return None;
            }
            Some(tile)
        })
        .await
        .map_err(|e| BackendError::Operation(e.to_string()))?;
        Ok(result.map(Arc::new))
    }

    async fn set(
        &self,
        key: &str,
        tile: Arc<CachedTile>,
        expire: Duration,
    ) -> Result<(), BackendError> {
        let path = self.entry_path(key);
        let key = key.to_string();
        let expires_at = Self::now_secs().saturating_add(expire.as_secs());
        tokio::task::spawn_blocking(move || Self::write_entry(&path, &key, &tile, expires_at))
            .await
            .map_err(|e| BackendError::Operation(e.to_string()))?
            .map_err(|e| BackendError::Operation(e.to_string()))
    }

    async fn touch(&self, key: &str, expire: Duration) -> Result<(), BackendError> {
        let path = self.entry_path(key);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let Some((tile, expires_at)) = Self::read_entry(&path, &key) else {
                return Ok(());
            };
            let extended = Self::now_secs().saturating_add(expire.as_secs());
            Self::write_entry(&path, &key, &tile, expires_at.max(extended))
        })
        .await
        .map_err(|e| BackendError::Operation(e.to_string()))?
        .map_err(|e| BackendError::Operation(e.to_string()))
    }
}
