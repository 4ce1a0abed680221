use std::time::Duration;

use async_trait::async_trait;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("watch cursor outdated")]
    WaitIdOutdated,
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("store server error: {0}")]
    Server(String),
    #[error("store shutting down")]
    Shutdown,
}

/// One node of the watched key-value tree.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoreNode {
    pub key: String,
    pub value: String,
    pub nodes: Vec<StoreNode>,
    pub is_dir: bool,
    pub modified_id: i64,
}

/// A `get` result along with the store's monotonic index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoreResponse {
    pub node: StoreNode,
    pub store_id: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateKind {
    Set,
    Remove,
}

/// One observed change below a watched key.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreUpdate {
    pub kind: UpdateKind,
    pub node: StoreNode,
}

/// The external watched key-value store (cluster directory and config
/// backend). `watch` long-polls for the first change after `after_id`,
/// echoing the store's monotonic `modified_id` as a cursor.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get(&self, key: &str, recursive: bool) -> Result<StoreResponse, StoreError>;

    async fn watch(&self, key: &str, after_id: i64) -> Result<StoreUpdate, StoreError>;

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        refresh: bool,
    ) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
