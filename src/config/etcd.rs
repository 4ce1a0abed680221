//! Watched-store config backend: mirrors the JSON documents below the
//! `config/` key of the cluster store into the [`ConfigStore`], republishing
//! every observed change.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, warn};
use serde_json::Value;

use crate::cluster::{ClusterStore, StoreError, StoreNode, UpdateKind};
use crate::config::ConfigStore;

const CONFIG_KEY: &str = "config";
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

pub struct EtcdConfig {
    store: Arc<dyn ClusterStore>,
    config: Arc<ConfigStore>,
    update_id: AtomicI64,
    loaded: AtomicBool,
    shutdown: AtomicBool,
}

impl EtcdConfig {
    /// Bootstraps the config tree synchronously, then keeps watching in the
    /// background. Returns once the initial tree was published.
    pub async fn start(
        store: Arc<dyn ClusterStore>,
        config: Arc<ConfigStore>,
    ) -> Result<Arc<Self>, StoreError> {
        let this = Arc::new(Self {
            store,
            config,
            update_id: AtomicI64::new(0),
            loaded: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        this.bootstrap().await?;
        let watcher = Arc::clone(&this);
        tokio::spawn(async move { watcher.watch_loop().await });
        Ok(this)
    }

    pub fn valid(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    async fn bootstrap(&self) -> Result<(), StoreError> {
        let response = self.store.get(CONFIG_KEY, true).await?;
        self.update_id
            .store(response.store_id + 1, Ordering::Release);
        publish_tree(&self.config, &response.node);
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    async fn watch_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            let after_id = self.update_id.load(Ordering::Acquire);
            match self.store.watch(CONFIG_KEY, after_id).await {
                Ok(update) => {
                    self.update_id
                        .store(update.node.modified_id + 1, Ordering::Release);
                    if update.kind == UpdateKind::Remove {
                        // Deletions keep the last known value; the consumers
                        // have no notion of a vanishing config key.
                        continue;
                    }
                    if let Some(config_key) = config_key_of(&update.node.key) {
                        publish_value(&self.config, &config_key, &update.node.value);
                    }
                }
                Err(StoreError::WaitIdOutdated) => {
                    if let Err(e) = self.bootstrap().await {
                        error!("config re-bootstrap failed: {e}");
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
                Err(StoreError::Shutdown) => return,
                Err(StoreError::Connection(_)) => continue,
                Err(e) => {
                    error!("config watch failed: {e}");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
            }
        }
    }
}

/// Maps a store key like `/config/render/styles` onto the config-store key
/// `render/styles`.
fn config_key_of(store_key: &str) -> Option<String> {
    let trimmed = store_key.trim_start_matches('/');
    let rest = trimmed.strip_prefix(CONFIG_KEY)?;
    let rest = rest.strip_prefix('/')?;
    (!rest.is_empty()).then(|| rest.to_string())
}

fn publish_value(config: &ConfigStore, key: &str, raw: &str) {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => config.set_value(key, value),
        Err(e) => warn!("ignoring non-JSON config value for '{key}': {e}"),
    }
}

fn publish_tree(config: &ConfigStore, node: &StoreNode) {
    if node.is_dir {
        for child in &node.nodes {
            publish_tree(config, child);
        }
        return;
    }
    if let Some(key) = config_key_of(&node.key) {
        publish_value(config, &key, &node.value);
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::cluster::{StoreResponse, StoreUpdate};

    struct OneShotStore;

    #[async_trait]
    impl ClusterStore for OneShotStore {
        async fn get(&self, _key: &str, _recursive: bool) -> Result<StoreResponse, StoreError> {
            Ok(StoreResponse {
                node: StoreNode {
                    key: "/config".to_string(),
                    is_dir: true,
                    nodes: vec![
                        StoreNode {
                            key: "/config/server".to_string(),
                            value: r#"{"endpoints": {}}"#.to_string(),
                            ..Default::default()
                        },
                        StoreNode {
                            key: "/config/render".to_string(),
                            is_dir: true,
                            nodes: vec![StoreNode {
                                key: "/config/render/workers".to_string(),
                                value: "4".to_string(),
                                ..Default::default()
                            }],
                            ..Default::default()
                        },
                    ],
                    ..Default::default()
                },
                store_id: 3,
            })
        }

        async fn watch(&self, _key: &str, _after_id: i64) -> Result<StoreUpdate, StoreError> {
            futures::future::pending().await
        }

        async fn set(
            &self,
            _key: &str,
            _value: &str,
            _ttl: Option<Duration>,
            _refresh: bool,
        ) -> Result<(), StoreError> {
            Ok(())
        }

        async fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn bootstrap_publishes_tree() {
        let config = Arc::new(ConfigStore::new());
        let etcd_config = EtcdConfig::start(Arc::new(OneShotStore), Arc::clone(&config))
            .await
            .unwrap();
        assert!(etcd_config.valid());
        assert_eq!(
            config.get_value("server").as_deref(),
            Some(&json!({"endpoints": {}}))
        );
        assert_eq!(config.get_value("render/workers").as_deref(), Some(&json!(4)));
        etcd_config.shutdown();
    }

    #[test]
    fn store_keys_map_to_config_keys() {
        assert_eq!(config_key_of("/config/server"), Some("server".to_string()));
        assert_eq!(
            config_key_of("/config/render/styles"),
            Some("render/styles".to_string())
        );
        assert_eq!(config_key_of("/other/key"), None);
        assert_eq!(config_key_of("/config"), None);
    }
}
