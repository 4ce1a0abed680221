//! Cluster membership through a watched key-value store.
//!
//! Every node registers `host:port` under `/nodes/<host>_<port>` with a TTL
//! and keeps the registration fresh; the monitor watches the directory and
//! maintains an immutable, sorted snapshot of the active peers. The
//! dispatcher shards metatile work over that snapshot.

mod etcd;
mod store;

pub use etcd::EtcdStore;
pub use store::{ClusterStore, StoreError, StoreNode, StoreResponse, StoreUpdate, UpdateKind};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use log::{error, warn};

use crate::tile::MetatileId;

const NODES_KEY: &str = "nodes";
const REGISTRATION_TTL: Duration = Duration::from_secs(10);
const REGISTRATION_REFRESH: Duration = Duration::from_secs(5);
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerEntry {
    pub addr: SocketAddr,
    pub addr_str: String,
    pub is_self: bool,
}

type PeerSnapshot = Arc<Vec<PeerEntry>>;

pub struct NodesMonitor {
    store: Arc<dyn ClusterStore>,
    nodes: RwLock<PeerSnapshot>,
    own_key: String,
    own_value: String,
    self_entry: Option<PeerEntry>,
    update_id: AtomicI64,
    registered: AtomicBool,
    pending_registration: AtomicBool,
    shutdown: AtomicBool,
}

impl NodesMonitor {
    /// Creates the monitor and spawns the bootstrap/watch loop on the current
    /// runtime.
    pub fn start(host: &str, port: u16, store: Arc<dyn ClusterStore>) -> Arc<Self> {
        let own_value = format!("{host}:{port}");
        let self_entry = resolve_peer(&own_value, true);
        if self_entry.is_none() {
            warn!("unable to resolve own address {own_value}");
        }
        let monitor = Arc::new(Self {
            store,
            nodes: RwLock::new(Arc::new(Vec::new())),
            own_key: format!("{NODES_KEY}/{host}_{port}"),
            own_value,
            self_entry,
            update_id: AtomicI64::new(0),
            registered: AtomicBool::new(false),
            pending_registration: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });
        let runner = Arc::clone(&monitor);
        tokio::spawn(async move { runner.run().await });
        monitor
    }

    /// The current sorted peer snapshot, the local node marked.
    pub fn active_nodes(&self) -> PeerSnapshot {
        Arc::clone(&self.nodes.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// The peer responsible for `metatile`: index `(lt.x ^ lt.y) % n` of the
    /// snapshot. `None` when the directory is empty.
    pub fn pick_node(&self, metatile: &MetatileId) -> Option<PeerEntry> {
        let nodes = self.active_nodes();
        if nodes.is_empty() {
            return None;
        }
        let lt = metatile.left_top();
        let index = (lt.x ^ lt.y) as usize % nodes.len();
        Some(nodes[index].clone())
    }

    /// Registers this node, then keeps refreshing the TTL until shutdown.
    pub fn register(self: &Arc<Self>) {
        if self.registered.load(Ordering::Acquire) {
            return;
        }
        if self
            .pending_registration
            .swap(true, Ordering::AcqRel)
        {
            return;
        }
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if monitor.shutdown.load(Ordering::Acquire) {
                    monitor.pending_registration.store(false, Ordering::Release);
                    return;
                }
                match monitor
                    .store
                    .set(
                        &monitor.own_key,
                        &monitor.own_value,
                        Some(REGISTRATION_TTL),
                        false,
                    )
                    .await
                {
                    Ok(()) => break,
                    Err(StoreError::Shutdown) => {
                        monitor.pending_registration.store(false, Ordering::Release);
                        return;
                    }
                    Err(e) => {
                        error!("node registration failed: {e}");
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
            monitor.registered.store(true, Ordering::Release);
            monitor.pending_registration.store(false, Ordering::Release);
            monitor.refresh_loop().await;
        });
    }

    /// Best-effort removal of the registration.
    pub async fn unregister(&self) {
        if !self.registered.swap(false, Ordering::AcqRel) {
            return;
        }
        match self.store.delete(&self.own_key).await {
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(e) => error!("node unregistration failed: {e}"),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    async fn refresh_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(REGISTRATION_REFRESH).await;
            if self.shutdown.load(Ordering::Acquire) || !self.registered.load(Ordering::Acquire) {
                return;
            }
            match self
                .store
                .set(&self.own_key, &self.own_value, Some(REGISTRATION_TTL), true)
                .await
            {
                Ok(()) => {}
                Err(StoreError::NotFound) => {
                    // The registration expired; re-create it.
                    warn!("node registration expired, re-registering");
                    self.registered.store(false, Ordering::Release);
                    let monitor = Arc::clone(&self);
                    monitor.register();
                    return;
                }
                Err(StoreError::Shutdown) => return,
                Err(e) => error!("node registration refresh failed: {e}"),
            }
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            match self.bootstrap().await {
                Ok(()) => {}
                Err(StoreError::Shutdown) => return,
                Err(e) => {
                    error!("peer directory bootstrap failed: {e}");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                    continue;
                }
            }
            loop {
                if self.shutdown.load(Ordering::Acquire) {
                    return;
                }
                let after_id = self.update_id.load(Ordering::Acquire);
                match self.store.watch(NODES_KEY, after_id).await {
                    Ok(update) => self.apply_update(update),
                    Err(StoreError::WaitIdOutdated) => break,
                    Err(StoreError::Shutdown) => return,
                    Err(StoreError::Connection(_)) => continue,
                    Err(e) => {
                        error!("peer directory watch failed: {e}");
                        tokio::time::sleep(RETRY_BACKOFF).await;
                    }
                }
            }
        }
    }

    async fn bootstrap(&self) -> Result<(), StoreError> {
        let response = self.store.get(NODES_KEY, true).await?;
        self.update_id
            .store(response.store_id + 1, Ordering::Release);
        let mut peers = Vec::with_capacity(response.node.nodes.len() + 1);
        if let Some(self_entry) = &self.self_entry {
            peers.push(self_entry.clone());
        }
        for node in &response.node.nodes {
            if node.value == self.own_value {
                continue;
            }
            if node.is_dir {
                error!("unexpected directory node {} below {NODES_KEY}", node.key);
                continue;
            }
            if let Some(peer) = resolve_peer(&node.value, false) {
                peers.push(peer);
            }
        }
        self.publish(peers);
        Ok(())
    }

    fn apply_update(&self, update: StoreUpdate) {
        self.update_id
            .store(update.node.modified_id + 1, Ordering::Release);
        if update.node.value == self.own_value && update.kind == UpdateKind::Set {
            return;
        }
        let current = self.active_nodes();
        let mut peers: Vec<PeerEntry> = (*current).clone();
        match update.kind {
            UpdateKind::Set => {
                if let Some(peer) = resolve_peer(&update.node.value, false) {
                    if !peers.iter().any(|p| p.addr_str == peer.addr_str) {
                        peers.push(peer);
                    }
                }
            }
            UpdateKind::Remove => {
                let key = &update.node.key;
                peers.retain(|peer| {
                    peer.is_self || !key.ends_with(&peer_key_suffix(&peer.addr_str))
                });
            }
        }
        self.publish(peers);
    }

    fn publish(&self, mut peers: Vec<PeerEntry>) {
        peers.sort_by(|a, b| a.addr_str.cmp(&b.addr_str));
        *self.nodes.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(peers);
    }
}

fn peer_key_suffix(addr_str: &str) -> String {
    format!("/{}", addr_str.replace(':', "_"))
}

fn resolve_peer(value: &str, is_self: bool) -> Option<PeerEntry> {
    use std::net::ToSocketAddrs as _;
    let addr = match value.parse::<SocketAddr>() {
        Ok(addr) => addr,
        Err(_) => match value.to_socket_addrs() {
            Ok(mut addrs) => addrs.next()?,
            Err(e) => {
                error!("failed to resolve peer address \"{value}\": {e}");
                return None;
            }
        },
    };
    Some(PeerEntry {
        addr,
        addr_str: value.to_string(),
        is_self,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::tile::TileId;

    /// In-memory store scripted for bootstrap plus a queue of updates.
    struct ScriptedStore {
        nodes: Mutex<BTreeMap<String, String>>,
        updates: Mutex<Vec<StoreUpdate>>,
        update_ready: Notify,
        sets: Mutex<Vec<(String, String, bool)>>,
        deletes: Mutex<Vec<String>>,
    }

    impl ScriptedStore {
        fn new(nodes: &[(&str, &str)]) -> Self {
            Self {
                nodes: Mutex::new(
                    nodes
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                updates: Mutex::new(Vec::new()),
                update_ready: Notify::new(),
                sets: Mutex::new(Vec::new()),
                deletes: Mutex::new(Vec::new()),
            }
        }

        fn push_update(&self, update: StoreUpdate) {
            self.updates.lock().unwrap().push(update);
            self.update_ready.notify_one();
        }
    }

    #[async_trait]
    impl ClusterStore for ScriptedStore {
        async fn get(&self, _key: &str, _recursive: bool) -> Result<StoreResponse, StoreError> {
            let nodes = self.nodes.lock().unwrap();
            Ok(StoreResponse {
                node: StoreNode {
                    key: format!("/{NODES_KEY}"),
                    is_dir: true,
                    nodes: nodes
                        .iter()
                        .map(|(key, value)| StoreNode {
                            key: key.clone(),
                            value: value.clone(),
                            ..Default::default()
                        })
                        .collect(),
                    ..Default::default()
                },
                store_id: 10,
            })
        }

        async fn watch(&self, _key: &str, _after_id: i64) -> Result<StoreUpdate, StoreError> {
            loop {
                {
                    let mut updates = self.updates.lock().unwrap();
                    if !updates.is_empty() {
                        return Ok(updates.remove(0));
                    }
                }
                self.update_ready.notified().await;
            }
        }

        async fn set(
            &self,
            key: &str,
            value: &str,
            _ttl: Option<Duration>,
            refresh: bool,
        ) -> Result<(), StoreError> {
            self.sets
                .lock()
                .unwrap()
                .push((key.to_string(), value.to_string(), refresh));
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.deletes.lock().unwrap().push(key.to_string());
            Ok(())
        }
    }

    async fn wait_for<F: Fn() -> bool>(predicate: F) {
        for _ in 0..100 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn bootstrap_sorts_and_marks_self() {
        let store = Arc::new(ScriptedStore::new(&[
            ("/nodes/10.0.0.2_8081", "10.0.0.2:8081"),
            ("/nodes/10.0.0.9_8081", "10.0.0.9:8081"),
        ]));
        let monitor = NodesMonitor::start("127.0.0.1", 8081, store.clone());
        wait_for(|| monitor.active_nodes().len() == 3).await;

        let nodes = monitor.active_nodes();
        let addrs: Vec<&str> = nodes.iter().map(|n| n.addr_str.as_str()).collect();
        assert_eq!(addrs, vec!["10.0.0.2:8081", "10.0.0.9:8081", "127.0.0.1:8081"]);
        assert!(nodes[2].is_self);
        monitor.shutdown();
    }

    #[tokio::test]
    async fn watch_applies_set_and_remove_deltas() {
        let store = Arc::new(ScriptedStore::new(&[(
            "/nodes/10.0.0.2_8081",
            "10.0.0.2:8081",
        )]));
        let monitor = NodesMonitor::start("127.0.0.1", 8081, store.clone());
        wait_for(|| monitor.active_nodes().len() == 2).await;

        store.push_update(StoreUpdate {
            kind: UpdateKind::Set,
            node: StoreNode {
                key: "/nodes/10.0.0.5_8081".to_string(),
                value: "10.0.0.5:8081".to_string(),
                modified_id: 11,
                ..Default::default()
            },
        });
        wait_for(|| monitor.active_nodes().len() == 3).await;

        store.push_update(StoreUpdate {
            kind: UpdateKind::Remove,
            node: StoreNode {
                key: "/nodes/10.0.0.2_8081".to_string(),
                value: String::new(),
                modified_id: 12,
                ..Default::default()
            },
        });
        wait_for(|| monitor.active_nodes().len() == 2).await;
        let nodes = monitor.active_nodes();
        assert!(nodes.iter().all(|n| n.addr_str != "10.0.0.2:8081"));
        monitor.shutdown();
    }

    #[tokio::test]
    async fn sharding_picks_by_metatile_corner() {
        let store = Arc::new(ScriptedStore::new(&[(
            "/nodes/10.0.0.2_8081",
            "10.0.0.2:8081",
        )]));
        let monitor = NodesMonitor::start("127.0.0.1", 8081, store.clone());
        wait_for(|| monitor.active_nodes().len() == 2).await;

        // lt = (4, 5): 4 ^ 5 = 1 -> second entry of the sorted snapshot.
        let metatile = MetatileId::square(TileId::new(4, 5, 6), 1);
        let picked = monitor.pick_node(&metatile).unwrap();
        assert_eq!(picked.addr_str, "127.0.0.1:8081");
        assert!(picked.is_self);

        // lt = (4, 4): 0 -> first entry.
        let metatile = MetatileId::square(TileId::new(4, 4, 6), 1);
        assert_eq!(
            monitor.pick_node(&metatile).unwrap().addr_str,
            "10.0.0.2:8081"
        );
        monitor.shutdown();
    }

    #[tokio::test]
    async fn registration_and_unregistration() {
        let store = Arc::new(ScriptedStore::new(&[]));
        let monitor = NodesMonitor::start("127.0.0.1", 8081, store.clone());
        monitor.register();
        wait_for(|| !store.sets.lock().unwrap().is_empty()).await;
        {
            let sets = store.sets.lock().unwrap();
            assert_eq!(sets[0].0, "nodes/127.0.0.1_8081");
            assert_eq!(sets[0].1, "127.0.0.1:8081");
            assert!(!sets[0].2);
        }
        monitor.unregister().await;
        assert_eq!(
            store.deletes.lock().unwrap().as_slice(),
            &["nodes/127.0.0.1_8081".to_string()]
        );
        monitor.shutdown();
    }
}
