//! Watched string-keyed configuration surface.
//!
//! Values are opaque JSON documents. Consumers attach observers per key and
//! are notified on **every** [`ConfigStore::set_value`] call, including when
//! the new value equals the old one; observers rely on the notification
//! itself for cache invalidation, not on a value diff.

mod endpoints;
mod etcd;
mod file;

pub use endpoints::{parse_endpoints, select_endpoint, EndpointKind, EndpointParams, EndpointsMap};
pub use etcd::EtcdConfig;
pub use file::{publish, JsonFileConfig};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("unable to read config file {0}: {1}")]
    FileRead(String, #[source] std::io::Error),
    #[error("unable to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("config is missing required section '{0}'")]
    MissingSection(&'static str),
    #[error("config bootstrap from watched store failed: {0}")]
    Store(String),
}

pub trait ConfigObserver: Send + Sync {
    fn on_update(&self, value: Arc<Value>);
}

#[derive(Default)]
struct ValueHolder {
    value: Option<Arc<Value>>,
    observers: Vec<Arc<dyn ConfigObserver>>,
}

/// Shared store of configuration values with per-key observers.
#[derive(Default)]
pub struct ConfigStore {
    values: Mutex<HashMap<String, ValueHolder>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_value(&self, key: &str) -> Option<Arc<Value>> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(|holder| holder.value.clone())
    }

    /// Reads a value and attaches an observer for future updates in one step.
    pub fn get_value_with(
        &self,
        key: &str,
        observer: Arc<dyn ConfigObserver>,
    ) -> Option<Arc<Value>> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let holder = values.entry(key.to_string()).or_default();
        holder.observers.push(observer);
        holder.value.clone()
    }

    pub fn attach(&self, key: &str, observer: Arc<dyn ConfigObserver>) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .observers
            .push(observer);
    }

    /// Replaces the value and notifies every observer of the key, value
    /// equality notwithstanding.
    pub fn set_value(&self, key: &str, value: Value) {
        let value = Arc::new(value);
        let observers = {
            let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
            let holder = values.entry(key.to_string()).or_default();
            holder.value = Some(Arc::clone(&value));
            holder.observers.clone()
        };
        for observer in observers {
            observer.on_update(Arc::clone(&value));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    struct Counter(AtomicUsize);

    impl ConfigObserver for Counter {
        fn on_update(&self, _value: Arc<Value>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn set_value_notifies_even_when_unchanged() {
        let store = ConfigStore::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        store.attach("render/styles", Arc::clone(&counter) as Arc<dyn ConfigObserver>);

        store.set_value("render/styles", json!({"osm": {"version": 1}}));
        store.set_value("render/styles", json!({"osm": {"version": 1}}));
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
        assert_eq!(
            store.get_value("render/styles").as_deref(),
            Some(&json!({"osm": {"version": 1}}))
        );
    }

    #[test]
    fn get_value_with_attaches_observer() {
        let store = ConfigStore::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        assert!(store
            .get_value_with("server", Arc::clone(&counter) as Arc<dyn ConfigObserver>)
            .is_none());
        store.set_value("server", json!({}));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
