use std::path::Path;

use serde_json::Value;

use crate::config::{ConfigError, ConfigStore};

/// Keys published into the store. Sub-keys of `render` are split out so the
/// render manager can observe style updates independently.
const SECTION_KEYS: &[&str] = &["app", "server", "data", "cacher"];
const RENDER_SUBKEYS: &[&str] = &["workers", "queue_limit", "styles"];

/// One-shot file backend: reads a JSON document and publishes the recognised
/// keys into the store.
pub struct JsonFileConfig;

impl JsonFileConfig {
    pub fn load(path: &Path, store: &ConfigStore) -> Result<(), ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.display().to_string(), e))?;
        let document: Value = serde_json::from_str(&contents)?;
        publish(&document, store)
    }
}

/// Publishes a parsed config document into the store; shared by the file
/// backend and tests.
pub fn publish(document: &Value, store: &ConfigStore) -> Result<(), ConfigError> {
    if !document.is_object() {
        return Err(ConfigError::MissingSection("<root object>"));
    }
    for section in SECTION_KEYS {
        if let Some(value) = document.get(*section) {
            store.set_value(section, value.clone());
        }
    }
    if let Some(render) = document.get("render") {
        for subkey in RENDER_SUBKEYS {
            if let Some(value) = render.get(*subkey) {
                store.set_value(&format!("render/{subkey}"), value.clone());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn publishes_sections_and_render_subkeys() {
        let store = ConfigStore::new();
        publish(
            &json!({
                "app": {"log_dir": "/var/log"},
                "server": {"endpoints": {}},
                "render": {"workers": 4, "styles": {"osm": {"map": "x"}}},
                "unrecognised": {"ignored": true},
            }),
            &store,
        )
        .unwrap();
        assert!(store.get_value("app").is_some());
        assert!(store.get_value("server").is_some());
        assert_eq!(
            store.get_value("render/workers").as_deref(),
            Some(&json!(4))
        );
        assert!(store.get_value("render/styles").is_some());
        assert!(store.get_value("unrecognised").is_none());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"app": {"name": "maps"}}"#).unwrap();
        let store = ConfigStore::new();
        JsonFileConfig::load(&path, &store).unwrap();
        assert_eq!(
            store
                .get_value("app")
                .unwrap()
                .get("name")
                .and_then(|v| v.as_str()),
            Some("maps")
        );
    }

    #[test]
    fn non_object_document_fails() {
        let store = ConfigStore::new();
        assert!(publish(&json!(42), &store).is_err());
    }
}
