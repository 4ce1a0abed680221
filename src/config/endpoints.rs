//! Endpoint map parsing.
//!
//! The `server.endpoints` config object maps a path segment to a list of
//! endpoint parameter sets; a request picks the first set whose zoom range
//! contains the request zoom. The empty key is the default endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use log::error;
use serde_json::Value;

use crate::mvt::FilterTable;
use crate::provider::{DataManager, DataProvider};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EndpointKind {
    #[default]
    Static,
    Render,
    Mvt,
}

#[derive(Default)]
pub struct EndpointParams {
    pub kind: EndpointKind,
    pub style_name: String,
    pub minzoom: u32,
    pub maxzoom: u32,
    /// Magnitude of the (non-positive) configured `data_zoom_offset`.
    pub zoom_offset: u32,
    pub metatile_width: u32,
    pub metatile_height: u32,
    pub auto_metatile_size: bool,
    pub data_provider: Option<Arc<DataProvider>>,
    pub filter_table: Option<Arc<FilterTable>>,
    pub allow_utf_grid: bool,
    pub utfgrid_key: String,
    pub allow_layers_query: bool,
}

impl std::fmt::Debug for EndpointParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointParams")
            .field("kind", &self.kind)
            .field("style_name", &self.style_name)
            .field("minzoom", &self.minzoom)
            .field("maxzoom", &self.maxzoom)
            .finish_non_exhaustive()
    }
}

pub type EndpointsMap = HashMap<String, Vec<Arc<EndpointParams>>>;

/// Parses the endpoints object; invalid endpoint definitions are skipped
/// with a log line rather than failing the whole map.
pub fn parse_endpoints(value: &Value, data_manager: &DataManager) -> Option<EndpointsMap> {
    let endpoints_obj = value.as_object()?;
    let mut map = EndpointsMap::with_capacity(endpoints_obj.len());
    for (path, sets) in endpoints_obj {
        if map.contains_key(path) {
            error!("duplicate endpoint path: {path}");
            continue;
        }
        let Some(sets) = sets.as_array() else {
            error!("endpoint '{path}' must be a list of parameter sets");
            continue;
        };
        let mut parsed = Vec::with_capacity(sets.len());
        for params in sets {
            match parse_endpoint_params(path, params, data_manager) {
                Some(endpoint) => parsed.push(Arc::new(endpoint)),
                None => error!("skipping endpoint \"{path}\""),
            }
        }
        map.insert(path.clone(), parsed);
    }
    Some(map)
}

fn parse_endpoint_params(
    path: &str,
    params: &Value,
    data_manager: &DataManager,
) -> Option<EndpointParams> {
    let mut endpoint = EndpointParams {
        minzoom: u32_or(params, "minzoom", 0),
        maxzoom: u32_or(params, "maxzoom", 19),
        metatile_width: 1,
        metatile_height: 1,
        ..Default::default()
    };

    let zoom_offset = params
        .get("data_zoom_offset")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    if zoom_offset > 0 {
        error!("data_zoom_offset must be negative or zero");
        return None;
    }
    endpoint.zoom_offset = zoom_offset.unsigned_abs() as u32;

    if let Some(provider_name) = params.get("data_provider").and_then(|v| v.as_str()) {
        if !provider_name.is_empty() {
            let Some(provider) = data_manager.provider(provider_name) else {
                error!("data provider \"{provider_name}\" for endpoint \"{path}\" not found");
                return None;
            };
            endpoint.data_provider = Some(provider);
        }
    }

    endpoint.style_name = params
        .get("style")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    endpoint.allow_layers_query = params
        .get("allow_layers_query")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    match params.get("type").and_then(|v| v.as_str()).unwrap_or("static") {
        "static" => {
            endpoint.kind = EndpointKind::Static;
            if endpoint.data_provider.is_none() {
                error!("no data provider for endpoint '{path}' specified");
                return None;
            }
        }
        "render" => {
            endpoint.kind = EndpointKind::Render;
            endpoint.allow_utf_grid = params
                .get("allow_utfgrid")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            endpoint.utfgrid_key = params
                .get("utfgrid_key")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            if endpoint.allow_utf_grid && endpoint.utfgrid_key.is_empty() {
                error!("no utfgrid key for endpoint '{path}' provided");
                endpoint.allow_utf_grid = false;
            }
            if endpoint.style_name.is_empty() {
                error!("no style name for endpoint '{path}' provided");
                return None;
            }
        }
        "mvt" => {
            endpoint.kind = EndpointKind::Mvt;
            if endpoint.data_provider.is_none() {
                error!("no data provider for endpoint '{path}' specified");
                return None;
            }
            if let Some(filter_map) = params.get("filter_map") {
                match FilterTable::from_json(filter_map) {
                    Ok(table) => endpoint.filter_table = Some(Arc::new(table)),
                    Err(e) => {
                        error!("invalid filter map for endpoint '{path}': {e}");
                        return None;
                    }
                }
            }
        }
        other => {
            error!("invalid type '{other}' for endpoint '{path}' provided");
            return None;
        }
    }

    match params.get("metatile_size") {
        Some(Value::String(auto)) if auto == "auto" => {
            if endpoint.data_provider.is_none() {
                error!("auto metatile size can be used only with data provider");
            } else {
                endpoint.auto_metatile_size = true;
            }
        }
        Some(Value::Number(size)) => {
            let size = size.as_u64().unwrap_or(1) as u32;
            endpoint.metatile_width = size.max(1);
            endpoint.metatile_height = size.max(1);
        }
        _ => {
            endpoint.metatile_width = u32_or(params, "metatile_width", 1).max(1);
            endpoint.metatile_height = u32_or(params, "metatile_height", 1).max(1);
        }
    }

    Some(endpoint)
}

fn u32_or(value: &Value, key: &str, default: u32) -> u32 {
    value
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
        .unwrap_or(default)
}

/// Picks the endpoint parameter set covering `zoom`.
pub fn select_endpoint(sets: &[Arc<EndpointParams>], zoom: u32) -> Option<Arc<EndpointParams>> {
    sets.iter()
        .find(|params| params.minzoom <= zoom && params.maxzoom >= zoom)
        .cloned()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::task::Executor;

    fn manager_with_provider() -> DataManager {
        let config = json!({
            "loaders": {"files": {"type": "file", "path": "/tiles", "versions": ["v1"]}},
            "providers": {"base": {"loader": "files", "minzoom": 0, "maxzoom": 19}}
        });
        DataManager::new(
            Some(&config),
            &std::collections::HashMap::new(),
            &Executor::current(),
        )
    }

    #[tokio::test]
    async fn parses_endpoint_families() {
        let dm = manager_with_provider();
        let endpoints = parse_endpoints(
            &json!({
                "tiles": [
                    {"type": "render", "style": "osm", "minzoom": 0, "maxzoom": 9,
                     "metatile_size": 4, "data_provider": "base"},
                    {"type": "render", "style": "osm", "minzoom": 10, "maxzoom": 19,
                     "metatile_size": "auto", "data_provider": "base",
                     "allow_utfgrid": true, "utfgrid_key": "id"},
                ],
                "raw": [
                    {"type": "mvt", "data_provider": "base", "data_zoom_offset": -1,
                     "allow_layers_query": true}
                ],
                "broken": [
                    {"type": "render"}
                ],
            }),
            &dm,
        )
        .unwrap();

        let tiles = endpoints.get("tiles").unwrap();
        assert_eq!(tiles.len(), 2);
        let low = select_endpoint(tiles, 5).unwrap();
        assert_eq!(low.kind, EndpointKind::Render);
        assert_eq!((low.metatile_width, low.metatile_height), (4, 4));
        assert!(!low.auto_metatile_size);
        let high = select_endpoint(tiles, 12).unwrap();
        assert!(high.auto_metatile_size);
        assert!(high.allow_utf_grid);
        assert!(select_endpoint(tiles, 20).is_none());

        let raw = select_endpoint(endpoints.get("raw").unwrap(), 5).unwrap();
        assert_eq!(raw.kind, EndpointKind::Mvt);
        assert_eq!(raw.zoom_offset, 1);
        assert!(raw.allow_layers_query);

        // The broken endpoint parsed to an empty parameter list.
        assert!(endpoints.get("broken").unwrap().is_empty());
    }

    #[tokio::test]
    async fn positive_zoom_offset_is_rejected() {
        let dm = manager_with_provider();
        let endpoints = parse_endpoints(
            &json!({"bad": [{"type": "mvt", "data_provider": "base", "data_zoom_offset": 2}]}),
            &dm,
        )
        .unwrap();
        assert!(endpoints.get("bad").unwrap().is_empty());
    }
}
