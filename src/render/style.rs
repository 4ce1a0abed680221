use std::sync::Arc;

use log::{error, warn};
use serde_json::Value;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StyleKind {
    #[default]
    Mapnik,
    Mvt,
}

/// A named map style; `version` must increase strictly across updates to
/// participate in cache keys.
#[derive(Clone, Debug, Default)]
pub struct StyleInfo {
    pub name: String,
    pub path: Option<String>,
    pub data: Option<Arc<String>>,
    pub base_path: String,
    pub version: u32,
    pub allow_grid_render: bool,
    pub kind: StyleKind,
}

impl StyleInfo {
    fn parse(name: &str, value: &Value) -> Option<Self> {
        if name.is_empty() {
            error!("invalid style node name");
            return None;
        }
        let mut style = StyleInfo {
            name: name.to_string(),
            ..Default::default()
        };
        match value.get("map") {
            Some(Value::String(path)) => style.path = Some(path.clone()),
            Some(_) => {
                error!("map path for style {name} should have string type");
                return None;
            }
            None => match value.get("data") {
                Some(Value::String(data)) if !data.is_empty() => {
                    style.data = Some(Arc::new(data.clone()));
                    style.base_path = value
                        .get("base_path")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                    if value.get("type").and_then(|v| v.as_str()) == Some("mvt") {
                        style.kind = StyleKind::Mvt;
                    }
                }
                _ => {
                    error!("no map path, nor style data provided for style {name}");
                    return None;
                }
            },
        }
        match value.get("allow_utfgrid") {
            Some(Value::Bool(allowed)) => style.allow_grid_render = *allowed,
            Some(_) => warn!("allow_utfgrid should have bool type"),
            None => {}
        }
        if let Some(version) = value.get("version").and_then(|v| v.as_u64()) {
            style.version = version as u32;
        }
        Some(style)
    }
}

/// Parses the `render/styles` config object, skipping invalid entries and
/// duplicate names.
pub fn parse_styles(value: &Value) -> Vec<StyleInfo> {
    let Some(styles_obj) = value.as_object() else {
        warn!("no styles provided");
        return Vec::new();
    };
    let mut styles: Vec<StyleInfo> = Vec::with_capacity(styles_obj.len());
    for (name, style_value) in styles_obj {
        let Some(style) = StyleInfo::parse(name, style_value) else {
            continue;
        };
        if styles.iter().any(|s| s.name == style.name) {
            error!("duplicate style name: {name}");
            continue;
        }
        styles.push(style);
    }
    styles
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_styles_and_skips_invalid() {
        let styles = parse_styles(&json!({
            "osm": {"map": "/styles/osm.xml", "version": 3, "allow_utfgrid": true},
            "inline": {"data": "<Map/>", "type": "mvt", "base_path": "/styles"},
            "broken": {"version": 1},
        }));
        assert_eq!(styles.len(), 2);
        let osm = styles.iter().find(|s| s.name == "osm").unwrap();
        assert_eq!(osm.path.as_deref(), Some("/styles/osm.xml"));
        assert_eq!(osm.version, 3);
        assert!(osm.allow_grid_render);
        assert_eq!(osm.kind, StyleKind::Mapnik);

        let inline = styles.iter().find(|s| s.name == "inline").unwrap();
        assert_eq!(inline.kind, StyleKind::Mvt);
        assert_eq!(inline.base_path, "/styles");
        assert_eq!(inline.version, 0);
    }

    #[test]
    fn non_object_styles_yield_nothing() {
        assert!(parse_styles(&json!("nope")).is_empty());
    }
}
