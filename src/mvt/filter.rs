//! Per-zoom, per-layer feature filters applied while subtiling.
//!
//! The table is a sparse set of zoom columns; a lookup uses the column of
//! the largest zoom at or below the requested one, so filters configured for
//! zoom groups also cover the zooms served by subtiling from them.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::mvt::{FeatureTags, TagValue};

#[derive(thiserror::Error, Debug)]
pub enum FilterError {
    #[error("filter map must be an object of zoom columns")]
    InvalidShape,
    #[error("invalid zoom key '{0}'")]
    InvalidZoom(String),
    #[error("invalid predicate for layer '{0}'")]
    InvalidPredicate(String),
}

/// One predicate over a feature's attributes.
#[derive(Clone, Debug, PartialEq)]
pub enum TagPredicate {
    /// The key must be present, whatever its value.
    Present(String),
    /// The key's value must be one of the listed values.
    In(String, Vec<TagValue>),
}

impl TagPredicate {
    fn matches(&self, tags: &FeatureTags) -> bool {
        match self {
            Self::Present(key) => tags.get(key).is_some(),
            Self::In(key, values) => tags
                .get(key)
                .map(|value| values.contains(value))
                .unwrap_or(false),
        }
    }
}

/// Predicates for one layer, OR-merged: a feature survives when any
/// predicate matches.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LayerFilter {
    any_of: Vec<TagPredicate>,
}

impl LayerFilter {
    pub fn new(any_of: Vec<TagPredicate>) -> Self {
        Self { any_of }
    }

    pub fn matches(&self, tags: &FeatureTags) -> bool {
        self.any_of.is_empty() || self.any_of.iter().any(|p| p.matches(tags))
    }
}

#[derive(Debug, Default)]
pub struct FilterTable {
    columns: BTreeMap<u32, HashMap<String, LayerFilter>>,
}

impl FilterTable {
    /// Parses a filter map of the shape
    /// `{"<zoom>": {"<layer>": [{"key": "...", "values": [...]}, ...]}}`.
    /// A predicate without `values` only requires the key to be present.
    pub fn from_json(value: &Value) -> Result<Self, FilterError> {
        let columns_obj = value.as_object().ok_or(FilterError::InvalidShape)?;
        let mut columns = BTreeMap::new();
        for (zoom_key, layers_value) in columns_obj {
            let zoom: u32 = zoom_key
                .parse()
                .map_err(|_| FilterError::InvalidZoom(zoom_key.clone()))?;
            let layers_obj = layers_value
                .as_object()
                .ok_or(FilterError::InvalidShape)?;
            let mut layers = HashMap::new();
            for (layer_name, predicates_value) in layers_obj {
                let predicates = predicates_value
                    .as_array()
                    .ok_or_else(|| FilterError::InvalidPredicate(layer_name.clone()))?;
                let mut any_of = Vec::with_capacity(predicates.len());
                for predicate in predicates {
                    any_of.push(Self::parse_predicate(layer_name, predicate)?);
                }
                layers.insert(layer_name.clone(), LayerFilter::new(any_of));
            }
            columns.insert(zoom, layers);
        }
        Ok(Self { columns })
    }

    fn parse_predicate(layer: &str, value: &Value) -> Result<TagPredicate, FilterError> {
        let obj = value
            .as_object()
            .ok_or_else(|| FilterError::InvalidPredicate(layer.to_string()))?;
        let key = obj
            .get("key")
            .and_then(|k| k.as_str())
            .ok_or_else(|| FilterError::InvalidPredicate(layer.to_string()))?;
        match obj.get("values") {
            None => Ok(TagPredicate::Present(key.to_string())),
            Some(values) => {
                let values = values
                    .as_array()
                    .ok_or_else(|| FilterError::InvalidPredicate(layer.to_string()))?;
                let values = values
                    .iter()
                    .map(|v| match v {
                        Value::String(s) => Ok(TagValue::String(s.clone())),
                        Value::Bool(b) => Ok(TagValue::Bool(*b)),
                        Value::Number(n) => {
                            if let Some(i) = n.as_i64() {
                                Ok(TagValue::Int(i))
                            } else if let Some(f) = n.as_f64() {
                                Ok(TagValue::Double(f))
                            } else {
                                Err(FilterError::InvalidPredicate(layer.to_string()))
                            }
                        }
                        _ => Err(FilterError::InvalidPredicate(layer.to_string())),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(TagPredicate::In(key.to_string(), values))
            }
        }
    }

    /// The filter for `layer` at `zoom`, from the nearest column at or below.
    /// `None` means the layer is unfiltered.
    pub fn filter(&self, zoom: u32, layer: &str) -> Option<&LayerFilter> {
        let (_, column) = self.columns.range(..=zoom).next_back()?;
        column.get(layer)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use geozero::mvt::tile;

    fn tags(pairs: &[(&str, TagValue)]) -> FeatureTags {
        let keys: Vec<String> = pairs.iter().map(|(k, _)| k.to_string()).collect();
        let values: Vec<tile::Value> = pairs.iter().map(|(_, v)| v.to_value()).collect();
        let feature = tile::Feature {
            tags: (0..pairs.len() as u32).flat_map(|i| [i, i]).collect(),
            ..Default::default()
        };
        FeatureTags::decode(&feature, &keys, &values)
    }

    #[test]
    fn filters_resolve_through_zoom_columns() {
        let table = FilterTable::from_json(&json!({
            "5": {
                "roads": [{"key": "class", "values": ["motorway", "trunk"]}]
            },
            "10": {
                "roads": [{"key": "class"}]
            }
        }))
        .unwrap();

        let motorway = tags(&[("class", TagValue::String("motorway".into()))]);
        let footway = tags(&[("class", TagValue::String("footway".into()))]);
        let unclassified = tags(&[("name", TagValue::String("x".into()))]);

        // Zoom 7 uses the column at 5.
        let filter = table.filter(7, "roads").unwrap();
        assert!(filter.matches(&motorway));
        assert!(!filter.matches(&footway));

        // Zoom 12 uses the column at 10, which only requires the key.
        let filter = table.filter(12, "roads").unwrap();
        assert!(filter.matches(&footway));
        assert!(!filter.matches(&unclassified));

        // Below the lowest column, and for unknown layers, no filter applies.
        assert!(table.filter(3, "roads").is_none());
        assert!(table.filter(7, "water").is_none());
    }
}
