//! Vector-tile plumbing shared by the render worker and the subtiler:
//! decoding, feature tag access, the feature stream abstraction, and the
//! per-zoom layer filter table.

mod clip;
mod featureset;
mod filter;
mod geometry;

pub use clip::ClipBox;
pub use featureset::{CachingFeatureset, Feature, Featureset, LayerFeatureset};
pub use filter::{FilterError, FilterTable, LayerFilter, TagPredicate};
pub use geometry::{decode_geometry, encode_geometry, Geometry, Point};

use std::collections::BTreeMap;
use std::fmt;

use geozero::mvt::{tile, Tile};
use prost::Message as _;

#[derive(thiserror::Error, Debug)]
pub enum MvtError {
    #[error("invalid vector tile: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("invalid geometry command stream: {0}")]
    Geometry(String),
}

pub fn decode_tile(data: &[u8]) -> Result<Tile, MvtError> {
    Ok(Tile::decode(data)?)
}

pub fn encode_tile(tile: &Tile) -> Vec<u8> {
    tile.encode_to_vec()
}

/// A decoded feature attribute value.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    String(String),
    Double(f64),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Null,
}

impl TagValue {
    pub fn from_value(value: &tile::Value) -> Self {
        if let Some(v) = &value.string_value {
            Self::String(v.clone())
        } else if let Some(v) = value.double_value {
            Self::Double(v)
        } else if let Some(v) = value.float_value {
            Self::Double(f64::from(v))
        } else if let Some(v) = value.int_value {
            Self::Int(v)
        } else if let Some(v) = value.sint_value {
            Self::Int(v)
        } else if let Some(v) = value.uint_value {
            Self::UInt(v)
        } else if let Some(v) = value.bool_value {
            Self::Bool(v)
        } else {
            Self::Null
        }
    }

    pub fn to_value(&self) -> tile::Value {
        let mut value = tile::Value::default();
        match self {
            Self::String(v) => value.string_value = Some(v.clone()),
            Self::Double(v) => {
                // Narrow to float when the value survives the round trip.
                let narrowed = *v as f32;
                if f64::from(narrowed) == *v {
                    value.float_value = Some(narrowed);
                } else {
                    value.double_value = Some(*v);
                }
            }
            Self::Int(v) => value.int_value = Some(*v),
            Self::UInt(v) => value.uint_value = Some(*v),
            Self::Bool(v) => value.bool_value = Some(*v),
            Self::Null => {}
        }
        value
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::String(v) => serde_json::Value::String(v.clone()),
            Self::Double(v) => serde_json::json!(v),
            Self::Int(v) => serde_json::json!(v),
            Self::UInt(v) => serde_json::json!(v),
            Self::Bool(v) => serde_json::Value::Bool(*v),
            Self::Null => serde_json::Value::Null,
        }
    }
}

impl fmt::Display for TagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Null => Ok(()),
        }
    }
}

/// Attribute map of one feature, decoded from the layer's key/value tables.
#[derive(Clone, Debug, Default)]
pub struct FeatureTags {
    tags: BTreeMap<String, TagValue>,
}

impl FeatureTags {
    pub fn decode(feature: &tile::Feature, keys: &[String], values: &[tile::Value]) -> Self {
        let mut tags = BTreeMap::new();
        for pair in feature.tags.chunks_exact(2) {
            let (key_idx, value_idx) = (pair[0] as usize, pair[1] as usize);
            if let (Some(key), Some(value)) = (keys.get(key_idx), values.get(value_idx)) {
                tags.insert(key.clone(), TagValue::from_value(value));
            }
        }
        Self { tags }
    }

    pub fn get(&self, key: &str) -> Option<&TagValue> {
        self.tags.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TagValue)> {
        self.tags.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_decoding_uses_layer_tables() {
        let keys = vec!["class".to_string(), "name".to_string()];
        let values = vec![
            TagValue::String("road".to_string()).to_value(),
            TagValue::Int(42).to_value(),
        ];
        let feature = tile::Feature {
            tags: vec![0, 0, 1, 1],
            ..Default::default()
        };
        let tags = FeatureTags::decode(&feature, &keys, &values);
        assert_eq!(tags.get("class"), Some(&TagValue::String("road".into())));
        assert_eq!(tags.get("name"), Some(&TagValue::Int(42)));
        assert_eq!(tags.get("missing"), None);
    }

    #[test]
    fn double_narrows_to_float_when_lossless() {
        let value = TagValue::Double(0.5).to_value();
        assert_eq!(value.float_value, Some(0.5));
        assert_eq!(value.double_value, None);

        let value = TagValue::Double(0.1).to_value();
        assert_eq!(value.float_value, None);
        assert_eq!(value.double_value, Some(0.1));
    }
}
