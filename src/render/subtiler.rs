//! MVT subtiling: producing the payload of a higher-zoom tile from the
//! source tile that covers it.
//!
//! Geometries are re-projected into the target tile's local coordinates,
//! clipped against the buffered target extent, and re-encoded. Layer
//! key/value tables are rebuilt to carry only surviving features.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use geozero::mvt::tile::{self, GeomType};
use geozero::mvt::Tile as VectorTile;
use prost::Message as _;

use crate::mvt::{
    decode_geometry, decode_tile, encode_geometry, ClipBox, FeatureTags, FilterTable, Geometry,
    MvtError, Point,
};
use crate::tile::{Tile, TileId};

const DEFAULT_EXTENT: u32 = 4096;

pub struct Subtiler {
    source: Tile,
    filter_table: Option<Arc<FilterTable>>,
}

impl Subtiler {
    pub fn new(source: Tile, filter_table: Option<Arc<FilterTable>>) -> Self {
        Self {
            source,
            filter_table,
        }
    }

    /// Produces the MVT payload covering `target`'s footprint.
    pub fn make_subtile(
        &self,
        target: TileId,
        target_extent: u32,
        buffer: i64,
        layers: Option<&BTreeSet<String>>,
    ) -> Result<Vec<u8>, MvtError> {
        let source_id = self.source.id;
        if target.z < source_id.z {
            return Err(MvtError::Geometry(format!(
                "target zoom {} below source zoom {}",
                target.z, source_id.z
            )));
        }
        let dz = target.z - source_id.z;
        if dz > 31 {
            return Err(MvtError::Geometry("zoom delta too large".to_string()));
        }
        let zoom_factor = 1u64 << dz;
        // Position of the target tile within the source tile's subdivision.
        let tx_in = u64::from(target.x) - u64::from(source_id.x) * zoom_factor;
        let ty_in = u64::from(target.y) - u64::from(source_id.y) * zoom_factor;
        if tx_in >= zoom_factor || ty_in >= zoom_factor {
            return Err(MvtError::Geometry(format!(
                "target tile {target} outside source tile {source_id}"
            )));
        }

        let source_tile = decode_tile(&self.source.data)?;
        let clip_box = ClipBox::with_buffer(i64::from(target_extent), buffer);

        let mut output = VectorTile::default();
        for layer in &source_tile.layers {
            if let Some(requested) = layers {
                if !requested.contains(&layer.name) {
                    continue;
                }
            }
            let filter = self
                .filter_table
                .as_ref()
                .and_then(|table| table.filter(target.z, &layer.name));

            let source_extent = u64::from(layer.extent.unwrap_or(DEFAULT_EXTENT));
            let scale =
                (u64::from(target_extent) * zoom_factor) as f64 / source_extent as f64;
            let offset_x = tx_in as f64 * f64::from(target_extent);
            let offset_y = ty_in as f64 * f64::from(target_extent);

            let mut builder = LayerBuilder::new(&layer.name, target_extent);
            for feature in &layer.features {
                let Some(geom_type) = feature.r#type.and_then(|t| GeomType::try_from(t).ok())
                else {
                    continue;
                };
                if let Some(filter) = filter {
                    let tags = FeatureTags::decode(feature, &layer.keys, &layer.values);
                    if !filter.matches(&tags) {
                        continue;
                    }
                }
                let Ok(geometry) = decode_geometry(&feature.geometry, geom_type) else {
                    continue;
                };
                let transformed = transform(&geometry, scale, offset_x, offset_y);
                let Some(clipped) = clip(&transformed, &clip_box) else {
                    continue;
                };
                builder.push_feature(feature, layer, geom_type, &clipped);
            }
            if let Some(layer) = builder.finish() {
                output.layers.push(layer);
            }
        }
        Ok(output.encode_to_vec())
    }
}

fn transform(geometry: &Geometry, scale: f64, offset_x: f64, offset_y: f64) -> Geometry {
    let map_point = |&(x, y): &Point| -> Point {
        (
            (x as f64 * scale - offset_x).round() as i64,
            (y as f64 * scale - offset_y).round() as i64,
        )
    };
    match geometry {
        Geometry::Points(points) => Geometry::Points(points.iter().map(map_point).collect()),
        Geometry::Lines(lines) => Geometry::Lines(
            lines
                .iter()
                .map(|line| line.iter().map(map_point).collect())
                .collect(),
        ),
        Geometry::Polygon(rings) => Geometry::Polygon(
            rings
                .iter()
                .map(|ring| ring.iter().map(map_point).collect())
                .collect(),
        ),
    }
}

fn clip(geometry: &Geometry, clip_box: &ClipBox) -> Option<Geometry> {
    let clipped = match geometry {
        Geometry::Points(points) => Geometry::Points(
            points
                .iter()
                .filter(|point| clip_box.contains(point))
                .copied()
                .collect(),
        ),
        Geometry::Lines(lines) => Geometry::Lines(
            lines
                .iter()
                .flat_map(|line| clip_box.clip_line(line))
                .collect(),
        ),
        Geometry::Polygon(rings) => Geometry::Polygon(
            rings
                .iter()
                .map(|ring| clip_box.clip_ring(ring))
                .filter(|ring| !ring.is_empty())
                .collect(),
        ),
    };
    (!clipped.is_empty()).then_some(clipped)
}

/// Rebuilds one output layer, deduplicating keys and values across the
/// surviving features.
struct LayerBuilder {
    layer: tile::Layer,
    key_index: HashMap<String, u32>,
    value_index: HashMap<Vec<u8>, u32>,
}

impl LayerBuilder {
    fn new(name: &str, extent: u32) -> Self {
        Self {
            layer: tile::Layer {
                version: 2,
                name: name.to_string(),
                extent: Some(extent),
                ..Default::default()
            },
            key_index: HashMap::new(),
            value_index: HashMap::new(),
        }
    }

    fn push_feature(
        &mut self,
        feature: &tile::Feature,
        source_layer: &tile::Layer,
        geom_type: GeomType,
        geometry: &Geometry,
    ) {
        let mut tags = Vec::with_capacity(feature.tags.len());
        for pair in feature.tags.chunks_exact(2) {
            let (key_idx, value_idx) = (pair[0] as usize, pair[1] as usize);
            let (Some(key), Some(value)) = (
                source_layer.keys.get(key_idx),
                source_layer.values.get(value_idx),
            ) else {
                continue;
            };
            tags.push(self.intern_key(key));
            tags.push(self.intern_value(value));
        }
        self.layer.features.push(tile::Feature {
            id: feature.id,
            tags,
            r#type: Some(geom_type as i32),
            geometry: encode_geometry(geometry),
        });
    }

    fn intern_key(&mut self, key: &str) -> u32 {
        if let Some(index) = self.key_index.get(key) {
            return *index;
        }
        let index = self.layer.keys.len() as u32;
        self.layer.keys.push(key.to_string());
        self.key_index.insert(key.to_string(), index);
        index
    }

    fn intern_value(&mut self, value: &tile::Value) -> u32 {
        let encoded = value.encode_to_vec();
        if let Some(index) = self.value_index.get(&encoded) {
            return *index;
        }
        let index = self.layer.values.len() as u32;
        self.layer.values.push(value.clone());
        self.value_index.insert(encoded, index);
        index
    }

    fn finish(self) -> Option<tile::Layer> {
        (!self.layer.features.is_empty()).then_some(self.layer)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::mvt::TagValue;

    fn source_tile(id: TileId, layers: Vec<tile::Layer>) -> Tile {
        let data = crate::mvt::encode_tile(&VectorTile { layers });
        Tile { id, data }
    }

    fn point_layer(name: &str, points: &[(i64, i64, &str)]) -> tile::Layer {
        let mut layer = tile::Layer {
            version: 2,
            name: name.to_string(),
            extent: Some(4096),
            keys: vec!["class".to_string()],
            ..Default::default()
        };
        for (x, y, class) in points {
            let value = TagValue::String((*class).to_string()).to_value();
            let value_idx = layer
                .values
                .iter()
                .position(|v| v == &value)
                .unwrap_or_else(|| {
                    layer.values.push(value.clone());
                    layer.values.len() - 1
                });
            layer.features.push(tile::Feature {
                id: None,
                tags: vec![0, value_idx as u32],
                r#type: Some(GeomType::Point as i32),
                geometry: encode_geometry(&Geometry::Points(vec![(*x, *y)])),
            });
        }
        layer
    }

    #[test]
    fn points_are_scaled_and_clipped_to_target_quadrant() {
        // Source tile z5 (10, 12); target z6 (21, 24) is its NE quadrant.
        let source = source_tile(
            TileId::new(10, 12, 5),
            vec![point_layer(
                "poi",
                &[
                    (3000, 1000, "cafe"), // inside NE quadrant
                    (1000, 1000, "bank"), // NW quadrant, outside target
                ],
            )],
        );
        let subtiler = Subtiler::new(source, None);
        let data = subtiler
            .make_subtile(TileId::new(21, 24, 6), 4096, 0, None)
            .unwrap();
        let decoded = decode_tile(&data).unwrap();
        assert_eq!(decoded.layers.len(), 1);
        let layer = &decoded.layers[0];
        assert_eq!(layer.features.len(), 1);
        let geometry =
            decode_geometry(&layer.features[0].geometry, GeomType::Point).unwrap();
        // (3000, 1000) in source units maps to (3000*2 - 4096, 1000*2).
        assert_eq!(geometry, Geometry::Points(vec![(1904, 2000)]));
    }

    #[test]
    fn filter_table_drops_features_by_tag() {
        let source = source_tile(
            TileId::new(0, 0, 1),
            vec![point_layer(
                "poi",
                &[(100, 100, "cafe"), (200, 200, "bank")],
            )],
        );
        let table = FilterTable::from_json(&json!({
            "1": {"poi": [{"key": "class", "values": ["cafe"]}]}
        }))
        .unwrap();
        let subtiler = Subtiler::new(source, Some(Arc::new(table)));
        let data = subtiler
            .make_subtile(TileId::new(0, 0, 1), 4096, 64, None)
            .unwrap();
        let decoded = decode_tile(&data).unwrap();
        assert_eq!(decoded.layers[0].features.len(), 1);
        // Only the cafe survived; its tag tables were rebuilt.
        let layer = &decoded.layers[0];
        let tags = FeatureTags::decode(&layer.features[0], &layer.keys, &layer.values);
        assert_eq!(tags.get("class"), Some(&TagValue::String("cafe".into())));
    }

    #[test]
    fn layer_filter_and_empty_layers_are_omitted() {
        let source = source_tile(
            TileId::new(0, 0, 2),
            vec![
                point_layer("poi", &[(100, 100, "cafe")]),
                point_layer("labels", &[(100, 100, "label")]),
            ],
        );
        let subtiler = Subtiler::new(source, None);
        let mut keep = BTreeSet::new();
        keep.insert("poi".to_string());
        let data = subtiler
            .make_subtile(TileId::new(0, 0, 2), 4096, 0, Some(&keep))
            .unwrap();
        let decoded = decode_tile(&data).unwrap();
        assert_eq!(decoded.layers.len(), 1);
        assert_eq!(decoded.layers[0].name, "poi");
    }

    #[test]
    fn target_outside_source_is_rejected() {
        let source = source_tile(TileId::new(10, 12, 5), Vec::new());
        let subtiler = Subtiler::new(source, None);
        assert!(subtiler
            .make_subtile(TileId::new(100, 100, 6), 4096, 0, None)
            .is_err());
    }
}
