//! Feature streams handed to the render engine as layer datasources.

use std::sync::Arc;

use geozero::mvt::tile;
use geozero::mvt::tile::GeomType;

use crate::mvt::{FeatureTags, Geometry};

/// One decoded vector-tile feature, ready for rendering.
#[derive(Clone, Debug)]
pub struct Feature {
    pub id: Option<u64>,
    pub geom_type: GeomType,
    pub geometry: Geometry,
    pub tags: FeatureTags,
}

/// Pull-style feature stream. Exhaustion is signalled by `None`; streams
/// that support replay rewind afterwards.
pub trait Featureset: Send {
    fn next(&mut self) -> Option<Arc<Feature>>;
}

/// Streams the features of one tile layer, decoding lazily.
pub struct LayerFeatureset {
    layer: tile::Layer,
    pos: usize,
}

impl LayerFeatureset {
    pub fn new(layer: tile::Layer) -> Self {
        Self { layer, pos: 0 }
    }
}

impl Featureset for LayerFeatureset {
    fn next(&mut self) -> Option<Arc<Feature>> {
        while self.pos < self.layer.features.len() {
            let feature = &self.layer.features[self.pos];
            self.pos += 1;
            let Some(geom_type) = feature.r#type.and_then(|t| GeomType::try_from(t).ok()) else {
                continue;
            };
            let Ok(geometry) = crate::mvt::decode_geometry(&feature.geometry, geom_type) else {
                // A corrupt feature is skipped rather than poisoning the layer.
                continue;
            };
            let tags = FeatureTags::decode(feature, &self.layer.keys, &self.layer.values);
            return Some(Arc::new(Feature {
                id: feature.id,
                geom_type,
                geometry,
                tags,
            }));
        }
        None
    }
}

/// Wraps an upstream featureset, recording the first pass and replaying it on
/// subsequent iterations. The first pass is a strict pass-through of the
/// upstream sequence; every later pass iterates the stored buffer, rewinding
/// on exhaustion.
pub struct CachingFeatureset {
    upstream: Box<dyn Featureset>,
    cached: Vec<Arc<Feature>>,
    replay_pos: usize,
    exhausted: bool,
}

impl CachingFeatureset {
    pub fn new(upstream: Box<dyn Featureset>) -> Self {
        Self {
            upstream,
            cached: Vec::new(),
            replay_pos: 0,
            exhausted: false,
        }
    }
}

impl Featureset for CachingFeatureset {
    fn next(&mut self) -> Option<Arc<Feature>> {
        if self.exhausted {
            if self.replay_pos >= self.cached.len() {
                self.replay_pos = 0;
                return None;
            }
            let feature = Arc::clone(&self.cached[self.replay_pos]);
            self.replay_pos += 1;
            return Some(feature);
        }
        match self.upstream.next() {
            Some(feature) => {
                self.cached.push(Arc::clone(&feature));
                Some(feature)
            }
            None => {
                self.exhausted = true;
                self.replay_pos = 0;
                None
            }
        }
    }
}
