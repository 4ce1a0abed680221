//! Interface to the external raster/grid rendering engine.
//!
//! The engine compiles a style into a per-worker map object; each compiled
//! map is owned by exactly one worker thread and never shared. Layers that
//! carry no datasource of their own are fed per-request from the decoded
//! source vector tile through [`Featureset`] bindings.

use std::sync::Arc;

use serde_json::Map;

use crate::mvt::Featureset;
use crate::render::style::StyleInfo;
use crate::tile::MercBbox;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("failed to load style '{0}': {1}")]
    StyleLoad(String, String),
    #[error("render failed: {0}")]
    Render(String),
}

/// RGBA8 surface, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct RasterImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl RasterImage {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    /// Copies out a sub-rectangle. The caller guarantees bounds.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
        for row in y..y + height {
            let start = (row as usize * self.width as usize + x as usize) * 4;
            let end = start + width as usize * 4;
            pixels.extend_from_slice(&self.pixels[start..end]);
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn to_png(&self) -> Result<Vec<u8>, EngineError> {
        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, self.width, self.height);
            encoder.set_color(png::ColorType::Rgba);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder
                .write_header()
                .map_err(|e| EngineError::Render(e.to_string()))?;
            writer
                .write_image_data(&self.pixels)
                .map_err(|e| EngineError::Render(e.to_string()))?;
        }
        Ok(out)
    }
}

/// One interactive feature referenced from a [`FeatureGrid`].
#[derive(Clone, Debug, Default)]
pub struct GridFeature {
    pub key: String,
    pub attributes: Map<String, serde_json::Value>,
}

/// Per-pixel feature index surface produced by a UTF-grid render.
#[derive(Clone, Debug, Default)]
pub struct FeatureGrid {
    pub width: u32,
    pub height: u32,
    /// Row-major; `None` marks pixels with no feature.
    pub cells: Vec<Option<u32>>,
    pub features: Vec<GridFeature>,
}

impl FeatureGrid {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cells: vec![None; width as usize * height as usize],
            features: Vec::new(),
        }
    }

    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Self {
        let mut cells = Vec::with_capacity(width as usize * height as usize);
        for row in y..y + height {
            let start = row as usize * self.width as usize + x as usize;
            cells.extend_from_slice(&self.cells[start..start + width as usize]);
        }
        Self {
            width,
            height,
            cells,
            features: self.features.clone(),
        }
    }
}

/// Geometry and sizing for one render pass.
#[derive(Clone, Debug)]
pub struct RenderJob {
    pub extent: MercBbox,
    /// Rendering buffer in projection units applied around the extent.
    pub buffer: f64,
    pub width: u32,
    pub height: u32,
    pub scale: f64,
    /// Attribute key used to group UTF-grid features; empty for raster jobs.
    pub utfgrid_key: String,
}

pub trait MapEngine: Send + Sync {
    fn compile(&self, style: &StyleInfo) -> Result<Box<dyn CompiledMap>, EngineError>;
}

pub trait CompiledMap: Send {
    fn layer_names(&self) -> Vec<String>;

    /// Layers that carry no datasource of their own and are fed from the
    /// request's source tile.
    fn unbound_layers(&self) -> Vec<String>;

    fn set_layer_active(&mut self, name: &str, active: bool);

    fn bind_layer_features(&mut self, name: &str, features: Box<dyn Featureset>);

    /// Drops all per-request feature bindings.
    fn clear_bound_features(&mut self);

    fn render(&mut self, job: &RenderJob) -> Result<RasterImage, EngineError>;

    fn render_grid(&mut self, job: &RenderJob) -> Result<FeatureGrid, EngineError>;
}

/// Stand-in engine used when no native renderer is linked: surfaces come out
/// empty but correctly sized, which keeps the full pipeline exercisable.
#[derive(Debug, Default)]
pub struct BlankEngine;

struct BlankMap {
    layers: Vec<String>,
}

impl MapEngine for BlankEngine {
    fn compile(&self, style: &StyleInfo) -> Result<Box<dyn CompiledMap>, EngineError> {
        if style.name.is_empty() {
            return Err(EngineError::StyleLoad(
                style.name.clone(),
                "empty style name".to_string(),
            ));
        }
        Ok(Box::new(BlankMap { layers: Vec::new() }))
    }
}

impl CompiledMap for BlankMap {
    fn layer_names(&self) -> Vec<String> {
        self.layers.clone()
    }

    fn unbound_layers(&self) -> Vec<String> {
        Vec::new()
    }

    fn set_layer_active(&mut self, _name: &str, _active: bool) {}

    fn bind_layer_features(&mut self, _name: &str, _features: Box<dyn Featureset>) {}

    fn clear_bound_features(&mut self) {}

    fn render(&mut self, job: &RenderJob) -> Result<RasterImage, EngineError> {
        Ok(RasterImage::new(job.width, job.height))
    }

    fn render_grid(&mut self, job: &RenderJob) -> Result<FeatureGrid, EngineError> {
        Ok(FeatureGrid::new(job.width, job.height))
    }
}

/// Shared handle to an engine implementation.
pub type SharedEngine = Arc<dyn MapEngine>;
