//! Tile and metatile identities.
//!
//! A metatile is an axis-aligned rectangle of adjacent tiles at one zoom,
//! rendered in a single pass and sliced afterwards. Its tile sequence is
//! always row-major: `x` scans fastest, then `y`.

use std::fmt;

use crate::util::TileData;

pub const TILE_SIZE: u32 = 256;

/// Web-Mercator circumference in meters (EPSG:3857).
const MERC_EXTENT: f64 = 2.0 * std::f64::consts::PI * 6_378_137.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TileId {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl TileId {
    pub fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub fn valid(&self) -> bool {
        let max_coord = 1u64 << self.z.min(32);
        u64::from(self.x) < max_coord && u64::from(self.y) < max_coord
    }

    /// The ancestor tile `dz` zoom levels up that contains this tile.
    pub fn upper_zoom(&self, dz: u32) -> TileId {
        if dz >= self.z {
            return TileId::new(0, 0, 0);
        }
        TileId::new(self.x >> dz, self.y >> dz, self.z - dz)
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Geographic extent in EPSG:3857 meters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MercBbox {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MetatileId {
    lt: TileId,
    width: u32,
    height: u32,
}

impl MetatileId {
    /// Snaps the top-left corner to the metatile grid (`x - x % width`) and
    /// clamps the dimensions to the remaining extent of the zoom grid.
    pub fn new(tile: TileId, width: u32, height: u32) -> Self {
        let zoom_size = 1u64 << tile.z.min(32);
        let (x, width) = Self::snap(tile.x, width, zoom_size);
        let (y, height) = Self::snap(tile.y, height, zoom_size);
        Self {
            lt: TileId::new(x, y, tile.z),
            width,
            height,
        }
    }

    pub fn square(tile: TileId, size: u32) -> Self {
        Self::new(tile, size, size)
    }

    fn snap(coord: u32, dim: u32, zoom_size: u64) -> (u32, u32) {
        if dim <= 1 {
            return (coord, 1);
        }
        if u64::from(dim) > zoom_size {
            return (0, u32::try_from(zoom_size).unwrap_or(u32::MAX));
        }
        let snapped = coord - coord % dim;
        let remaining = zoom_size - u64::from(snapped);
        let clamped = remaining.min(u64::from(dim));
        (snapped, u32::try_from(clamped).unwrap_or(dim))
    }

    pub fn left_top(&self) -> &TileId {
        &self.lt
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn tile_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Member tile ids in row-major order.
    pub fn tile_ids(&self) -> Vec<TileId> {
        let mut ids = Vec::with_capacity(self.tile_count());
        for y in self.lt.y..self.lt.y + self.height {
            for x in self.lt.x..self.lt.x + self.width {
                ids.push(TileId::new(x, y, self.lt.z));
            }
        }
        ids
    }

    pub fn contains(&self, tile_id: &TileId) -> bool {
        tile_id.z == self.lt.z
            && tile_id.x >= self.lt.x
            && tile_id.x < self.lt.x + self.width
            && tile_id.y >= self.lt.y
            && tile_id.y < self.lt.y + self.height
    }

    /// The metatile extent in EPSG:3857, computed from the corner pixel
    /// positions through the spherical-Mercator pixel mapping.
    pub fn bbox(&self) -> MercBbox {
        let shift = f64::from(TILE_SIZE) * (1u64 << self.lt.z.min(32)) as f64;
        let px_min = f64::from(self.lt.x) * f64::from(TILE_SIZE);
        let px_max = (f64::from(self.lt.x) + f64::from(self.width)) * f64::from(TILE_SIZE);
        let py_top = f64::from(self.lt.y) * f64::from(TILE_SIZE);
        let py_bottom = (f64::from(self.lt.y) + f64::from(self.height)) * f64::from(TILE_SIZE);
        MercBbox {
            minx: (px_min / shift - 0.5) * MERC_EXTENT,
            miny: (0.5 - py_bottom / shift) * MERC_EXTENT,
            maxx: (px_max / shift - 0.5) * MERC_EXTENT,
            maxy: (0.5 - py_top / shift) * MERC_EXTENT,
        }
    }
}

impl fmt::Display for MetatileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}x{}", self.lt, self.width, self.height)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tile {
    pub id: TileId,
    pub data: TileData,
}

#[derive(Clone, Debug, Default)]
pub struct Metatile {
    pub id: MetatileId,
    pub tiles: Vec<Tile>,
}

impl Metatile {
    /// Creates the metatile with all member tiles pre-populated in row-major
    /// order and empty payloads.
    pub fn new(id: MetatileId) -> Self {
        let tiles = id
            .tile_ids()
            .into_iter()
            .map(|tile_id| Tile {
                id: tile_id,
                data: TileData::new(),
            })
            .collect();
        Self { id, tiles }
    }

    /// Checks the tile-count and row-major ordering invariant.
    pub fn validate(&self) -> bool {
        if self.tiles.len() != self.id.tile_count() {
            return false;
        }
        self.id
            .tile_ids()
            .iter()
            .zip(&self.tiles)
            .all(|(expected, tile)| *expected == tile.id)
    }

}

impl Default for MetatileId {
    fn default() -> Self {
        Self {
            lt: TileId::default(),
            width: 1,
            height: 1,
        }
    }
}
