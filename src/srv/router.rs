//! Tile request path grammar:
//! `/[v<digits>/][<endpoint>/][<tag>/...]<z>/<x>/<y>.<ext>`.
//!
//! A leading segment is a data version when it matches `v` followed by one
//! to five digits. The endpoint segment is looked up in the endpoint map;
//! requests without a matching segment use the empty-key default endpoint.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::{select_endpoint, EndpointKind, EndpointParams, EndpointsMap};
use crate::tile::TileId;
use crate::util::TileExtension;

/// Maps onto the HTTP error status for an unusable path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathError {
    BadRequest,
    NotFound,
}

#[derive(Debug)]
pub struct RoutedRequest {
    pub tile_id: TileId,
    pub tags: BTreeSet<String>,
    pub data_version: String,
    pub ext: TileExtension,
    pub endpoint: Arc<EndpointParams>,
}

fn is_version(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    (2..=6).contains(&bytes.len())
        && bytes[0] == b'v'
        && bytes[1..].iter().all(u8::is_ascii_digit)
}

fn parse_coord(segment: &str) -> Result<u32, PathError> {
    segment.parse().map_err(|_| PathError::BadRequest)
}

/// Resolves a request path against the endpoint map.
pub fn route(path: &str, endpoints: &EndpointsMap) -> Result<RoutedRequest, PathError> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 3 {
        return Err(PathError::BadRequest);
    }

    let mut data_version = String::new();
    let mut endpoint_sets: Option<&Vec<Arc<EndpointParams>>> = None;
    let mut first_tag = 0;
    if segments.len() > 3 {
        if is_version(segments[0]) {
            data_version = segments[0].to_string();
            if segments.len() > 4 {
                if let Some(sets) = endpoints.get(segments[1]) {
                    endpoint_sets = Some(sets);
                    first_tag = 2;
                } else {
                    first_tag = 1;
                }
            } else {
                first_tag = 1;
            }
        } else if let Some(sets) = endpoints.get(segments[0]) {
            endpoint_sets = Some(sets);
            first_tag = 1;
        }
    }

    let tags: BTreeSet<String> = segments[first_tag..segments.len() - 3]
        .iter()
        .map(|s| (*s).to_string())
        .collect();

    let endpoint_sets = match endpoint_sets {
        Some(sets) => sets,
        None => endpoints.get("").ok_or(PathError::NotFound)?,
    };

    let z = parse_coord(segments[segments.len() - 3])?;
    let x = parse_coord(segments[segments.len() - 2])?;
    let last = segments[segments.len() - 1];
    let (y_str, ext_str) = match last.split_once('.') {
        Some((y, ext)) => (y, ext),
        None => (last, ""),
    };
    let y = parse_coord(y_str)?;
    let ext = TileExtension::parse(ext_str).ok_or(PathError::NotFound)?;

    let tile_id = TileId::new(x, y, z);
    let endpoint = select_endpoint(endpoint_sets, z).ok_or(PathError::NotFound)?;
    check_params(&tile_id, ext, &endpoint)?;

    Ok(RoutedRequest {
        tile_id,
        tags,
        data_version,
        ext,
        endpoint,
    })
}

fn check_params(
    tile_id: &TileId,
    ext: TileExtension,
    endpoint: &EndpointParams,
) -> Result<(), PathError> {
    if !tile_id.valid() {
        return Err(PathError::BadRequest);
    }
    let valid = match ext {
        TileExtension::Png => endpoint.kind != EndpointKind::Mvt,
        TileExtension::Mvt => endpoint.kind == EndpointKind::Mvt,
        TileExtension::Json | TileExtension::Html => {
            endpoint.kind == EndpointKind::Render && endpoint.allow_utf_grid
        }
    };
    if valid {
        Ok(())
    } else {
        Err(PathError::BadRequest)
    }
}

/// Parses the `layers=a,b,c` query parameter when the endpoint allows it.
pub fn layers_from_query(
    query: &str,
    endpoint: &EndpointParams,
) -> Option<BTreeSet<String>> {
    if !endpoint.allow_layers_query {
        return None;
    }
    for pair in query.split('&') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        if name == "layers" && !value.is_empty() {
            return Some(
                value
                    .split(',')
                    .filter(|layer| !layer.is_empty())
                    .map(str::to_string)
                    .collect(),
            );
        }
    }
    None
}
