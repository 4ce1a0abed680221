//! UTF-grid encoding of a rendered feature grid.
//!
//! Cells are sampled at a fixed resolution and mapped to codepoints starting
//! at 32; `"` and `\` are skipped per the UTF-grid encoding rules. The empty
//! key marks cells without a feature.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::render::engine::FeatureGrid;

pub fn encode_utfgrid(grid: &FeatureGrid, resolution: u32) -> String {
    let resolution = resolution.max(1);
    let mut key_codepoints: HashMap<&str, u32> = HashMap::new();
    let mut key_order: Vec<&str> = Vec::new();
    let mut rows: Vec<String> = Vec::new();

    let mut codepoint: u32 = 32;
    let mut y = 0;
    while y < grid.height {
        let mut line = String::new();
        let mut x = 0;
        while x < grid.width {
            let cell = grid.cells[(y * grid.width + x) as usize];
            let key = cell
                .and_then(|slot| grid.features.get(slot as usize))
                .map(|feature| feature.key.as_str())
                .unwrap_or("");
            let assigned = match key_codepoints.get(key) {
                Some(assigned) => *assigned,
                None => {
                    // Skip the codepoints that can't be encoded directly in
                    // JSON strings.
                    if codepoint == 34 {
                        codepoint += 1;
                    } else if codepoint == 92 {
                        codepoint += 1;
                    }
                    key_codepoints.insert(key, codepoint);
                    key_order.push(key);
                    let assigned = codepoint;
                    codepoint += 1;
                    assigned
                }
            };
            if let Some(ch) = char::from_u32(assigned) {
                line.push(ch);
            }
            x += resolution;
        }
        rows.push(line);
        y += resolution;
    }

    let mut data = Map::new();
    for key in &key_order {
        if key.is_empty() {
            continue;
        }
        let Some(feature) = grid.features.iter().find(|f| f.key == *key) else {
            continue;
        };
        if feature.attributes.is_empty() {
            continue;
        }
        data.insert(
            (*key).to_string(),
            Value::Object(feature.attributes.clone()),
        );
    }

    json!({
        "grid": rows,
        "keys": key_order,
        "data": data,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::engine::GridFeature;

    #[test]
    fn grid_assigns_codepoints_and_collects_data() {
        let mut grid = FeatureGrid::new(8, 8);
        grid.features.push(GridFeature {
            key: "12".to_string(),
            attributes: serde_json::json!({"name": "cafe"})
                .as_object()
                .unwrap()
                .clone(),
        });
        // Top-left 4x4 block belongs to the feature.
        for y in 0..4 {
            for x in 0..4 {
                grid.cells[(y * 8 + x) as usize] = Some(0);
            }
        }

        let encoded = encode_utfgrid(&grid, 4);
        let parsed: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        let rows = parsed["grid"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        // First sampled cell is the feature, the rest are empty.
        assert_eq!(rows[0].as_str().unwrap(), " !");
        assert_eq!(rows[1].as_str().unwrap(), "!!");
        assert_eq!(
            parsed["keys"],
            serde_json::json!(["12", ""])
        );
        assert_eq!(parsed["data"]["12"]["name"], "cafe");
    }

    #[test]
    fn quote_codepoint_is_skipped() {
        // Force enough distinct keys to cross codepoint 34.
        let mut grid = FeatureGrid::new(4, 1);
        for i in 0..4u32 {
            grid.features.push(GridFeature {
                key: format!("k{i}"),
                attributes: Map::new(),
            });
            grid.cells[i as usize] = Some(i);
        }
        let encoded = encode_utfgrid(&grid, 1);
        let parsed: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        let row = parsed["grid"][0].as_str().unwrap();
        let chars: Vec<char> = row.chars().collect();
        assert_eq!(chars, vec![' ', '!', '#', '$']);
    }
}
