//! Style document rendering
//!
//! Builds the minimal style documents handed to the tile engine: a single
//! raster source per layer and, for hex picking, a GeoJSON overlay of hex
//! polygons whose fill color is keyed off a `status` property.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::app::hex::{Hex, HexGrid};
use crate::app::layers::Layer;
use crate::constants::style;
use crate::errors::StyleResult;

/// Download state of a hex shown in the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HexStatus {
    Downloaded,
    Downloading,
    None,
}

impl HexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HexStatus::Downloaded => "downloaded",
            HexStatus::Downloading => "downloading",
            HexStatus::None => "none",
        }
    }
}

/// Top-level style document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleDocument {
    pub version: u8,
    pub sources: BTreeMap<String, Source>,
    pub layers: Vec<StyleLayer>,
}

/// A style source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Source {
    Raster {
        tiles: Vec<String>,
        #[serde(rename = "tileSize")]
        tile_size: u32,
    },
    Geojson {
        data: Value,
    },
}

/// A paint layer referencing a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleLayer {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paint: Option<Value>,
}

impl StyleDocument {
    pub fn to_json(&self) -> StyleResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Renders style documents for layers and hex overlays
pub struct StyleDocumentBuilder;

impl StyleDocumentBuilder {
    /// Style with no sources and no layers
    pub fn empty_style() -> StyleDocument {
        StyleDocument {
            version: style::STYLE_VERSION,
            sources: BTreeMap::new(),
            layers: Vec::new(),
        }
    }

    /// Style with one raster source for `layer`
    pub fn raster_style(layer: &Layer) -> StyleDocument {
        let mut doc = Self::empty_style();
        doc.sources.insert(
            layer.id.clone(),
            Source::Raster {
                tiles: vec![layer.tile_url_template.clone()],
                tile_size: style::RASTER_TILE_SIZE,
            },
        );
        doc.layers.push(StyleLayer {
            id: layer.id.clone(),
            kind: "raster".to_string(),
            source: layer.id.clone(),
            paint: None,
        });
        doc
    }

    /// Raster style plus a hex overlay
    ///
    /// Every hex in `hexes` becomes a polygon feature; hexes missing from
    /// `statuses` are rendered as [`HexStatus::None`].
    pub fn hex_overlay_style(
        layer: &Layer,
        grid: &HexGrid,
        hexes: &[Hex],
        statuses: &HashMap<Hex, HexStatus>,
    ) -> StyleDocument {
        let mut doc = Self::raster_style(layer);

        let features: Vec<Value> = hexes
            .iter()
            .map(|hex| {
                let status = statuses.get(hex).copied().unwrap_or(HexStatus::None);
                json!({
                    "type": "Feature",
                    "properties": { "id": hex.id(), "status": status.as_str() },
                    "geometry": {
                        "type": "Polygon",
                        "coordinates": grid.hex_polygon_coordinates(hex),
                    },
                })
            })
            .collect();

        doc.sources.insert(
            style::HEX_SOURCE_ID.to_string(),
            Source::Geojson {
                data: json!({ "type": "FeatureCollection", "features": features }),
            },
        );

        doc.layers.push(StyleLayer {
            id: style::HEX_FILL_LAYER_ID.to_string(),
            kind: "fill".to_string(),
            source: style::HEX_SOURCE_ID.to_string(),
            paint: Some(json!({
                "fill-color": [
                    "match", ["get", "status"],
                    "downloaded", style::HEX_COLOR_DOWNLOADED,
                    "downloading", style::HEX_COLOR_DOWNLOADING,
                    style::HEX_COLOR_NONE
                ],
                "fill-opacity": [
                    "match", ["get", "status"],
                    "none", 0.0,
                    style::HEX_FILL_OPACITY
                ],
            })),
        });
        doc.layers.push(StyleLayer {
            id: style::HEX_OUTLINE_LAYER_ID.to_string(),
            kind: "line".to_string(),
            source: style::HEX_SOURCE_ID.to_string(),
            paint: Some(json!({
                "line-color": [
                    "match", ["get", "status"],
                    "downloaded", style::HEX_COLOR_DOWNLOADED,
                    "downloading", style::HEX_COLOR_DOWNLOADING,
                    "#555555"
                ],
                "line-width": 1.0,
            })),
        });

        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::layers::LayerRegistry;

    #[test]
    fn test_empty_style_shape() {
        let json: Value = serde_json::from_str(&StyleDocumentBuilder::empty_style().to_json().unwrap()).unwrap();
        assert_eq!(json, json!({ "version": 8, "sources": {}, "layers": [] }));
    }

    #[test]
    fn test_raster_style_references_template() {
        let registry = LayerRegistry::builtin();
        let layer = registry.resolve("osm");
        let json: Value = serde_json::from_str(&StyleDocumentBuilder::raster_style(layer).to_json().unwrap()).unwrap();

        assert_eq!(json["version"], 8);
        assert_eq!(json["sources"]["osm"]["type"], "raster");
        assert_eq!(json["sources"]["osm"]["tileSize"], 256);
        assert_eq!(json["sources"]["osm"]["tiles"][0], layer.tile_url_template.as_str());
        assert_eq!(json["layers"][0]["source"], "osm");
        assert!(json["layers"][0].get("paint").is_none());
    }

    #[test]
    fn test_hex_overlay_marks_status() {
        let registry = LayerRegistry::builtin();
        let grid = HexGrid::default();
        let hexes = vec![Hex::new(0, 0), Hex::new(1, 0), Hex::new(2, 0)];
        let mut statuses = HashMap::new();
        statuses.insert(Hex::new(0, 0), HexStatus::Downloaded);
        statuses.insert(Hex::new(1, 0), HexStatus::Downloading);

        let doc = StyleDocumentBuilder::hex_overlay_style(registry.default_layer(), &grid, &hexes, &statuses);
        let json: Value = serde_json::from_str(&doc.to_json().unwrap()).unwrap();

        let features = json["sources"]["hexgrid"]["data"]["features"].as_array().unwrap();
        assert_eq!(json["sources"]["hexgrid"]["type"], "geojson");
        assert_eq!(features.len(), 3);
        assert_eq!(features[0]["properties"]["status"], "downloaded");
        assert_eq!(features[1]["properties"]["status"], "downloading");
        assert_eq!(features[2]["properties"]["status"], "none");
        assert_eq!(features[2]["properties"]["id"], "hex_2_0");
        assert_eq!(features[0]["geometry"]["coordinates"][0].as_array().unwrap().len(), 7);

        let layer_ids: Vec<&str> = json["layers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["id"].as_str().unwrap())
            .collect();
        assert_eq!(layer_ids, vec!["kartverket", "hexgrid-fill", "hexgrid-outline"]);
    }

    #[test]
    fn test_style_document_deserializes_back() {
        let registry = LayerRegistry::builtin();
        let doc = StyleDocumentBuilder::raster_style(registry.default_layer());
        let parsed: StyleDocument = serde_json::from_str(&doc.to_json().unwrap()).unwrap();
        assert_eq!(parsed, doc);
    }
}
