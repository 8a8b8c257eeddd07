//! Map layer registry
//!
//! A static table of the raster layers that can be cached offline. The
//! table is built once at startup from the built-in layers plus any extra
//! layers from configuration and is never mutated afterwards.

use serde::{Deserialize, Serialize};

use crate::constants::style::DEFAULT_LAYER_ID;
use crate::errors::{StyleError, StyleResult};

/// A raster map layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub id: String,
    pub display_name: String,
    pub tile_url_template: String,
}

impl Layer {
    /// Create a layer, rejecting ids that would make download keys ambiguous
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        tile_url_template: impl Into<String>,
    ) -> StyleResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(StyleError::InvalidLayerId {
                id,
                reason: "must not be empty".to_string(),
            });
        }
        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StyleError::InvalidLayerId {
                id,
                reason: "only ASCII letters, digits and '_' are allowed".to_string(),
            });
        }
        Ok(Self {
            id,
            display_name: display_name.into(),
            tile_url_template: tile_url_template.into(),
        })
    }
}

const BUILTIN_LAYERS: &[(&str, &str, &str)] = &[
    (
        "kartverket",
        "Kartverket Topo",
        "https://cache.kartverket.no/v1/wmts/1.0.0/topo/default/webmercator/{z}/{y}/{x}.png",
    ),
    (
        "toporaster",
        "Kartverket Toporaster",
        "https://cache.kartverket.no/v1/wmts/1.0.0/toporaster/default/webmercator/{z}/{y}/{x}.png",
    ),
    (
        "sjokart",
        "Kartverket Sjøkart",
        "https://cache.kartverket.no/v1/wmts/1.0.0/sjokartraster/default/webmercator/{z}/{y}/{x}.png",
    ),
    (
        "osm",
        "OpenStreetMap",
        "https://tile.openstreetmap.org/{z}/{x}/{y}.png",
    ),
    (
        "opentopomap",
        "OpenTopoMap",
        "https://tile.opentopomap.org/{z}/{x}/{y}.png",
    ),
];

/// Lookup table of available layers
#[derive(Debug, Clone)]
pub struct LayerRegistry {
    layers: Vec<Layer>,
    default_index: usize,
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl LayerRegistry {
    /// Registry containing only the built-in layers
    pub fn builtin() -> Self {
        let layers: Vec<Layer> = BUILTIN_LAYERS
            .iter()
            .map(|(id, name, url)| Layer {
                id: id.to_string(),
                display_name: name.to_string(),
                tile_url_template: url.to_string(),
            })
            .collect();
        let default_index = layers
            .iter()
            .position(|l| l.id == DEFAULT_LAYER_ID)
            .unwrap_or(0);

        Self {
            layers,
            default_index,
        }
    }

    /// Built-in layers plus extra ones; an extra layer replaces a built-in
    /// layer with the same id
    pub fn with_layers(extra: impl IntoIterator<Item = Layer>) -> Self {
        let mut registry = Self::builtin();
        for layer in extra {
            match registry.layers.iter_mut().find(|l| l.id == layer.id) {
                Some(existing) => *existing = layer,
                None => registry.layers.push(layer),
            }
        }
        registry
    }

    pub fn get(&self, id: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    /// Look up a layer, falling back to the default layer for unknown ids
    pub fn resolve(&self, id: &str) -> &Layer {
        self.get(id).unwrap_or_else(|| self.default_layer())
    }

    pub fn default_layer(&self) -> &Layer {
        &self.layers[self.default_index]
    }

    pub fn all(&self) -> &[Layer] {
        &self.layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_ids_are_key_safe() {
        let registry = LayerRegistry::builtin();
        assert!(registry.all().len() >= 5);
        for layer in registry.all() {
            assert!(!layer.id.contains('-'), "{} contains '-'", layer.id);
            assert!(layer.tile_url_template.contains("{z}"));
        }
    }

    #[test]
    fn test_unknown_layer_falls_back_to_default() {
        let registry = LayerRegistry::builtin();
        assert_eq!(registry.resolve("does-not-exist").id, DEFAULT_LAYER_ID);
        assert_eq!(registry.resolve("osm").id, "osm");
        assert!(registry.get("does-not-exist").is_none());
    }

    #[test]
    fn test_extra_layers_extend_and_override() {
        let custom = Layer::new("local", "Local tiles", "http://localhost:9000/{z}/{x}/{y}.png").unwrap();
        let override_osm = Layer::new("osm", "OSM mirror", "https://osm.example.org/{z}/{x}/{y}.png").unwrap();
        let registry = LayerRegistry::with_layers(vec![custom, override_osm]);

        assert_eq!(registry.resolve("local").display_name, "Local tiles");
        assert_eq!(registry.resolve("osm").display_name, "OSM mirror");
        assert_eq!(registry.default_layer().id, DEFAULT_LAYER_ID);
    }

    #[test]
    fn test_layer_id_validation() {
        assert!(Layer::new("topo-2", "x", "y").is_err());
        assert!(Layer::new("", "x", "y").is_err());
        assert!(Layer::new("has space", "x", "y").is_err());
        assert!(Layer::new("kart/topo", "x", "y").is_err());
        assert!(Layer::new("topo2", "x", "y").is_ok());
    }
}
