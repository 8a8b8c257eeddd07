//! Core application logic for Offline Regions
//!
//! This module contains the hex grid, the layer registry and style
//! documents, the loopback style server, tile estimation, the tile engine
//! contract with its simulated implementation, status persistence, and the
//! offline region manager that ties them together.
//!
//! # Examples
//!
//! ```rust
//! use offline_regions::app::{BoundingBox, HexGrid, estimate};
//!
//! let grid = HexGrid::default();
//! let oslo = BoundingBox::new(59.8, 10.5, 60.0, 10.9);
//!
//! let hex = grid.hex_at_point(59.91, 10.75).unwrap();
//! assert!(grid.hexes_in_bounds(&oslo).contains(&hex));
//! assert!(estimate(&oslo, 5, 12) >= 1);
//! ```

pub mod engine;
pub mod estimate;
pub mod hex;
pub mod layers;
pub mod manager;
pub mod models;
pub mod server;
pub mod store;
pub mod style;

// Re-export main public API
pub use engine::{
    EngineEvent, EngineEventKind, EngineHandle, EnginePackState, PackProgress, PackRequest,
    SimulatedEngine, SimulatedEngineConfig, StoredPack, TileEngine,
};
pub use estimate::{estimate, estimate_range, exact_count};
pub use hex::{Hex, HexGrid, HexGridConfig};
pub use layers::{Layer, LayerRegistry};
pub use manager::{
    DownloadSubscription, ManagerConfig, ManagerNotice, OfflineRegionManager, PackState,
};
pub use models::{
    BoundingBox, DownloadEvent, DownloadKey, LatLng, LayerStats, PackMetadata, ProgressSnapshot,
    Region, RegionStatus, ZoomRange,
};
pub use server::LocalStyleServer;
pub use store::PersistedStatusStore;
pub use style::{HexStatus, StyleDocument, StyleDocumentBuilder};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_structure() {
        // Ensure public API is accessible
        let registry = LayerRegistry::default();
        assert_eq!(registry.default_layer().id, "kartverket");
        assert_eq!(ManagerConfig::default().reload_dirty_window.as_secs(), 2);
    }
}
