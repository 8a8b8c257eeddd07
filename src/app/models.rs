//! Core data models for offline regions
//!
//! This module contains the value types shared by the grid, the engine
//! contract and the manager: coordinates, regions, download keys, pack
//! metadata and progress snapshots.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::manager::MAX_ZOOM;
use crate::errors::{RegionError, StoreError};

/// Geographic coordinate in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lon: f64,
}

impl LatLng {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Axis-aligned bounding box in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl BoundingBox {
    /// Create a bounding box without validation
    ///
    /// Hex-derived boxes may extend past ±180° longitude, so only user
    /// input goes through [`BoundingBox::validated`].
    pub fn new(south: f64, west: f64, north: f64, east: f64) -> Self {
        Self {
            south,
            west,
            north,
            east,
        }
    }

    /// Create a bounding box, rejecting inverted or out-of-range edges
    pub fn validated(south: f64, west: f64, north: f64, east: f64) -> Result<Self, RegionError> {
        if !(-90.0..=90.0).contains(&south) || !(-90.0..=90.0).contains(&north) {
            return Err(RegionError::InvalidBounds {
                reason: format!("latitude out of range: south={}, north={}", south, north),
            });
        }
        if !(-180.0..=180.0).contains(&west) || !(-180.0..=180.0).contains(&east) {
            return Err(RegionError::InvalidBounds {
                reason: format!("longitude out of range: west={}, east={}", west, east),
            });
        }
        if south > north || west > east {
            return Err(RegionError::InvalidBounds {
                reason: format!(
                    "inverted edges: south={}, west={}, north={}, east={}",
                    south, west, north, east
                ),
            });
        }
        Ok(Self::new(south, west, north, east))
    }

    /// Latitude span in degrees
    pub fn lat_span(&self) -> f64 {
        self.north - self.south
    }

    /// Longitude span in degrees
    pub fn lon_span(&self) -> f64 {
        self.east - self.west
    }

    /// Check whether a point lies inside or on the edge of the box
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.south && lat <= self.north && lon >= self.west && lon <= self.east
    }

    /// Check whether two boxes overlap, edges included
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.south <= other.north
            && self.north >= other.south
            && self.west <= other.east
            && self.east >= other.west
    }
}

impl FromStr for BoundingBox {
    type Err = RegionError;

    /// Parse `south,west,north,east`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|e| RegionError::InvalidBounds {
                reason: format!("'{}': {}", s, e),
            })?;

        match parts.as_slice() {
            [south, west, north, east] => Self::validated(*south, *west, *north, *east),
            _ => Err(RegionError::InvalidBounds {
                reason: format!("'{}': expected south,west,north,east", s),
            }),
        }
    }
}

/// A named geographic area targeted for offline caching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    name: String,
    bounding_box: BoundingBox,
    polygon: Option<Vec<Vec<LatLng>>>,
}

impl Region {
    /// Create a region covering a bounding box
    pub fn new(name: impl Into<String>, bounding_box: BoundingBox) -> Result<Self, RegionError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(RegionError::EmptyName);
        }
        Ok(Self {
            name,
            bounding_box,
            polygon: None,
        })
    }

    /// Attach polygon rings describing the exact outline
    pub fn with_polygon(mut self, rings: Vec<Vec<LatLng>>) -> Self {
        self.polygon = Some(rings);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bounding_box(&self) -> &BoundingBox {
        &self.bounding_box
    }

    pub fn polygon(&self) -> Option<&[Vec<LatLng>]> {
        self.polygon.as_deref()
    }
}

/// Inclusive zoom level range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoomRange {
    pub min: u8,
    pub max: u8,
}

impl ZoomRange {
    pub fn new(min: u8, max: u8) -> Result<Self, RegionError> {
        if min > max || max > MAX_ZOOM {
            return Err(RegionError::InvalidZoomRange { min, max });
        }
        Ok(Self { min, max })
    }
}

/// Stable identity of a pack: `region_name + "-" + layer_id`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DownloadKey {
    region_name: String,
    layer_id: String,
}

impl DownloadKey {
    pub fn new(region_name: impl Into<String>, layer_id: impl Into<String>) -> Self {
        Self {
            region_name: region_name.into(),
            layer_id: layer_id.into(),
        }
    }

    pub fn region_name(&self) -> &str {
        &self.region_name
    }

    pub fn layer_id(&self) -> &str {
        &self.layer_id
    }
}

impl fmt::Display for DownloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.region_name, self.layer_id)
    }
}

impl FromStr for DownloadKey {
    type Err = RegionError;

    /// Split on the last `-`; layer ids never contain one
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('-') {
            Some((name, layer)) if !name.is_empty() && !layer.is_empty() => {
                Ok(Self::new(name, layer))
            }
            _ => Err(RegionError::InvalidKey { key: s.to_string() }),
        }
    }
}

/// Metadata attached to every engine pack so it can be re-identified
/// after a restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackMetadata {
    pub name: String,
    pub layer: String,
}

impl PackMetadata {
    pub fn for_key(key: &DownloadKey) -> Self {
        Self {
            name: key.region_name().to_string(),
            layer: key.layer_id().to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // Two plain strings always serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn key(&self) -> DownloadKey {
        DownloadKey::new(&self.name, &self.layer)
    }
}

/// Download progress of one pack
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub downloaded_tiles: u64,
    pub total_tiles: u64,
    pub downloaded_bytes: u64,
    pub is_complete: bool,
}

impl ProgressSnapshot {
    pub fn new(downloaded_tiles: u64, total_tiles: u64, downloaded_bytes: u64, is_complete: bool) -> Self {
        Self {
            downloaded_tiles,
            total_tiles,
            downloaded_bytes,
            is_complete,
        }
    }

    /// Completion percentage in `0.0..=100.0`
    pub fn percent(&self) -> f64 {
        if self.is_complete {
            return 100.0;
        }
        if self.total_tiles == 0 {
            return 0.0;
        }
        (self.downloaded_tiles as f64 / self.total_tiles as f64 * 100.0).min(100.0)
    }

    /// Whether any tiles have been observed at all
    pub fn is_trivial(&self) -> bool {
        self.downloaded_tiles == 0 && !self.is_complete
    }

    /// Merge a newer observation without letting downloaded counts regress
    ///
    /// Suspending a pack may reset the engine's counters; the higher of the
    /// two observations wins for tiles and bytes, and completion is sticky.
    pub fn merged_with(&self, newer: &ProgressSnapshot) -> ProgressSnapshot {
        if newer.downloaded_tiles >= self.downloaded_tiles {
            ProgressSnapshot {
                downloaded_bytes: newer.downloaded_bytes.max(self.downloaded_bytes),
                is_complete: newer.is_complete || self.is_complete,
                total_tiles: if newer.total_tiles > 0 {
                    newer.total_tiles
                } else {
                    self.total_tiles
                },
                ..*newer
            }
        } else {
            ProgressSnapshot {
                is_complete: self.is_complete || newer.is_complete,
                total_tiles: self.total_tiles.max(newer.total_tiles),
                ..*self
            }
        }
    }

    /// Encode as `downloaded,total,bytes,complete`
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.downloaded_tiles, self.total_tiles, self.downloaded_bytes, self.is_complete
        )
    }
}

impl FromStr for ProgressSnapshot {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| StoreError::InvalidEntry {
            value: s.to_string(),
            reason,
        };

        let fields: Vec<&str> = s.split(',').map(str::trim).collect();
        let [downloaded, total, bytes, complete] = fields.as_slice() else {
            return Err(invalid(format!("expected 4 fields, found {}", fields.len())));
        };

        let number = |field: &str| {
            field
                .parse::<u64>()
                .map_err(|e| invalid(format!("'{}': {}", field, e)))
        };
        let is_complete = match *complete {
            "true" | "1" => true,
            "false" | "0" => false,
            other => return Err(invalid(format!("'{}' is not a boolean", other))),
        };

        Ok(Self {
            downloaded_tiles: number(downloaded)?,
            total_tiles: number(total)?,
            downloaded_bytes: number(bytes)?,
            is_complete,
        })
    }
}

/// Answer to a region status query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionStatus {
    /// Data is not available yet; poll again shortly
    Pending,
    /// Best known progress for the region
    Snapshot(ProgressSnapshot),
    /// No pack is known under this key
    NotFound,
}

impl RegionStatus {
    /// Legacy compact tuple; `Pending` maps to all `-1`, `NotFound` to zeros
    pub fn to_tuple(&self) -> (i64, i64, i64, bool) {
        match self {
            RegionStatus::Pending => (-1, -1, -1, false),
            RegionStatus::NotFound => (0, 0, 0, false),
            RegionStatus::Snapshot(s) => (
                s.downloaded_tiles as i64,
                s.total_tiles as i64,
                s.downloaded_bytes as i64,
                s.is_complete,
            ),
        }
    }

    pub fn snapshot(&self) -> Option<&ProgressSnapshot> {
        match self {
            RegionStatus::Snapshot(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, RegionStatus::Pending)
    }
}

/// Aggregated storage used by one layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerStats {
    /// Some packs have not reported progress yet; poll again shortly
    Pending,
    /// Totals across every known pack of the layer
    Totals { bytes: u64, tiles: u64 },
}

impl LayerStats {
    pub fn is_pending(&self) -> bool {
        matches!(self, LayerStats::Pending)
    }
}

/// Event delivered to a download subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    /// Progress changed
    Progress(ProgressSnapshot),
    /// Download finished; no further events follow
    Completed(ProgressSnapshot),
    /// Download aborted on a permanent engine error; no further events follow
    Failed { message: String },
}

impl DownloadEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DownloadEvent::Progress(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_key_round_trip_with_dashes_in_name() {
        let key = DownloadKey::new("Nord-Trøndelag", "kartverket");
        assert_eq!(key.to_string(), "Nord-Trøndelag-kartverket");

        let parsed: DownloadKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
        assert_eq!(parsed.region_name(), "Nord-Trøndelag");
        assert_eq!(parsed.layer_id(), "kartverket");
    }

    #[test]
    fn test_download_key_rejects_missing_parts() {
        assert!("kartverket".parse::<DownloadKey>().is_err());
        assert!("-kartverket".parse::<DownloadKey>().is_err());
        assert!("Oslo-".parse::<DownloadKey>().is_err());
    }

    #[test]
    fn test_progress_snapshot_encoding() {
        let snapshot = ProgressSnapshot::new(1200, 4000, 22_118_400, false);
        assert_eq!(snapshot.encode(), "1200,4000,22118400,false");

        let decoded: ProgressSnapshot = "1200,4000,22118400,false".parse().unwrap();
        assert_eq!(decoded, snapshot);

        let complete: ProgressSnapshot = "10, 10, 512, true".parse().unwrap();
        assert!(complete.is_complete);
    }

    #[test]
    fn test_progress_snapshot_rejects_garbage() {
        assert!("1,2,3".parse::<ProgressSnapshot>().is_err());
        assert!("a,2,3,true".parse::<ProgressSnapshot>().is_err());
        assert!("1,2,3,maybe".parse::<ProgressSnapshot>().is_err());
        assert!("-1,-1,-1,-1".parse::<ProgressSnapshot>().is_err());
    }

    #[test]
    fn test_merge_never_regresses() {
        let before = ProgressSnapshot::new(500, 1000, 9000, false);
        let reset = ProgressSnapshot::new(0, 1000, 0, false);
        assert_eq!(before.merged_with(&reset), before);

        let later = ProgressSnapshot::new(700, 1000, 12000, false);
        assert_eq!(before.merged_with(&later), later);

        let done = ProgressSnapshot::new(1000, 1000, 18000, true);
        assert!(later.merged_with(&done).is_complete);
    }

    #[test]
    fn test_bounding_box_parsing_and_validation() {
        let bbox: BoundingBox = "59.8,10.5,60.0,10.9".parse().unwrap();
        assert_eq!(bbox.south, 59.8);
        assert_eq!(bbox.east, 10.9);
        assert!(bbox.contains(59.9, 10.7));

        assert!("60.0,10.5,59.8,10.9".parse::<BoundingBox>().is_err());
        assert!("95,0,96,1".parse::<BoundingBox>().is_err());
        assert!("1,2,3".parse::<BoundingBox>().is_err());
    }

    #[test]
    fn test_region_status_legacy_tuple() {
        assert_eq!(RegionStatus::Pending.to_tuple(), (-1, -1, -1, false));
        let status = RegionStatus::Snapshot(ProgressSnapshot::new(5, 10, 100, false));
        assert_eq!(status.to_tuple(), (5, 10, 100, false));
    }

    #[test]
    fn test_pack_metadata_round_trip() {
        let key = DownloadKey::new("Oslo", "kartverket");
        let meta = PackMetadata::for_key(&key);
        let decoded = PackMetadata::decode(&meta.encode()).unwrap();
        assert_eq!(decoded.key(), key);
        assert!(PackMetadata::decode(b"not json").is_err());
    }

    #[test]
    fn test_zoom_range_validation() {
        assert!(ZoomRange::new(5, 12).is_ok());
        assert!(ZoomRange::new(12, 5).is_err());
        assert!(ZoomRange::new(0, 23).is_err());
    }
}
