//! Deterministic flat-top hexagonal grid
//!
//! The grid partitions the map into hexagonal cells used to pick download
//! areas visually. Cells are addressed by `(col, row)` in an offset layout:
//! columns are spaced 1.5 half-widths apart and odd columns are shifted up
//! by half a cell height so that adjacent columns interlock.
//!
//! Cell sizing is a policy choice. The half-height is derived from the
//! half-width and a target latitude band so that cells look regular on a
//! Web Mercator map at that latitude:
//!
//! ```text
//! half_height = half_width * cos(latitude_band) * sqrt(3) / 2
//! ```
//!
//! Longitudes are not wrapped at the antimeridian.
//!
//! # Examples
//!
//! ```rust
//! use offline_regions::app::hex::{Hex, HexGrid};
//!
//! let grid = HexGrid::default();
//! let hex = grid.hex_at_point(59.91, 10.75).unwrap();
//! let parsed: Hex = hex.id().parse().unwrap();
//! assert_eq!(parsed, hex);
//! assert!(grid.hex_bounds(&hex).contains(59.91, 10.75));
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::app::models::{BoundingBox, LatLng};
use crate::constants::grid;
use crate::errors::{GridError, GridResult};

const SQRT_3_OVER_2: f64 = 0.866_025_403_784_438_6;

/// One cell of the hex grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hex {
    pub col: i32,
    pub row: i32,
}

impl Hex {
    pub fn new(col: i32, row: i32) -> Self {
        Self { col, row }
    }

    /// Identifier of the form `hex_{col}_{row}`
    pub fn id(&self) -> String {
        self.to_string()
    }

    fn is_odd_column(&self) -> bool {
        self.col.rem_euclid(2) == 1
    }
}

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}_{}", grid::HEX_ID_PREFIX, self.col, self.row)
    }
}

impl FromStr for Hex {
    type Err = GridError;

    /// Parse an id, splitting column and row on the last `_`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || GridError::InvalidId { id: s.to_string() };

        let rest = s.strip_prefix(grid::HEX_ID_PREFIX).ok_or_else(invalid)?;
        let (col, row) = rest.rsplit_once('_').ok_or_else(invalid)?;
        let col = col.parse::<i32>().map_err(|_| invalid())?;
        let row = row.parse::<i32>().map_err(|_| invalid())?;

        Ok(Self { col, row })
    }
}

/// Grid sizing parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HexGridConfig {
    /// Half the cell width in degrees of longitude
    pub half_width_deg: f64,
    /// Latitude at which cells render regular
    pub latitude_band_deg: f64,
    /// Center of hex (0, 0)
    pub origin: LatLng,
}

impl Default for HexGridConfig {
    fn default() -> Self {
        Self {
            half_width_deg: grid::DEFAULT_HALF_WIDTH_DEG,
            latitude_band_deg: grid::DEFAULT_LATITUDE_BAND_DEG,
            origin: LatLng::new(grid::DEFAULT_ORIGIN_LAT, grid::DEFAULT_ORIGIN_LON),
        }
    }
}

/// Hexagonal partition of the map
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HexGrid {
    config: HexGridConfig,
    half_width: f64,
    half_height: f64,
}

impl Default for HexGrid {
    fn default() -> Self {
        // Default constants are known to be valid.
        Self::from_valid_config(HexGridConfig::default())
    }
}

impl HexGrid {
    /// Create a grid, validating the sizing parameters
    ///
    /// # Errors
    ///
    /// Returns `GridError::InvalidParameter` if the half-width is not a
    /// finite number of at least `grid::MIN_HALF_WIDTH_DEG` or the latitude band
    /// is outside `(-90, 90)`.
    pub fn new(config: HexGridConfig) -> GridResult<Self> {
        if !config.half_width_deg.is_finite() || config.half_width_deg < grid::MIN_HALF_WIDTH_DEG {
            return Err(GridError::InvalidParameter {
                field: "half_width_deg".to_string(),
                value: config.half_width_deg,
            });
        }
        if !config.latitude_band_deg.is_finite() || config.latitude_band_deg.abs() >= 90.0 {
            return Err(GridError::InvalidParameter {
                field: "latitude_band_deg".to_string(),
                value: config.latitude_band_deg,
            });
        }
        Ok(Self::from_valid_config(config))
    }

    fn from_valid_config(config: HexGridConfig) -> Self {
        let half_width = config.half_width_deg;
        let half_height = half_width * config.latitude_band_deg.to_radians().cos() * SQRT_3_OVER_2;
        Self {
            config,
            half_width,
            half_height,
        }
    }

    pub fn config(&self) -> &HexGridConfig {
        &self.config
    }

    pub fn half_width(&self) -> f64 {
        self.half_width
    }

    pub fn half_height(&self) -> f64 {
        self.half_height
    }

    fn col_step(&self) -> f64 {
        1.5 * self.half_width
    }

    fn row_step(&self) -> f64 {
        2.0 * self.half_height
    }

    fn column_offset(&self, col: i32) -> f64 {
        if Hex::new(col, 0).is_odd_column() {
            self.half_height
        } else {
            0.0
        }
    }

    /// Center of a hex
    pub fn hex_center(&self, hex: &Hex) -> LatLng {
        let lon = self.config.origin.lon + hex.col as f64 * self.col_step();
        let lat = self.config.origin.lat + hex.row as f64 * self.row_step() + self.column_offset(hex.col);
        LatLng::new(lat, lon)
    }

    /// Closed ring of the six flat-top corners, counter-clockwise from east
    pub fn hex_vertices(&self, hex: &Hex) -> [LatLng; 7] {
        let c = self.hex_center(hex);
        let (w, hw, h) = (self.half_width, self.half_width / 2.0, self.half_height);
        [
            LatLng::new(c.lat, c.lon + w),
            LatLng::new(c.lat + h, c.lon + hw),
            LatLng::new(c.lat + h, c.lon - hw),
            LatLng::new(c.lat, c.lon - w),
            LatLng::new(c.lat - h, c.lon - hw),
            LatLng::new(c.lat - h, c.lon + hw),
            LatLng::new(c.lat, c.lon + w),
        ]
    }

    /// Axis-aligned box enclosing a hex
    pub fn hex_bounds(&self, hex: &Hex) -> BoundingBox {
        let c = self.hex_center(hex);
        BoundingBox::new(
            c.lat - self.half_height,
            c.lon - self.half_width,
            c.lat + self.half_height,
            c.lon + self.half_width,
        )
    }

    /// Every hex whose bounding box intersects `bbox`, ordered by column then row
    ///
    /// The box is clamped to the world first.
    pub fn hexes_in_bounds(&self, bbox: &BoundingBox) -> Vec<Hex> {
        let bbox = &BoundingBox::new(
            bbox.south.clamp(-90.0, 90.0),
            bbox.west.clamp(-180.0, 180.0),
            bbox.north.clamp(-90.0, 90.0),
            bbox.east.clamp(-180.0, 180.0),
        );
        let origin = self.config.origin;
        let col_min = ((bbox.west - self.half_width - origin.lon) / self.col_step()).floor() as i32;
        let col_max = ((bbox.east + self.half_width - origin.lon) / self.col_step()).ceil() as i32;

        let mut hexes = Vec::new();
        for col in col_min..=col_max {
            let base = origin.lat + self.column_offset(col);
            let row_min = ((bbox.south - self.half_height - base) / self.row_step()).floor() as i32;
            let row_max = ((bbox.north + self.half_height - base) / self.row_step()).ceil() as i32;

            for row in row_min..=row_max {
                let hex = Hex::new(col, row);
                if self.hex_bounds(&hex).intersects(bbox) {
                    hexes.push(hex);
                }
            }
        }
        hexes
    }

    /// Hex whose center is nearest the point
    ///
    /// Distance is measured in coordinates scaled so the cells are regular
    /// hexagons, which makes nearest-center assignment identical to
    /// containment. Near the slanted edges the enclosing bounding boxes
    /// overlap, so candidates in the neighbouring columns and rows are
    /// compared rather than trusting the box.
    ///
    /// # Errors
    ///
    /// Returns `GridError::PointOutOfRange` for coordinates outside the
    /// world or not finite.
    pub fn hex_at_point(&self, lat: f64, lon: f64) -> GridResult<Hex> {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return Err(GridError::PointOutOfRange { lat, lon });
        }

        let origin = self.config.origin;
        let approx_col = ((lon - origin.lon) / self.col_step()).round() as i32;
        let y_scale = self.half_height / SQRT_3_OVER_2;

        let mut best: Option<(f64, Hex)> = None;
        for col in approx_col.saturating_sub(1)..=approx_col.saturating_add(1) {
            let base = origin.lat + self.column_offset(col);
            let approx_row = ((lat - base) / self.row_step()).round() as i32;

            for row in approx_row.saturating_sub(1)..=approx_row.saturating_add(1) {
                let hex = Hex::new(col, row);
                let center = self.hex_center(&hex);
                let dx = (lon - center.lon) / self.half_width;
                let dy = (lat - center.lat) / y_scale;
                let dist = dx * dx + dy * dy;

                let closer = match best {
                    None => true,
                    Some((best_dist, best_hex)) => {
                        dist < best_dist || (dist == best_dist && hex < best_hex)
                    }
                };
                if closer {
                    best = Some((dist, hex));
                }
            }
        }

        // The candidate neighbourhood is never empty.
        Ok(best.map(|(_, hex)| hex).unwrap_or(Hex::new(approx_col, 0)))
    }

    /// GeoJSON polygon coordinates (`[lon, lat]` pairs) for a hex
    pub fn hex_polygon_coordinates(&self, hex: &Hex) -> Vec<Vec<[f64; 2]>> {
        vec![self
            .hex_vertices(hex)
            .iter()
            .map(|p| [p.lon, p.lat])
            .collect()]
    }
}
