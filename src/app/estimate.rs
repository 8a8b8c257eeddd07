//! Tile count estimation
//!
//! [`estimate`] gives the quick area-proportional figure shown before the
//! engine reports an authoritative total. [`exact_count`] walks the Web
//! Mercator tile ranges and is used where the real number is needed.

use std::f64::consts::PI;

use crate::app::models::{BoundingBox, ZoomRange};

/// Latitude limit of the Web Mercator projection
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_78;

/// Approximate tile count for `bbox` across `min_zoom..=max_zoom`
///
/// Each zoom contributes `(lat_span/180) * (lon_span/360) * 4^zoom`; the
/// sum is floored to at least 1.
pub fn estimate(bbox: &BoundingBox, min_zoom: u8, max_zoom: u8) -> u64 {
    let fraction = (bbox.lat_span().abs() / 180.0) * (bbox.lon_span().abs() / 360.0);
    let total: f64 = (min_zoom..=max_zoom)
        .map(|z| fraction * 4f64.powi(z as i32))
        .sum();

    (total.floor() as u64).max(1)
}

/// Convenience wrapper over [`estimate`] for a [`ZoomRange`]
pub fn estimate_range(bbox: &BoundingBox, zoom: ZoomRange) -> u64 {
    estimate(bbox, zoom.min, zoom.max)
}

/// Exact number of Web Mercator tiles touched by `bbox` across the range
pub fn exact_count(bbox: &BoundingBox, zoom: ZoomRange) -> u64 {
    (zoom.min..=zoom.max)
        .map(|z| {
            let (x_min, y_min) = tile_xy(bbox.north, bbox.west, z);
            let (x_max, y_max) = tile_xy(bbox.south, bbox.east, z);
            (x_max - x_min + 1) * (y_max - y_min + 1)
        })
        .sum()
}

/// Tile column/row containing a point, clamped to the valid range
fn tile_xy(lat: f64, lon: f64, zoom: u8) -> (u64, u64) {
    let n = 2f64.powi(zoom as i32);
    let max_index = n - 1.0;

    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    let lon = lon.clamp(-180.0, 180.0);

    let x = ((lon + 180.0) / 360.0 * n).floor().clamp(0.0, max_index);
    let lat_rad = lat.to_radians();
    let y = ((1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n)
        .floor()
        .clamp(0.0, max_index);

    (x as u64, y as u64)
}
