//! Application constants for Offline Regions
//!
//! This module centralizes the constants used throughout the crate,
//! organized by functional domain.

use std::time::Duration;

/// Hex grid sizing
pub mod grid {
    /// Half the hexagon width, in degrees of longitude
    pub const DEFAULT_HALF_WIDTH_DEG: f64 = 0.5;

    /// Latitude at which hexagons render visually regular
    pub const DEFAULT_LATITUDE_BAND_DEG: f64 = 65.0;

    /// Latitude of the center of hex (0, 0)
    pub const DEFAULT_ORIGIN_LAT: f64 = 0.0;

    /// Longitude of the center of hex (0, 0)
    pub const DEFAULT_ORIGIN_LON: f64 = 0.0;

    /// Smallest accepted half width, keeping cell counts bounded
    pub const MIN_HALF_WIDTH_DEG: f64 = 0.001;

    /// Prefix of every hex identifier
    pub const HEX_ID_PREFIX: &str = "hex_";
}

/// Map layer and style constants
pub mod style {
    /// Style specification version emitted in every document
    pub const STYLE_VERSION: u8 = 8;

    /// Raster tile size advertised to the engine
    pub const RASTER_TILE_SIZE: u32 = 256;

    /// Layer used when an unknown id is requested
    pub const DEFAULT_LAYER_ID: &str = "kartverket";

    /// Source id of the hex overlay
    pub const HEX_SOURCE_ID: &str = "hexgrid";

    /// Fill layer id of the hex overlay
    pub const HEX_FILL_LAYER_ID: &str = "hexgrid-fill";

    /// Outline layer id of the hex overlay
    pub const HEX_OUTLINE_LAYER_ID: &str = "hexgrid-outline";

    /// Fill colors keyed by hex status
    pub const HEX_COLOR_DOWNLOADED: &str = "#2e7d32";
    pub const HEX_COLOR_DOWNLOADING: &str = "#f9a825";
    pub const HEX_COLOR_NONE: &str = "#000000";

    /// Fill opacity of the hex overlay
    pub const HEX_FILL_OPACITY: f64 = 0.25;
}

/// Local style server constants
pub mod server {
    use super::Duration;

    /// Default loopback port for the style server
    pub const DEFAULT_PORT: u16 = 8765;

    /// Loopback host the server binds and advertises
    pub const LOOPBACK_HOST: &str = "127.0.0.1";

    /// Path prefix under which styles are served
    pub const STYLE_PATH_PREFIX: &str = "/styles/";

    /// Suffix appended to a style name in its URL
    pub const STYLE_PATH_SUFFIX: &str = "-style.json";

    /// Time allowed for open connections to drain when the server stops
    pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Offline region manager constants
pub mod manager {
    use super::Duration;

    /// Window within which repeated reload requests are collapsed
    pub const RELOAD_DIRTY_WINDOW: Duration = Duration::from_secs(2);

    /// Capacity of the manager notice broadcast channel
    pub const NOTICE_CHANNEL_CAPACITY: usize = 64;

    /// Highest zoom level accepted for downloads
    pub const MAX_ZOOM: u8 = 22;
}

/// Simulated engine defaults
pub mod engine {
    use super::Duration;

    /// Interval between simulated progress ticks
    pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

    /// Tiles completed per simulated tick
    pub const DEFAULT_TILES_PER_TICK: u64 = 25;

    /// Average size of a simulated tile in bytes
    pub const DEFAULT_BYTES_PER_TILE: u64 = 18 * 1024;
}

/// File operation constants
pub mod files {
    /// Persisted status store file name
    pub const STATUS_STORE_FILE: &str = "offline_status.json";

    /// Simulated engine pack storage file name
    pub const ENGINE_STATE_FILE: &str = "engine_packs.json";

    /// Temporary file suffix for atomic writes
    pub const TEMP_FILE_SUFFIX: &str = ".tmp";

    /// Application directory name under the user config dir
    pub const APP_DIR_NAME: &str = "offline-regions";
}

/// Command-line front end constants
pub mod cli {
    use super::Duration;

    /// Wait between status polls while an answer is pending
    pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Give up waiting for a pending answer after this long
    pub const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Environment variable names
pub mod env {
    /// Overrides the configured data directory
    pub const DATA_DIR: &str = "OFFLINE_REGIONS_DATA_DIR";
}

/// Logging constants
pub mod logging {
    /// Default log level
    pub const DEFAULT_LOG_LEVEL: &str = "warn";
}

pub use files::{STATUS_STORE_FILE, TEMP_FILE_SUFFIX};
pub use server::DEFAULT_PORT;
pub use style::DEFAULT_LAYER_ID;
