//! Configuration management for Offline Regions
//!
//! This module provides unified configuration management with automatic
//! first-run initialization, multi-source loading, and zero-config defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::app::{
    HexGridConfig, LatLng, Layer, LayerRegistry, ManagerConfig, SimulatedEngineConfig,
};
use crate::constants::{engine, env, files, grid, logging, manager, server};
use crate::errors::{ConfigError, Result};

/// Unified application configuration for TOML serialization
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Data directory settings
    pub storage: StorageConfigToml,
    /// Local style server settings
    pub server: ServerConfigToml,
    /// Hex grid parameters
    pub grid: GridConfigToml,
    /// Offline region manager settings
    pub manager: ManagerConfigToml,
    /// Simulated engine settings
    pub engine: EngineConfigToml,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Additional map layers
    pub layers: Vec<LayerConfigToml>,
}

/// TOML-friendly storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfigToml {
    /// Directory for the status store and engine packs (None = system default)
    pub data_dir: Option<PathBuf>,
}

/// TOML-friendly style server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfigToml {
    /// Loopback port (0 = ephemeral)
    pub port: u16,
}

impl Default for ServerConfigToml {
    fn default() -> Self {
        Self {
            port: server::DEFAULT_PORT,
        }
    }
}

/// TOML-friendly hex grid configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfigToml {
    /// Half hexagon width in degrees of longitude
    pub half_width_deg: f64,
    /// Latitude at which hexagons are regular
    pub latitude_band_deg: f64,
    /// Center of hex (0, 0)
    pub origin_lat: f64,
    pub origin_lon: f64,
}

impl Default for GridConfigToml {
    fn default() -> Self {
        Self {
            half_width_deg: grid::DEFAULT_HALF_WIDTH_DEG,
            latitude_band_deg: grid::DEFAULT_LATITUDE_BAND_DEG,
            origin_lat: grid::DEFAULT_ORIGIN_LAT,
            origin_lon: grid::DEFAULT_ORIGIN_LON,
        }
    }
}

/// TOML-friendly manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfigToml {
    /// Reload de-duplication window in milliseconds
    pub reload_dirty_window_ms: u64,
}

impl Default for ManagerConfigToml {
    fn default() -> Self {
        Self {
            reload_dirty_window_ms: manager::RELOAD_DIRTY_WINDOW.as_millis() as u64,
        }
    }
}

/// TOML-friendly simulated engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfigToml {
    /// Interval between progress ticks in milliseconds
    pub tick_interval_ms: u64,
    /// Tiles completed per tick
    pub tiles_per_tick: u64,
    /// Average tile size in bytes
    pub bytes_per_tile: u64,
    /// Tile cap per pack (None = unlimited)
    pub tile_limit: Option<u64>,
}

impl Default for EngineConfigToml {
    fn default() -> Self {
        Self {
            tick_interval_ms: engine::DEFAULT_TICK_INTERVAL.as_millis() as u64,
            tiles_per_tick: engine::DEFAULT_TILES_PER_TICK,
            bytes_per_tile: engine::DEFAULT_BYTES_PER_TILE,
            tile_limit: None,
        }
    }
}

/// TOML-friendly layer definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfigToml {
    pub id: String,
    pub display_name: String,
    pub tile_url_template: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level for the application
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: logging::DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

/// Validated settings ready to construct the application components
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    pub port: u16,
    pub grid: HexGridConfig,
    pub manager: ManagerConfig,
    pub engine: SimulatedEngineConfig,
    pub registry: LayerRegistry,
}

impl AppConfig {
    /// Convert TOML-friendly configuration to runtime configuration
    ///
    /// `data_dir_override` takes precedence over the environment and the file.
    pub fn to_runtime_config(
        &self,
        data_dir_override: Option<PathBuf>,
    ) -> std::result::Result<RuntimeConfig, ConfigError> {
        let data_dir = data_dir_override
            .or_else(|| std::env::var_os(env::DATA_DIR).map(PathBuf::from))
            .or_else(|| self.storage.data_dir.clone())
            .unwrap_or_else(default_data_dir);

        let layers = self
            .layers
            .iter()
            .map(LayerConfigToml::to_runtime_config)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(RuntimeConfig {
            engine: self.engine.to_runtime_config().with_data_dir(&data_dir),
            data_dir,
            port: self.server.port,
            grid: self.grid.to_runtime_config(),
            manager: self.manager.to_runtime_config(),
            registry: LayerRegistry::with_layers(layers),
        })
    }

    /// Load configuration with multi-source precedence:
    /// 1. Default values
    /// 2. Config file (if exists)
    /// 3. Environment variables (applied in `to_runtime_config`)
    /// 4. CLI arguments (applied in `to_runtime_config`)
    pub async fn load(config_file_override: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::default();

        let config_path = if let Some(ref path) = config_file_override {
            Some(path.clone())
        } else {
            Self::find_config_file().await?
        };

        if let Some(path) = config_path {
            if path.exists() {
                debug!("Loading config from: {}", path.display());
                config = Self::load_from_file(&path).await?;
            } else if config_file_override.is_some() {
                return Err(ConfigError::NotFound { path }.into());
            }
        }

        Ok(config)
    }

    /// Initialize configuration on first run
    ///
    /// Creates a default config file if none exists and notifies the user
    pub async fn initialize_first_run() -> Result<Option<PathBuf>> {
        let config_path = Self::get_default_config_path()?;

        if config_path.exists() {
            return Ok(Some(config_path));
        }

        info!("Creating default configuration file...");

        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| ConfigError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let config_content = Self::generate_default_config_content();
        tokio::fs::write(&config_path, config_content)
            .await
            .map_err(|source| ConfigError::Io {
                path: config_path.clone(),
                source,
            })?;

        println!("📁 Created default configuration file:");
        println!("   {}", config_path.display());
        println!("   You can customize settings by editing this file.");
        println!();

        Ok(Some(config_path))
    }

    /// Find configuration file in standard locations
    async fn find_config_file() -> Result<Option<PathBuf>> {
        let search_paths = vec![
            // Project-local config
            PathBuf::from("./offline-regions.toml"),
            // User config
            Self::get_default_config_path()?,
        ];

        for path in search_paths {
            if path.exists() {
                debug!("Found config file: {}", path.display());
                return Ok(Some(path));
            }
        }

        debug!("No config file found in standard locations");
        Ok(None)
    }

    /// Get the default config file path for the current user
    fn get_default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| ConfigError::InvalidValue {
            field: "config_dir".to_string(),
            value: String::new(),
            reason: "Could not determine user config directory".to_string(),
        })?;

        Ok(config_dir.join(files::APP_DIR_NAME).join("config.toml"))
    }

    /// Load configuration from a TOML file
    async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let config: AppConfig = toml::from_str(&content).map_err(ConfigError::from)?;

        info!("Loaded configuration from: {}", path.display());
        Ok(config)
    }

    /// Generate default configuration content with helpful comments
    fn generate_default_config_content() -> String {
        format!(
            r#"# Offline Regions Configuration
# This file was automatically generated on first run.
# You can customize any of these settings to suit your needs.

[storage]
# Directory for the status store and engine packs (leave unset for the system default: {})
# data_dir = "/path/to/offline/data"

[server]
# Loopback port of the style server (0 = pick a free port)
port = {}

[grid]
# Half hexagon width in degrees of longitude
half_width_deg = {:?}
# Latitude at which hexagons render regular
latitude_band_deg = {:?}
# Center of hex (0, 0)
origin_lat = {:?}
origin_lon = {:?}

[manager]
# Reload requests within this window are collapsed
reload_dirty_window_ms = {}

[engine]
# Simulated engine pacing
tick_interval_ms = {}
tiles_per_tick = {}
bytes_per_tile = {}
# tile_limit = 6000  # Uncomment to cap tiles per pack

[logging]
level = "{}"  # error, warn, info, debug, trace

# Additional layers; an entry with a built-in id replaces that layer.
# Ids may only contain ASCII letters, digits and '_'.
# [[layers]]
# id = "local"
# display_name = "Local tile server"
# tile_url_template = "http://localhost:9000/{{z}}/{{x}}/{{y}}.png"
"#,
            default_data_dir().display(),
            server::DEFAULT_PORT,
            grid::DEFAULT_HALF_WIDTH_DEG,
            grid::DEFAULT_LATITUDE_BAND_DEG,
            grid::DEFAULT_ORIGIN_LAT,
            grid::DEFAULT_ORIGIN_LON,
            manager::RELOAD_DIRTY_WINDOW.as_millis(),
            engine::DEFAULT_TICK_INTERVAL.as_millis(),
            engine::DEFAULT_TILES_PER_TICK,
            engine::DEFAULT_BYTES_PER_TILE,
            logging::DEFAULT_LOG_LEVEL,
        )
    }
}

/// Platform data directory for the application
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join(files::APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("./offline-data"))
}

impl GridConfigToml {
    /// Convert to runtime HexGridConfig
    pub fn to_runtime_config(&self) -> HexGridConfig {
        HexGridConfig {
            half_width_deg: self.half_width_deg,
            latitude_band_deg: self.latitude_band_deg,
            origin: LatLng::new(self.origin_lat, self.origin_lon),
        }
    }
}

impl ManagerConfigToml {
    /// Convert to runtime ManagerConfig
    pub fn to_runtime_config(&self) -> ManagerConfig {
        ManagerConfig::default()
            .with_reload_dirty_window(Duration::from_millis(self.reload_dirty_window_ms))
    }
}

impl EngineConfigToml {
    /// Convert to runtime SimulatedEngineConfig
    pub fn to_runtime_config(&self) -> SimulatedEngineConfig {
        SimulatedEngineConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            tiles_per_tick: self.tiles_per_tick.max(1),
            bytes_per_tile: self.bytes_per_tile,
            tile_limit: self.tile_limit,
            ..Default::default()
        }
    }
}

impl LayerConfigToml {
    /// Convert to a validated Layer
    pub fn to_runtime_config(&self) -> std::result::Result<Layer, ConfigError> {
        Layer::new(&self.id, &self.display_name, &self.tile_url_template).map_err(|e| {
            ConfigError::InvalidValue {
                field: "layers.id".to_string(),
                value: self.id.clone(),
                reason: e.to_string(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_default_config_creation() {
        let config = AppConfig::default();

        // Verify defaults are reasonable
        assert_eq!(config.server.port, server::DEFAULT_PORT);
        assert_eq!(config.grid.half_width_deg, grid::DEFAULT_HALF_WIDTH_DEG);
        assert_eq!(config.logging.level, "warn");
        assert!(config.layers.is_empty());
    }

    #[tokio::test]
    async fn test_config_file_generation() {
        let content = AppConfig::generate_default_config_content();

        // Should be valid TOML
        let parsed: AppConfig = toml::from_str(&content).unwrap();

        assert_eq!(parsed.server.port, server::DEFAULT_PORT);
        assert_eq!(parsed.engine.tiles_per_tick, engine::DEFAULT_TILES_PER_TICK);
        assert_eq!(parsed.grid.latitude_band_deg, grid::DEFAULT_LATITUDE_BAND_DEG);
        assert!(content.contains("# Offline Regions Configuration"));
        assert!(content.contains("[storage]"));
        assert!(content.contains("[grid]"));
    }

    #[tokio::test]
    async fn test_config_loading_nonexistent_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nonexistent.toml");

        // Should fail when explicitly specified
        let result = AppConfig::load(Some(config_path)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_config_loading_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test_config.toml");

        let test_config = r#"
[server]
port = 9100

[grid]
half_width_deg = 0.25

[engine]
tiles_per_tick = 100
tile_limit = 6000

[logging]
level = "debug"

[[layers]]
id = "local"
display_name = "Local tiles"
tile_url_template = "http://localhost:9000/{z}/{x}/{y}.png"
"#;

        tokio::fs::write(&config_path, test_config).await.unwrap();

        let config = AppConfig::load(Some(config_path)).await.unwrap();

        // Verify custom values were loaded
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.engine.tile_limit, Some(6000));

        // Verify defaults are still present for unspecified values
        assert_eq!(config.grid.latitude_band_deg, grid::DEFAULT_LATITUDE_BAND_DEG);
        assert_eq!(config.engine.bytes_per_tile, engine::DEFAULT_BYTES_PER_TILE);

        let runtime = config
            .to_runtime_config(Some(temp_dir.path().to_path_buf()))
            .unwrap();
        assert_eq!(runtime.data_dir, temp_dir.path());
        assert_eq!(runtime.grid.half_width_deg, 0.25);
        assert_eq!(runtime.engine.tiles_per_tick, 100);
        assert_eq!(
            runtime.engine.state_file,
            Some(temp_dir.path().join(files::ENGINE_STATE_FILE))
        );
        assert_eq!(runtime.registry.resolve("local").display_name, "Local tiles");
    }

    #[tokio::test]
    async fn test_invalid_layer_id_is_rejected() {
        let config: AppConfig = toml::from_str(
            r#"
[[layers]]
id = "bad-id"
display_name = "Bad"
tile_url_template = "http://example.org/{z}/{x}/{y}.png"
"#,
        )
        .unwrap();

        let result = config.to_runtime_config(None);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
