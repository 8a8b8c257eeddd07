//! Command-line argument parsing for Offline Regions
//!
//! This module defines the CLI structure using clap derive macros,
//! providing commands for downloading and inspecting offline regions,
//! exploring the hex grid, and serving style documents.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::app::{BoundingBox, DownloadKey, Hex, ZoomRange};
use crate::constants::style::DEFAULT_LAYER_ID;

/// Offline Regions - cache map regions for offline use
#[derive(Parser, Debug)]
#[command(
    name = "offline_regions",
    version,
    about = "Cache map regions for offline use",
    long_about = "Pick map regions by bounding box or hex cell, download them as resumable tile packs,
and inspect the storage they use. Downloads survive interruption and restarts."
)]
pub struct Cli {
    /// Global options
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Global arguments available to all subcommands
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Very verbose logging (debug level)
    #[arg(long, global = true)]
    pub very_verbose: bool,

    /// Quiet mode - suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file path
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Data directory for the status store and engine packs
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download a region (Ctrl-C stops and keeps the pack for resuming)
    Download(DownloadArgs),

    /// Show download progress of a region
    Status(RegionArgs),

    /// Delete a region and its pack
    Delete(RegionArgs),

    /// Show storage used by a layer
    Stats(LayerArgs),

    /// List downloaded regions
    List(ListArgs),

    /// List available map layers
    Layers,

    /// Explore the hex grid
    Hex(HexArgs),

    /// Estimate the tile count of an area
    Estimate(EstimateArgs),

    /// Run the local style server until Ctrl-C
    Serve(ServeArgs),
}

/// Arguments for the download command
#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    /// Region name (defaults to the hex id when --hex is given)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Bounding box as south,west,north,east
    #[arg(short, long, value_parser = parse_bbox, allow_hyphen_values = true)]
    pub bbox: Option<BoundingBox>,

    /// Hex cell to download, e.g. hex_21_133
    #[arg(long, value_parser = parse_hex, conflicts_with = "bbox")]
    pub hex: Option<Hex>,

    /// Map layer id
    #[arg(short, long, default_value = DEFAULT_LAYER_ID)]
    pub layer: String,

    /// Lowest zoom level
    #[arg(long, default_value = "5")]
    pub min_zoom: u8,

    /// Highest zoom level
    #[arg(long, default_value = "12")]
    pub max_zoom: u8,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

/// Arguments identifying one region of one layer
#[derive(Args, Debug, Clone)]
pub struct RegionArgs {
    /// Region name
    pub name: String,

    /// Map layer id
    #[arg(short, long, default_value = DEFAULT_LAYER_ID)]
    pub layer: String,
}

/// Arguments selecting a layer
#[derive(Args, Debug, Clone)]
pub struct LayerArgs {
    /// Map layer id
    #[arg(default_value = DEFAULT_LAYER_ID)]
    pub layer: String,
}

/// Arguments for the list command
#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Only list regions of this layer
    #[arg(short, long)]
    pub layer: Option<String>,
}

/// Arguments for hex grid exploration
#[derive(Args, Debug)]
pub struct HexArgs {
    #[command(subcommand)]
    pub action: HexAction,
}

/// Hex grid actions
#[derive(Subcommand, Debug)]
pub enum HexAction {
    /// Show the hex containing a point
    At {
        /// Latitude in degrees
        #[arg(allow_negative_numbers = true, value_parser = parse_latitude)]
        lat: f64,
        /// Longitude in degrees
        #[arg(allow_negative_numbers = true, value_parser = parse_longitude)]
        lon: f64,
    },

    /// List the hexes intersecting a bounding box
    Bounds {
        /// Bounding box as south,west,north,east
        #[arg(value_parser = parse_bbox, allow_hyphen_values = true)]
        bbox: BoundingBox,
    },

    /// Print a style document with the hex overlay for a bounding box
    Overlay {
        /// Bounding box as south,west,north,east
        #[arg(value_parser = parse_bbox, allow_hyphen_values = true)]
        bbox: BoundingBox,

        /// Base map layer id
        #[arg(short, long, default_value = DEFAULT_LAYER_ID)]
        layer: String,

        /// Write the document to a file instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

/// Arguments for the estimate command
#[derive(Args, Debug, Clone)]
pub struct EstimateArgs {
    /// Bounding box as south,west,north,east
    #[arg(value_parser = parse_bbox, allow_hyphen_values = true)]
    pub bbox: BoundingBox,

    /// Lowest zoom level
    #[arg(long, default_value = "5")]
    pub min_zoom: u8,

    /// Highest zoom level
    #[arg(long, default_value = "12")]
    pub max_zoom: u8,
}

/// Arguments for the serve command
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Port to bind (overrides the configured port)
    #[arg(short, long)]
    pub port: Option<u16>,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the logging level based on global arguments
    pub fn log_level(&self) -> tracing::Level {
        self.global.log_level()
    }
}

impl GlobalArgs {
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.very_verbose {
            tracing::Level::DEBUG
        } else if self.verbose {
            tracing::Level::INFO
        } else {
            tracing::Level::WARN
        }
    }
}

impl DownloadArgs {
    /// Check that exactly one area was given and the zoom range is valid
    pub fn validate(&self) -> Result<(), String> {
        if self.bbox.is_none() && self.hex.is_none() {
            return Err("Specify an area with --bbox or --hex".to_string());
        }
        if self.bbox.is_some() && self.name.is_none() {
            return Err("A region name (--name) is required with --bbox".to_string());
        }
        self.zoom_range()?;
        Ok(())
    }

    pub fn zoom_range(&self) -> Result<ZoomRange, String> {
        ZoomRange::new(self.min_zoom, self.max_zoom).map_err(|e| e.to_string())
    }

    /// Region name, falling back to the hex id
    pub fn region_name(&self) -> Option<String> {
        self.name
            .clone()
            .or_else(|| self.hex.as_ref().map(Hex::id))
    }
}

impl RegionArgs {
    pub fn key(&self) -> DownloadKey {
        DownloadKey::new(&self.name, &self.layer)
    }
}

impl EstimateArgs {
    pub fn zoom_range(&self) -> Result<ZoomRange, String> {
        ZoomRange::new(self.min_zoom, self.max_zoom).map_err(|e| e.to_string())
    }
}

/// Parse `south,west,north,east` into a validated bounding box
pub fn parse_bbox(s: &str) -> Result<BoundingBox, String> {
    let values: Vec<f64> = s
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .map_err(|e| format!("'{}': {}", part.trim(), e))
        })
        .collect::<Result<_, _>>()?;

    let [south, west, north, east] = values.as_slice() else {
        return Err(format!(
            "expected south,west,north,east but got {} values",
            values.len()
        ));
    };
    BoundingBox::validated(*south, *west, *north, *east).map_err(|e| e.to_string())
}

fn parse_degrees(s: &str, limit: f64) -> Result<f64, String> {
    let value: f64 = s.trim().parse().map_err(|e| format!("'{}': {}", s.trim(), e))?;
    if (-limit..=limit).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{} is outside -{}..={}", value, limit, limit))
    }
}

fn parse_latitude(s: &str) -> Result<f64, String> {
    parse_degrees(s, 90.0)
}

fn parse_longitude(s: &str) -> Result<f64, String> {
    parse_degrees(s, 180.0)
}

fn parse_hex(s: &str) -> Result<Hex, String> {
    s.parse::<Hex>().map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download_args() -> DownloadArgs {
        DownloadArgs {
            name: Some("Oslo".to_string()),
            bbox: Some(BoundingBox::new(59.8, 10.5, 60.0, 10.9)),
            hex: None,
            layer: DEFAULT_LAYER_ID.to_string(),
            min_zoom: 5,
            max_zoom: 12,
            no_progress: true,
        }
    }

    #[test]
    fn test_download_args_validation() {
        let mut args = download_args();

        // Valid configuration
        assert!(args.validate().is_ok());

        // Invalid: inverted zoom range
        args.min_zoom = 13;
        assert!(args.validate().is_err());

        // Invalid: no area at all
        let args = DownloadArgs {
            bbox: None,
            ..download_args()
        };
        assert!(args.validate().is_err());

        // Invalid: bbox without a name
        let args = DownloadArgs {
            name: None,
            ..download_args()
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_hex_download_names_region_after_hex() {
        let args = DownloadArgs {
            name: None,
            bbox: None,
            hex: Some(Hex::new(21, 133)),
            ..download_args()
        };

        assert!(args.validate().is_ok());
        assert_eq!(args.region_name(), Some("hex_21_133".to_string()));
    }

    #[test]
    fn test_parse_bbox() {
        let bbox = parse_bbox("59.8, 10.5, 60.0, 10.9").unwrap();
        assert_eq!(bbox, BoundingBox::new(59.8, 10.5, 60.0, 10.9));

        assert!(parse_bbox("-10,-20,-5,-15").is_ok());
        assert!(parse_bbox("59.8,10.5,60.0").is_err());
        assert!(parse_bbox("north,10.5,60.0,10.9").is_err());
        assert!(parse_bbox("60.0,10.5,59.8,10.9").is_err());
    }

    #[test]
    fn test_cli_parses_download() {
        let cli = Cli::try_parse_from([
            "offline_regions",
            "download",
            "--name",
            "Oslo",
            "--bbox",
            "59.8,10.5,60.0,10.9",
            "--layer",
            "osm",
            "--max-zoom",
            "10",
        ])
        .unwrap();

        match cli.command {
            Commands::Download(args) => {
                assert_eq!(args.layer, "osm");
                assert_eq!(args.zoom_range().unwrap(), ZoomRange::new(5, 10).unwrap());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_negative_coordinates() {
        let cli = Cli::try_parse_from(["offline_regions", "hex", "at", "-33.9", "-70.6"]).unwrap();
        match cli.command {
            Commands::Hex(HexArgs {
                action: HexAction::At { lat, lon },
            }) => {
                assert_eq!(lat, -33.9);
                assert_eq!(lon, -70.6);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_point_outside_world() {
        assert!(Cli::try_parse_from(["offline_regions", "hex", "at", "0", "1e12"]).is_err());
        assert!(Cli::try_parse_from(["offline_regions", "hex", "at", "-91", "10"]).is_err());
        assert!(Cli::try_parse_from(["offline_regions", "hex", "at", "NaN", "10"]).is_err());
        assert!(Cli::try_parse_from(["offline_regions", "hex", "at", "90", "-180"]).is_ok());
    }

    #[test]
    fn test_log_level() {
        let quiet = GlobalArgs {
            quiet: true,
            ..Default::default()
        };
        let verbose = GlobalArgs {
            verbose: true,
            ..Default::default()
        };

        assert_eq!(quiet.log_level(), tracing::Level::ERROR);
        assert_eq!(verbose.log_level(), tracing::Level::INFO);
        assert_eq!(GlobalArgs::default().log_level(), tracing::Level::WARN);
    }
}
