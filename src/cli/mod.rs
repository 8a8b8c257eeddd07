//! Command-line interface components
//!
//! This module contains CLI-specific code for the Offline Regions
//! application, including argument parsing, progress display, and the
//! command handlers.

pub mod args;
pub mod commands;
pub mod progress;

pub use args::{
    Cli, Commands, DownloadArgs, EstimateArgs, GlobalArgs, HexAction, HexArgs, LayerArgs,
    ListArgs, RegionArgs, ServeArgs,
};
pub use commands::{
    handle_delete, handle_download, handle_estimate, handle_hex, handle_layers, handle_list,
    handle_serve, handle_stats, handle_status,
};
pub use progress::{format_bytes, ProgressConfig, ProgressDisplay, SessionOutcome};
