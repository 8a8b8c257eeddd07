//! Offline Regions Library
//!
//! A Rust library for caching map regions offline: a deterministic hex grid
//! for choosing download areas, a loopback style server feeding the tile
//! engine, and a download manager that survives suspend/resume races,
//! engine storage reloads and process restarts.

pub mod app;
pub mod cli;
pub mod config;
pub mod constants;
pub mod errors;

// Re-export commonly used types for convenience
pub use errors::{AppError, Result};
