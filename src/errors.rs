//! Error types for Offline Regions
//!
//! This module defines the error types for every component of the crate.
//! Component errors are wrapped by [`AppError`], which carries the category
//! and recoverability helpers used for logging and CLI exit handling.

use std::path::PathBuf;
use thiserror::Error;

/// Hex grid addressing errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GridError {
    /// Identifier does not follow the `hex_{col}_{row}` format
    #[error("Invalid hex id '{id}': expected hex_{{col}}_{{row}}")]
    InvalidId { id: String },

    /// Grid parameters cannot produce a valid tiling
    #[error("Invalid grid parameter {field}: {value}")]
    InvalidParameter { field: String, value: f64 },

    /// Point is not a valid latitude/longitude
    #[error("Point ({lat}, {lon}) is outside -90..=90, -180..=180")]
    PointOutOfRange { lat: f64, lon: f64 },
}

/// Region and geometry input errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegionError {
    /// Region name is empty
    #[error("Region name must not be empty")]
    EmptyName,

    /// Bounding box edges are out of range or inverted
    #[error("Invalid bounding box: {reason}")]
    InvalidBounds { reason: String },

    /// Zoom range is inverted or exceeds the supported maximum
    #[error("Invalid zoom range {min}..={max}")]
    InvalidZoomRange { min: u8, max: u8 },

    /// Download key could not be split into region and layer
    #[error("Invalid download key '{key}'")]
    InvalidKey { key: String },
}

/// Layer registry and style rendering errors
#[derive(Error, Debug)]
pub enum StyleError {
    /// Layer id contains characters that would break download keys
    #[error("Invalid layer id '{id}': {reason}")]
    InvalidLayerId { id: String, reason: String },

    /// Style document could not be serialized
    #[error("Style serialization failed")]
    Serialize(#[from] serde_json::Error),
}

/// Local style server errors
#[derive(Error, Debug)]
pub enum ServerError {
    /// Could not bind the loopback listener
    #[error("Failed to bind style server on 127.0.0.1:{port}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Style URL could not be constructed
    #[error("Invalid style URL: {0}")]
    Url(#[from] url::ParseError),

    /// Connection-level I/O failure
    #[error("Style server I/O error")]
    Io(#[from] std::io::Error),

    /// Style name or request was rejected
    #[error("Invalid style request: {reason}")]
    BadRequest { reason: String },
}

/// Tile engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Network timeout or connection problem; the engine retries internally
    #[error("Transient engine error: {message}")]
    Transient { message: String },

    /// Any other engine failure; the pack cannot continue
    #[error("Engine error: {message}")]
    Permanent { message: String },

    /// Handle was issued before the most recent storage reload
    #[error("Stale pack handle {pack_id} (generation {generation}, current {current})")]
    StaleHandle {
        pack_id: u64,
        generation: u64,
        current: u64,
    },

    /// Pack does not exist in engine storage
    #[error("Pack {pack_id} not found")]
    PackNotFound { pack_id: u64 },

    /// Pack metadata could not be decoded back into a region/layer pair
    #[error("Undecodable pack metadata for pack {pack_id}: {reason}")]
    Metadata { pack_id: u64, reason: String },

    /// Event stream was already taken or closed
    #[error("Engine event stream unavailable")]
    EventStreamClosed,
}

impl EngineError {
    /// Check whether the engine will retry this failure on its own
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient { .. })
    }
}

/// Persisted status store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Store file could not be read or written
    #[error("Status store I/O error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Store file is not a JSON object of strings
    #[error("Status store file is corrupted")]
    Corrupted(#[from] serde_json::Error),

    /// A single stored value is not `downloaded,total,bytes,complete`
    #[error("Invalid status entry '{value}': {reason}")]
    InvalidEntry { value: String, reason: String },
}

/// Offline region manager errors
#[derive(Error, Debug)]
pub enum ManagerError {
    /// Underlying engine call failed
    #[error("Engine failure for {key}")]
    Engine {
        key: String,
        #[source]
        source: EngineError,
    },

    /// Region or key input was invalid
    #[error(transparent)]
    Region(#[from] RegionError),

    /// Style registration failed
    #[error(transparent)]
    Style(#[from] StyleError),

    /// Style server could not provide a URL
    #[error(transparent)]
    Server(#[from] ServerError),

    /// Persisting status failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Manager event loop already stopped
    #[error("Offline region manager has been shut down")]
    ShutDown,
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: PathBuf },

    /// Invalid configuration format
    #[error("Invalid configuration format")]
    InvalidFormat(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}. {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    /// Configuration file could not be read or written
    #[error("Configuration file I/O error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level application error that can represent any error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Hex grid error
    #[error(transparent)]
    Grid(#[from] GridError),

    /// Region input error
    #[error(transparent)]
    Region(#[from] RegionError),

    /// Style error
    #[error(transparent)]
    Style(#[from] StyleError),

    /// Style server error
    #[error(transparent)]
    Server(#[from] ServerError),

    /// Engine error
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Status store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Manager error
    #[error(transparent)]
    Manager(#[from] ManagerError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Generic I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Generic application error with context
    #[error("Application error: {message}")]
    Generic { message: String },
}

impl AppError {
    /// Create a generic application error with a message
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable (transient)
    pub fn is_recoverable(&self) -> bool {
        match self {
            AppError::Engine(EngineError::Transient { .. })
            | AppError::Engine(EngineError::StaleHandle { .. })
            | AppError::Manager(ManagerError::Engine {
                source: EngineError::Transient { .. },
                ..
            })
            | AppError::Manager(ManagerError::Engine {
                source: EngineError::StaleHandle { .. },
                ..
            }) => true,

            AppError::Engine(EngineError::Permanent { .. })
            | AppError::Config(ConfigError::InvalidFormat(_))
            | AppError::Store(StoreError::Corrupted(_)) => false,

            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            AppError::Grid(_) => "grid",
            AppError::Region(_) => "region",
            AppError::Style(_) => "style",
            AppError::Server(_) => "server",
            AppError::Engine(_) => "engine",
            AppError::Store(_) => "store",
            AppError::Manager(_) => "manager",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Generic { .. } => "generic",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;

/// Grid result type alias
pub type GridResult<T> = std::result::Result<T, GridError>;

/// Style result type alias
pub type StyleResult<T> = std::result::Result<T, StyleError>;

/// Server result type alias
pub type ServerResult<T> = std::result::Result<T, ServerError>;

/// Engine result type alias
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Store result type alias
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Manager result type alias
pub type ManagerResult<T> = std::result::Result<T, ManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_transience() {
        let transient = EngineError::Transient {
            message: "timeout".to_string(),
        };
        let permanent = EngineError::Permanent {
            message: "style parse failed".to_string(),
        };

        assert!(transient.is_transient());
        assert!(!permanent.is_transient());
    }

    #[test]
    fn test_app_error_category_and_recovery() {
        let err = AppError::from(ManagerError::Engine {
            key: "Oslo-kartverket".to_string(),
            source: EngineError::Transient {
                message: "connection reset".to_string(),
            },
        });
        assert_eq!(err.category(), "manager");
        assert!(err.is_recoverable());

        let err = AppError::from(GridError::InvalidId {
            id: "hex_x".to_string(),
        });
        assert_eq!(err.category(), "grid");
        assert!(!err.is_recoverable());
    }
}
