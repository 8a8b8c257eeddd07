//! Tile engine contract
//!
//! The manager drives an external tile engine through the [`TileEngine`]
//! trait. One implementation exists per platform engine; the crate ships
//! [`SimulatedEngine`] so that the policy layer can run end to end.
//!
//! # Handles and reloads
//!
//! Engines hand out handles to packs. Re-reading pack storage
//! ([`TileEngine::list_packs`]) invalidates every handle obtained before
//! it, including handles backing running downloads. Handles are therefore
//! tagged with the storage generation they were issued in, and engines
//! reject a handle whose generation is not current with
//! [`EngineError::StaleHandle`](crate::errors::EngineError::StaleHandle).
//!
//! # Events
//!
//! Progress, error and resource-limit notifications arrive on a single
//! unbounded channel obtained once through [`TileEngine::subscribe`].

pub mod simulated;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use url::Url;

use crate::app::models::{BoundingBox, PackMetadata, ProgressSnapshot, ZoomRange};
use crate::errors::{EngineError, EngineResult};

pub use simulated::{CallCounts, SimulatedEngine, SimulatedEngineConfig};

/// Opaque, generation-tagged reference to an engine pack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineHandle {
    pack_id: u64,
    generation: u64,
}

impl EngineHandle {
    pub fn new(pack_id: u64, generation: u64) -> Self {
        Self {
            pack_id,
            generation,
        }
    }

    /// Storage identity of the pack; stable across reloads
    pub fn pack_id(&self) -> u64 {
        self.pack_id
    }

    /// Storage generation this handle was issued in
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pack#{}@g{}", self.pack_id, self.generation)
    }
}

/// Parameters of a new pack
#[derive(Debug, Clone, PartialEq)]
pub struct PackRequest {
    pub style_url: Url,
    pub bounds: BoundingBox,
    pub zoom: ZoomRange,
    pub metadata: Vec<u8>,
}

/// Engine-side download state of a pack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnginePackState {
    Inactive,
    Active,
    Complete,
}

/// Raw progress counters reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackProgress {
    pub completed_tiles: u64,
    pub expected_tiles: u64,
    pub completed_bytes: u64,
    pub state: EnginePackState,
}

impl PackProgress {
    pub fn is_complete(&self) -> bool {
        self.state == EnginePackState::Complete
            || (self.expected_tiles > 0 && self.completed_tiles >= self.expected_tiles)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot::new(
            self.completed_tiles,
            self.expected_tiles,
            self.completed_bytes,
            self.is_complete(),
        )
    }
}

/// A pack enumerated from engine storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPack {
    pub handle: EngineHandle,
    pub metadata: Vec<u8>,
}

impl StoredPack {
    /// Decode the region/layer metadata attached at creation
    pub fn decode_metadata(&self) -> EngineResult<PackMetadata> {
        PackMetadata::decode(&self.metadata).map_err(|e| EngineError::Metadata {
            pack_id: self.handle.pack_id(),
            reason: e.to_string(),
        })
    }
}

/// Notification kinds delivered by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEventKind {
    ProgressChanged(PackProgress),
    Error { message: String, transient: bool },
    /// Engine-specific tile cap reached; the pack stops downloading
    ResourceLimitReached,
}

/// A notification about one pack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEvent {
    pub handle: EngineHandle,
    pub kind: EngineEventKind,
}

/// Operations the manager needs from a tile engine
#[async_trait]
pub trait TileEngine: Send + Sync {
    /// Create a pack for the style, bounds and zoom range; it starts inactive
    async fn create_pack(&self, request: PackRequest) -> EngineResult<EngineHandle>;

    /// Start or continue downloading a pack
    async fn resume(&self, handle: EngineHandle) -> EngineResult<()>;

    /// Pause a pack; engines may reset their reported counters
    async fn suspend(&self, handle: EngineHandle) -> EngineResult<()>;

    /// Remove a pack and its tiles from storage
    async fn delete(&self, handle: EngineHandle) -> EngineResult<()>;

    /// Re-read pack storage, invalidating every previously issued handle
    async fn list_packs(&self) -> EngineResult<Vec<StoredPack>>;

    /// Current counters of a pack
    fn progress(&self, handle: EngineHandle) -> EngineResult<PackProgress>;

    /// Ask the engine to emit a `ProgressChanged` event for a pack
    fn request_progress(&self, handle: EngineHandle) -> EngineResult<()>;

    /// Take the event stream; only one subscriber is supported
    fn subscribe(&self) -> EngineResult<mpsc::UnboundedReceiver<EngineEvent>>;
}
