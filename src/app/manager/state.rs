//! Mutable manager state
//!
//! Everything the manager knows about packs lives in [`ManagerState`],
//! guarded by a single async mutex in the manager. The helpers here are
//! synchronous and never touch the engine except for reading progress.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use crate::app::engine::{EngineHandle, TileEngine};
use crate::app::models::{DownloadEvent, DownloadKey, ProgressSnapshot};
use crate::errors::EngineError;

/// Lifecycle state of a pack record
///
/// `Absent` is represented by the lack of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PackState {
    /// Engine create or resume in progress
    Creating,
    /// Downloading
    Active,
    /// Paused; the handle is kept for resuming
    Suspended,
    /// All tiles downloaded
    Complete,
    /// Aborted on a permanent engine error
    Failed,
    /// Handle invalidated by a storage reload with no replacement found
    Invalid,
}

impl PackState {
    /// Whether the engine is working on the pack right now
    pub fn is_busy(&self) -> bool {
        matches!(self, PackState::Creating | PackState::Active)
    }
}

impl fmt::Display for PackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PackState::Creating => "creating",
            PackState::Active => "active",
            PackState::Suspended => "suspended",
            PackState::Complete => "complete",
            PackState::Failed => "failed",
            PackState::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

/// In-memory record of a pack this process has touched
#[derive(Debug)]
pub(crate) struct PackRecord {
    pub handle: Option<EngineHandle>,
    pub state: PackState,
    pub observer: Option<mpsc::UnboundedSender<DownloadEvent>>,
    pub started_at: DateTime<Utc>,
    /// Distinguishes this record from a later one under the same key
    pub epoch: u64,
}

impl PackRecord {
    pub fn transition(&mut self, key: &DownloadKey, next: PackState) {
        if self.state != next {
            debug!("{}: {} -> {}", key, self.state, next);
            self.state = next;
        }
    }

    /// Deliver an event, forgetting the observer once it has gone away
    pub fn notify(&mut self, key: &DownloadKey, event: DownloadEvent) {
        if let Some(observer) = &self.observer {
            if observer.send(event).is_err() {
                debug!("{}: subscriber dropped", key);
                self.observer = None;
            }
        }
    }
}

/// A pack found by the last storage enumeration
#[derive(Debug, Clone, Copy)]
pub(crate) struct StoredEntry {
    pub handle: EngineHandle,
    /// `None` until the engine has reported progress for the pack
    pub progress: Option<ProgressSnapshot>,
}

/// Reload bookkeeping for de-duplication
#[derive(Debug, Default)]
pub(crate) struct ReloadTracker {
    pub in_flight: bool,
    pub last_started: Option<Instant>,
}

impl ReloadTracker {
    pub fn within_window(&self, window: Duration) -> bool {
        self.last_started
            .map(|started| started.elapsed() < window)
            .unwrap_or(false)
    }

    pub fn begin(&mut self) {
        self.in_flight = true;
        self.last_started = Some(Instant::now());
    }
}

#[derive(Debug, Default)]
pub(crate) struct ManagerState {
    pub records: HashMap<DownloadKey, PackRecord>,
    pub cached: HashMap<DownloadKey, ProgressSnapshot>,
    pub stored: HashMap<DownloadKey, StoredEntry>,
    /// Generation of the last enumeration; `None` until storage was read
    pub storage_generation: Option<u64>,
    /// Pack ids deleted locally; late engine notifications for them are dropped
    pub retired: HashSet<u64>,
    /// Keys deleted without a known handle, resolved on the next reload
    pub pending_deletes: HashSet<DownloadKey>,
    pub interested_layers: HashSet<String>,
    /// Epochs of records deleted while their engine pack was being created
    pub cancelled_epochs: HashSet<u64>,
    pub reload: ReloadTracker,
    pub next_epoch: u64,
    pub shut_down: bool,
}

impl ManagerState {
    pub fn new(cached: HashMap<DownloadKey, ProgressSnapshot>) -> Self {
        Self {
            cached,
            ..Default::default()
        }
    }

    pub fn has_busy_records(&self) -> bool {
        self.records.values().any(|r| r.state.is_busy())
    }

    pub fn next_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    /// Whether a handle may still be used with the engine
    pub fn is_live(&self, handle: &EngineHandle) -> bool {
        !self.retired.contains(&handle.pack_id())
            && self
                .storage_generation
                .map_or(true, |generation| handle.generation() >= generation)
    }

    /// Merge an observation into the cached snapshot and return the result
    pub fn merge_cached(&mut self, key: &DownloadKey, observed: ProgressSnapshot) -> ProgressSnapshot {
        let merged = match self.cached.get(key) {
            Some(cached) => cached.merged_with(&observed),
            None => observed,
        };
        self.cached.insert(key.clone(), merged);
        merged
    }

    /// Best snapshot known without asking the engine
    pub fn best_known(&self, key: &DownloadKey) -> Option<ProgressSnapshot> {
        let stored = self.stored.get(key).and_then(|e| e.progress);
        match (self.cached.get(key), stored) {
            (Some(cached), Some(stored)) => Some(cached.merged_with(&stored)),
            (Some(cached), None) => Some(*cached),
            (None, stored) => stored,
        }
    }

    /// Read live progress of a record's handle, marking the record invalid
    /// if the engine rejects the handle
    pub fn live_progress(&mut self, key: &DownloadKey, engine: &dyn TileEngine) -> Option<ProgressSnapshot> {
        let handle = self.records.get(key)?.handle?;
        if !self.is_live(&handle) {
            self.invalidate(key);
            return None;
        }

        match engine.progress(handle) {
            Ok(progress) => Some(self.merge_cached(key, progress.snapshot())),
            Err(EngineError::StaleHandle { .. }) | Err(EngineError::PackNotFound { .. }) => {
                self.invalidate(key);
                None
            }
            Err(e) => {
                debug!("{}: progress unavailable: {}", key, e);
                None
            }
        }
    }

    /// Drop a record's handle after it became unusable
    pub fn invalidate(&mut self, key: &DownloadKey) {
        if let Some(record) = self.records.get_mut(key) {
            record.handle = None;
            record.transition(key, PackState::Invalid);
        }
    }

    /// Key owning a handle, among records first and stored packs second
    pub fn owner_of(&self, handle: &EngineHandle) -> Option<(DownloadKey, bool)> {
        if let Some((key, _)) = self.records.iter().find(|(_, r)| r.handle.as_ref() == Some(handle)) {
            return Some((key.clone(), true));
        }
        self.stored
            .iter()
            .find(|(_, e)| e.handle == *handle)
            .map(|(key, _)| (key.clone(), false))
    }

    /// Stored packs of a layer whose progress has not been observed yet
    pub fn has_unobserved(&self, layer_id: &str) -> bool {
        self.stored
            .iter()
            .any(|(key, entry)| key.layer_id() == layer_id && entry.progress.is_none())
    }

    /// Remove and return interested layers whose totals are now complete
    pub fn take_ready_layers(&mut self) -> Vec<String> {
        if self.reload.in_flight {
            return Vec::new();
        }
        let ready: Vec<String> = self
            .interested_layers
            .iter()
            .filter(|layer| !self.has_unobserved(layer))
            .cloned()
            .collect();
        for layer in &ready {
            self.interested_layers.remove(layer);
        }
        ready
    }

    /// Sorted, de-duplicated region names known for a layer
    pub fn region_names(&self, layer_id: &str) -> Vec<String> {
        self.records
            .keys()
            .chain(self.stored.keys())
            .chain(self.cached.keys())
            .filter(|key| key.layer_id() == layer_id)
            .map(|key| key.region_name().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
