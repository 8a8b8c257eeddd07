//! Engine storage reloads
//!
//! A reload re-reads every pack from engine storage, which invalidates all
//! handles issued before it. Reloads hold the storage gate exclusively from
//! the moment they are requested until the new handles are bound, so pack
//! creation and resumption never interleave with one.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, error, info, warn};

use super::state::{ManagerState, PackState, StoredEntry};
use super::{ManagerNotice, OfflineRegionManager};
use crate::app::engine::{EngineHandle, StoredPack};
use crate::app::models::DownloadKey;

/// Work left after bindings were updated
struct Rebound {
    progress_requests: Vec<EngineHandle>,
    deletions: Vec<(DownloadKey, EngineHandle)>,
    ready_layers: Vec<String>,
}

impl OfflineRegionManager {
    /// Start a background reload unless one is running, a download is
    /// creating or active, or the last one started within the dirty window
    pub(super) fn request_reload(self: &Arc<Self>, state: &mut ManagerState) -> bool {
        if state.reload.in_flight {
            debug!("Reload already in flight");
            return false;
        }
        if state.has_busy_records() {
            debug!("Reload deferred: downloads in progress");
            return false;
        }
        if state.reload.within_window(self.config.reload_dirty_window) {
            debug!("Reload skipped: last one started within the dirty window");
            return false;
        }
        let Ok(gate) = self.storage_gate.clone().try_write_owned() else {
            debug!("Reload deferred: pack storage busy");
            return false;
        };

        state.reload.begin();
        let manager = self.clone();
        self.track(tokio::spawn(async move { manager.reload_storage(gate).await }));
        true
    }

    /// Enumerate storage unless that already happened, so packs from an
    /// earlier session are resumed instead of recreated and can be deleted
    /// by key
    pub async fn enumerate_if_needed(self: &Arc<Self>) {
        let gate = {
            let mut state = self.state.lock().await;
            if state.storage_generation.is_some()
                || state.reload.in_flight
                || state.has_busy_records()
            {
                return;
            }
            let Ok(gate) = self.storage_gate.clone().try_write_owned() else {
                return;
            };
            state.reload.begin();
            gate
        };
        self.reload_storage(gate).await;
    }

    async fn reload_storage(self: &Arc<Self>, gate: OwnedRwLockWriteGuard<()>) {
        let packs = match self.engine.list_packs().await {
            Ok(packs) => packs,
            Err(e) => {
                error!("Storage reload failed: {}", e);
                self.state.lock().await.reload.in_flight = false;
                return;
            }
        };

        let pack_count = packs.len();
        let rebound = {
            let mut state = self.state.lock().await;
            let rebound = bind_enumeration(&mut state, packs);
            state.reload.in_flight = false;
            Rebound {
                ready_layers: state.take_ready_layers(),
                ..rebound
            }
        };
        drop(gate);

        info!("Storage reloaded: {} packs", pack_count);

        for handle in &rebound.progress_requests {
            if let Err(e) = self.engine.request_progress(*handle) {
                warn!("Progress request for {} failed: {}", handle, e);
            }
        }

        self.publish(ManagerNotice::StorageReloaded { packs: pack_count });
        for layer in rebound.ready_layers {
            self.publish(ManagerNotice::LayerStatsReady(layer));
        }

        for (key, handle) in rebound.deletions {
            self.spawn_engine_delete(key, vec![handle], None);
        }
    }
}

/// Replace stored packs with a fresh enumeration and rebind records
fn bind_enumeration(state: &mut ManagerState, packs: Vec<StoredPack>) -> Rebound {
    let previous = state.storage_generation.unwrap_or(0);
    state.storage_generation = Some(
        packs
            .iter()
            .map(|p| p.handle.generation())
            .max()
            .unwrap_or(previous),
    );

    let enumerated: HashSet<u64> = packs.iter().map(|p| p.handle.pack_id()).collect();
    let known: HashSet<u64> = state
        .records
        .values()
        .filter_map(|r| r.handle)
        .chain(state.stored.values().map(|e| e.handle))
        .map(|h| h.pack_id())
        .collect();
    state.retired.retain(|id| enumerated.contains(id));

    let mut stored: HashMap<DownloadKey, StoredEntry> = HashMap::new();
    let mut deletions = Vec::new();
    for pack in packs {
        if state.retired.contains(&pack.handle.pack_id()) {
            debug!("Skipping {}: deleted locally", pack.handle);
            continue;
        }
        let metadata = match pack.decode_metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Skipping pack: {}", e);
                continue;
            }
        };

        let key = metadata.key();
        if !known.contains(&pack.handle.pack_id()) && state.pending_deletes.remove(&key) {
            state.retired.insert(pack.handle.pack_id());
            deletions.push((key, pack.handle));
            continue;
        }
        if stored.contains_key(&key) {
            warn!("{}: duplicate pack {} ignored", key, pack.handle);
            continue;
        }
        stored.insert(
            key,
            StoredEntry {
                handle: pack.handle,
                progress: None,
            },
        );
    }
    state.pending_deletes.clear();

    for (key, record) in state.records.iter_mut() {
        if record.state.is_busy() {
            continue;
        }
        match stored.get(key) {
            Some(entry) => {
                record.handle = Some(entry.handle);
                if record.state == PackState::Invalid {
                    record.transition(key, PackState::Suspended);
                }
            }
            None => {
                record.handle = None;
                record.transition(key, PackState::Invalid);
            }
        }
    }

    let progress_requests = stored.values().map(|e| e.handle).collect();
    state.stored = stored;

    Rebound {
        progress_requests,
        deletions,
        ready_layers: Vec::new(),
    }
}
