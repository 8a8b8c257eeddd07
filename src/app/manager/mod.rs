//! Offline region manager
//!
//! The manager is the policy layer between "cache region R of layer L" and a
//! [`TileEngine`]. It owns the pack lifecycle for every download key,
//! normalizes engine notifications into [`DownloadEvent`]s for subscribers,
//! and answers status queries from live, stored and cached data without
//! ever waiting on the network.
//!
//! # Storage reloads
//!
//! Re-reading engine storage invalidates every handle the engine issued
//! before, including handles of running downloads. The manager therefore
//! only reloads while no download is creating or active, collapses reload
//! requests that arrive within a short window, and asks the engine for
//! progress of every enumerated pack right after a reload so pending status
//! queries resolve through notifications.
//!
//! Storage transitions are serialized by a gate: reloads hold it
//! exclusively, pack creation and resumption hold it shared.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use offline_regions::app::{
//!     BoundingBox, LayerRegistry, LocalStyleServer, ManagerConfig, OfflineRegionManager,
//!     PersistedStatusStore, Region, SimulatedEngine, SimulatedEngineConfig, ZoomRange,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Arc::new(SimulatedEngine::open(SimulatedEngineConfig::default()).await?);
//! let server = Arc::new(LocalStyleServer::start(0).await?);
//! let store = PersistedStatusStore::open_in(std::path::Path::new("/tmp/offline")).await?;
//! let manager = OfflineRegionManager::start(
//!     ManagerConfig::default(),
//!     engine,
//!     server,
//!     LayerRegistry::builtin(),
//!     store,
//! )
//! .await?;
//!
//! let region = Region::new("Oslo", BoundingBox::validated(59.8, 10.5, 60.0, 10.9)?)?;
//! let mut subscription = manager
//!     .download_region(&region, "kartverket", ZoomRange::new(5, 12)?)
//!     .await?;
//! while let Some(event) = subscription.recv().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

mod events;
mod reload;
pub mod state;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::engine::{EngineHandle, PackRequest, TileEngine};
use crate::app::layers::LayerRegistry;
use crate::app::models::{
    DownloadEvent, DownloadKey, LayerStats, PackMetadata, Region, RegionStatus, ZoomRange,
};
use crate::app::server::LocalStyleServer;
use crate::app::store::PersistedStatusStore;
use crate::app::style::StyleDocumentBuilder;
use crate::constants::manager as consts;
use crate::errors::{EngineError, ManagerError, ManagerResult};

pub use state::PackState;
use state::{ManagerState, PackRecord};

/// Manager tuning
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Reload requests within this window of the last reload are dropped
    pub reload_dirty_window: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            reload_dirty_window: consts::RELOAD_DIRTY_WINDOW,
        }
    }
}

impl ManagerConfig {
    pub fn with_reload_dirty_window(mut self, window: Duration) -> Self {
        self.reload_dirty_window = window;
        self
    }
}

/// Notices about state that became available in the background
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerNotice {
    /// Every stored pack of the layer has reported progress; poll again
    LayerStatsReady(String),
    /// Engine storage was re-read
    StorageReloaded { packs: usize },
}

/// Receiving end of a download's events
///
/// The stream ends after a terminal event, when the download is stopped or
/// deleted, or when another subscription replaces this one.
#[derive(Debug)]
pub struct DownloadSubscription {
    key: DownloadKey,
    events: mpsc::UnboundedReceiver<DownloadEvent>,
}

impl DownloadSubscription {
    pub fn key(&self) -> &DownloadKey {
        &self.key
    }

    /// Next event, or `None` once the subscription has ended
    pub async fn recv(&mut self) -> Option<DownloadEvent> {
        self.events.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = DownloadEvent> {
        futures::stream::unfold(self.events, |mut events| async move {
            events.recv().await.map(|event| (event, events))
        })
    }
}

/// Offline region download manager
pub struct OfflineRegionManager {
    config: ManagerConfig,
    engine: Arc<dyn TileEngine>,
    server: Arc<LocalStyleServer>,
    registry: LayerRegistry,
    store: PersistedStatusStore,
    state: Mutex<ManagerState>,
    storage_gate: Arc<RwLock<()>>,
    notices: broadcast::Sender<ManagerNotice>,
    shutdown_tx: broadcast::Sender<()>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    /// Detached reloads and engine deletions
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl OfflineRegionManager {
    /// Create the manager and start its engine event loop
    ///
    /// Snapshots from the status store seed the cached status, so completed
    /// regions are reported without asking the engine.
    ///
    /// # Errors
    ///
    /// Fails if the engine's event stream was already taken.
    pub async fn start(
        config: ManagerConfig,
        engine: Arc<dyn TileEngine>,
        server: Arc<LocalStyleServer>,
        registry: LayerRegistry,
        store: PersistedStatusStore,
    ) -> ManagerResult<Arc<Self>> {
        let events = engine.subscribe().map_err(|source| ManagerError::Engine {
            key: "*".to_string(),
            source,
        })?;

        let cached = store.entries().await.into_iter().collect();
        let (notices, _) = broadcast::channel(consts::NOTICE_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let manager = Arc::new(Self {
            config,
            engine,
            server,
            registry,
            store,
            state: Mutex::new(ManagerState::new(cached)),
            storage_gate: Arc::new(RwLock::new(())),
            notices,
            shutdown_tx,
            event_task: Mutex::new(None),
            background: std::sync::Mutex::new(Vec::new()),
        });

        let task = tokio::spawn(events::run_event_loop(
            Arc::downgrade(&manager),
            events,
            shutdown_rx,
        ));
        *manager.event_task.lock().await = Some(task);

        info!("Offline region manager started");
        Ok(manager)
    }

    pub fn registry(&self) -> &LayerRegistry {
        &self.registry
    }

    /// Subscribe to background notices
    pub fn subscribe_notices(&self) -> broadcast::Receiver<ManagerNotice> {
        self.notices.subscribe()
    }

    /// Start downloading a region for a layer, or resume a known pack
    ///
    /// Unknown layer ids fall back to the default layer. If the key is
    /// already downloading, the new subscription replaces the old one. If a
    /// snapshot of earlier progress exists, it is delivered first.
    pub async fn download_region(
        self: &Arc<Self>,
        region: &Region,
        layer_id: &str,
        zoom: ZoomRange,
    ) -> ManagerResult<DownloadSubscription> {
        let layer = self.registry.resolve(layer_id).clone();
        if layer.id != layer_id {
            warn!("Unknown layer '{}', using '{}'", layer_id, layer.id);
        }
        let key = DownloadKey::new(region.name(), &layer.id);

        let style = StyleDocumentBuilder::raster_style(&layer).to_json()?;
        self.server.set_style(&layer.id, style).await?;
        let style_url = self.server.style_url(&layer.id)?;

        self.enumerate_if_needed().await;
        let _gate = self.storage_gate.read().await;

        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = DownloadSubscription {
            key: key.clone(),
            events: rx,
        };

        let (epoch, resume_handle) = {
            let mut state = self.state.lock().await;
            if state.shut_down {
                return Err(ManagerError::ShutDown);
            }

            let stale = state
                .records
                .get(&key)
                .and_then(|r| r.handle)
                .filter(|h| !state.is_live(h))
                .is_some();
            if stale {
                state.invalidate(&key);
            }

            if let Some(snapshot) = state.best_known(&key) {
                let _ = tx.send(DownloadEvent::Progress(snapshot));
            }

            if let Some(record) = state.records.get_mut(&key) {
                if record.state.is_busy() {
                    debug!("{}: already {}, replacing subscriber", key, record.state);
                    record.observer = Some(tx);
                    return Ok(subscription);
                }
            }

            let resume_handle = state
                .records
                .get(&key)
                .and_then(|r| r.handle)
                .or_else(|| state.stored.get(&key).map(|e| e.handle))
                .filter(|h| state.is_live(h));

            let epoch = state.next_epoch();
            state.records.insert(
                key.clone(),
                PackRecord {
                    handle: resume_handle,
                    state: PackState::Creating,
                    observer: Some(tx),
                    started_at: Utc::now(),
                    epoch,
                },
            );
            debug!("{}: -> creating (resume: {:?})", key, resume_handle);
            (epoch, resume_handle)
        };

        let request = PackRequest {
            style_url,
            bounds: *region.bounding_box(),
            zoom,
            metadata: PackMetadata::for_key(&key).encode(),
        };
        let handle = match self.create_or_resume(&key, resume_handle, request).await {
            Ok(handle) => handle,
            Err(source) => {
                let mut state = self.state.lock().await;
                if state.records.get(&key).map(|r| r.epoch) == Some(epoch) {
                    state.records.remove(&key);
                }
                warn!("{}: download could not start: {}", key, source);
                return Err(ManagerError::Engine {
                    key: key.to_string(),
                    source,
                });
            }
        };

        let mut state = self.state.lock().await;
        let still_ours = state.records.get(&key).map(|r| r.epoch) == Some(epoch);
        if still_ours {
            if let Some(record) = state.records.get_mut(&key) {
                record.handle = Some(handle);
                record.transition(&key, PackState::Active);
            }
            info!("{}: downloading zoom {}..={} as {}", key, zoom.min, zoom.max, handle);
        } else if state.cancelled_epochs.remove(&epoch) {
            state.retired.insert(handle.pack_id());
            drop(state);
            info!("{}: deleted while starting, removing {}", key, handle);
            self.spawn_engine_delete(key, vec![handle], None);
            return Ok(subscription);
        } else {
            debug!("{}: finished before the download was recorded as active", key);
            return Ok(subscription);
        }
        drop(state);

        if let Err(e) = self.engine.request_progress(handle) {
            debug!("{}: progress request failed: {}", key, e);
        }
        Ok(subscription)
    }

    async fn create_or_resume(
        &self,
        key: &DownloadKey,
        resume_handle: Option<EngineHandle>,
        request: PackRequest,
    ) -> Result<EngineHandle, EngineError> {
        if let Some(handle) = resume_handle {
            match self.engine.resume(handle).await {
                Ok(()) => return Ok(handle),
                Err(e @ EngineError::StaleHandle { .. }) | Err(e @ EngineError::PackNotFound { .. }) => {
                    warn!("{}: cannot resume {}: {}; creating a new pack", key, handle, e);
                }
                Err(e) => return Err(e),
            }
        }

        let handle = self.engine.create_pack(request).await?;
        self.engine.resume(handle).await?;
        Ok(handle)
    }

    /// Pause an active download, keeping the pack for resuming
    ///
    /// The current progress is captured before suspending, since engines
    /// may reset their counters on suspend. Returns whether a download was
    /// stopped.
    pub async fn stop_download(&self, key: &DownloadKey) -> ManagerResult<bool> {
        let (handle, snapshot) = {
            let mut state = self.state.lock().await;
            let Some(record) = state.records.get(key) else {
                return Ok(false);
            };
            if record.state != PackState::Active {
                debug!("{}: not active ({}), nothing to stop", key, record.state);
                return Ok(false);
            }

            let snapshot = state.live_progress(key, self.engine.as_ref());
            let Some(record) = state.records.get_mut(key) else {
                return Ok(false);
            };
            let Some(handle) = record.handle else {
                return Ok(false);
            };
            record.transition(key, PackState::Suspended);
            record.observer = None;
            let snapshot = snapshot.or_else(|| state.cached.get(key).copied());
            (handle, snapshot)
        };

        match self.engine.suspend(handle).await {
            Ok(()) => info!("{}: stopped", key),
            Err(EngineError::StaleHandle { .. }) | Err(EngineError::PackNotFound { .. }) => {
                self.state.lock().await.invalidate(key);
            }
            Err(source) => {
                return Err(ManagerError::Engine {
                    key: key.to_string(),
                    source,
                })
            }
        }

        if let Some(snapshot) = snapshot.filter(|s| !s.is_trivial()) {
            self.store.put(key, snapshot).await?;
        }
        Ok(true)
    }

    /// Best known progress for a key
    ///
    /// Live engine progress wins over stored-pack progress, which wins over
    /// the cached snapshot; values never regress below what was observed
    /// before. Returns [`RegionStatus::Pending`] while the answer depends on
    /// a reload or a notification that has not arrived yet.
    pub async fn get_region_status(self: &Arc<Self>, key: &DownloadKey) -> RegionStatus {
        let mut state = self.state.lock().await;

        if let Some(snapshot) = state.live_progress(key, self.engine.as_ref()) {
            return RegionStatus::Snapshot(snapshot);
        }

        let mut unobserved = false;
        if let Some(entry) = state.stored.get(key).copied() {
            match entry.progress {
                Some(progress) => return RegionStatus::Snapshot(state.merge_cached(key, progress)),
                None => unobserved = true,
            }
        }

        if let Some(cached) = state.cached.get(key) {
            return RegionStatus::Snapshot(*cached);
        }
        if state.pending_deletes.contains(key) {
            return RegionStatus::NotFound;
        }

        let creating = state
            .records
            .get(key)
            .map(|r| r.state == PackState::Creating)
            .unwrap_or(false);
        if state.reload.in_flight || creating || unobserved {
            return RegionStatus::Pending;
        }

        if state.storage_generation.is_none()
            && !state.has_busy_records()
            && self.request_reload(&mut state)
        {
            return RegionStatus::Pending;
        }

        RegionStatus::NotFound
    }

    /// Delete a region's pack and every local trace of it
    ///
    /// Local state is cleaned up before returning; the engine deletes the
    /// pack in the background and failures are only logged. Returns
    /// whether anything was known under the key.
    pub async fn delete_region(self: &Arc<Self>, key: &DownloadKey) -> ManagerResult<bool> {
        self.enumerate_if_needed().await;

        let mut found = false;
        let mut cancelled_creation = false;
        let mut handles: Vec<EngineHandle> = Vec::new();
        let mut to_suspend = None;

        {
            let mut state = self.state.lock().await;
            if let Some(record) = state.records.remove(key) {
                found = true;
                if record.state == PackState::Creating {
                    state.cancelled_epochs.insert(record.epoch);
                    cancelled_creation = true;
                }
                if let Some(handle) = record.handle {
                    if record.state == PackState::Active {
                        to_suspend = Some(handle);
                    }
                    handles.push(handle);
                }
            }
            if let Some(entry) = state.stored.remove(key) {
                found = true;
                if !handles.iter().any(|h| h.pack_id() == entry.handle.pack_id()) {
                    handles.push(entry.handle);
                }
            }
            if state.cached.remove(key).is_some() {
                found = true;
            }
            for handle in &handles {
                state.retired.insert(handle.pack_id());
            }
        }

        if self.store.remove(key).await? {
            found = true;
        }

        if !found {
            debug!("{}: nothing to delete", key);
            return Ok(false);
        }

        info!("{}: deleted", key);
        // A cancelled creation deletes its own pack once the engine returns it
        if handles.is_empty() && !cancelled_creation {
            let mut state = self.state.lock().await;
            // A reload may have bound the pack while the store was written
            if let Some(entry) = state.stored.remove(key) {
                state.retired.insert(entry.handle.pack_id());
                handles.push(entry.handle);
            } else {
                state.pending_deletes.insert(key.clone());
                if !state.has_busy_records() {
                    self.request_reload(&mut state);
                }
            }
        }
        if !handles.is_empty() {
            self.spawn_engine_delete(key.clone(), handles, to_suspend);
        }
        Ok(true)
    }

    fn spawn_engine_delete(
        &self,
        key: DownloadKey,
        handles: Vec<EngineHandle>,
        to_suspend: Option<EngineHandle>,
    ) {
        let engine = self.engine.clone();
        self.track(tokio::spawn(async move {
            if let Some(handle) = to_suspend {
                if let Err(e) = engine.suspend(handle).await {
                    debug!("{}: suspend before delete failed: {}", key, e);
                }
            }
            for handle in handles {
                match engine.delete(handle).await {
                    Ok(()) => debug!("{}: engine deleted {}", key, handle),
                    Err(e) => warn!("{}: engine delete of {} failed: {}", key, handle, e),
                }
            }
        }));
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
        background.retain(|t| !t.is_finished());
        background.push(task);
    }

    /// Wait until background reloads and engine deletions have finished
    pub async fn wait_for_background(&self) {
        loop {
            let tasks: Vec<JoinHandle<()>> = {
                let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
                background.drain(..).collect()
            };
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    warn!("Background task ended abnormally: {}", e);
                }
            }
        }
    }

    /// Storage used by a layer across live, stored and cached packs
    ///
    /// Each key is counted once. Returns [`LayerStats::Pending`] and
    /// registers interest when the totals would be an undercount; a
    /// [`ManagerNotice::LayerStatsReady`] follows once they are complete.
    pub async fn get_layer_stats(self: &Arc<Self>, layer_id: &str) -> LayerStats {
        let mut state = self.state.lock().await;

        if state.reload.in_flight {
            state.interested_layers.insert(layer_id.to_string());
            return LayerStats::Pending;
        }
        if state.storage_generation.is_none()
            && !state.has_busy_records()
            && self.request_reload(&mut state)
        {
            state.interested_layers.insert(layer_id.to_string());
            return LayerStats::Pending;
        }

        let mut counted: HashSet<DownloadKey> = HashSet::new();
        let mut bytes = 0;
        let mut tiles = 0;

        let live_keys: Vec<DownloadKey> = state
            .records
            .iter()
            .filter(|(key, record)| key.layer_id() == layer_id && record.handle.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        for key in live_keys {
            if let Some(snapshot) = state.live_progress(&key, self.engine.as_ref()) {
                bytes += snapshot.downloaded_bytes;
                tiles += snapshot.downloaded_tiles;
                counted.insert(key);
            }
        }

        if state.has_unobserved(layer_id) {
            state.interested_layers.insert(layer_id.to_string());
            return LayerStats::Pending;
        }

        for (key, entry) in &state.stored {
            if key.layer_id() != layer_id || counted.contains(key) {
                continue;
            }
            if let Some(progress) = entry.progress {
                let snapshot = match state.cached.get(key) {
                    Some(cached) => cached.merged_with(&progress),
                    None => progress,
                };
                bytes += snapshot.downloaded_bytes;
                tiles += snapshot.downloaded_tiles;
                counted.insert(key.clone());
            }
        }

        for (key, snapshot) in &state.cached {
            if key.layer_id() == layer_id && !counted.contains(key) {
                bytes += snapshot.downloaded_bytes;
                tiles += snapshot.downloaded_tiles;
            }
        }

        LayerStats::Totals { bytes, tiles }
    }

    /// Region names known for a layer, sorted and de-duplicated
    pub async fn get_region_names_for_layer(&self, layer_id: &str) -> Vec<String> {
        self.state.lock().await.region_names(layer_id)
    }

    /// Lifecycle state of a key's record, if any
    pub async fn pack_state(&self, key: &DownloadKey) -> Option<PackState> {
        self.state.lock().await.records.get(key).map(|r| r.state)
    }

    /// Request a storage reload; returns whether one was started
    pub async fn refresh_storage(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock().await;
        self.request_reload(&mut state)
    }

    /// Stop the event loop; later downloads fail with `ShutDown`
    ///
    /// Pending engine deletions are allowed to finish first.
    pub async fn shutdown(&self) {
        self.state.lock().await.shut_down = true;
        self.wait_for_background().await;
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.event_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Manager event loop ended abnormally: {}", e);
            }
        }
        info!("Offline region manager stopped");
    }

    fn publish(&self, notice: ManagerNotice) {
        // No receivers is fine; notices are advisory.
        let _ = self.notices.send(notice);
    }
}

impl Drop for OfflineRegionManager {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
