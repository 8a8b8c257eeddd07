//! Simulated tile engine
//!
//! An in-process [`TileEngine`] that behaves like a real offline engine
//! without fetching tile bytes: packs advance on a timer, suspending
//! resets the reported counters, storage reloads bump the handle
//! generation, and an optional tile cap raises `ResourceLimitReached`.
//! Pack storage can be kept in a JSON file so packs survive restarts.
//!
//! On creation the engine fetches the pack's style URL, so a pack can only
//! be created against a style server that is actually reachable.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    EngineEvent, EngineEventKind, EngineHandle, EnginePackState, PackProgress, PackRequest,
    StoredPack, TileEngine,
};
use crate::app::estimate::exact_count;
use crate::app::models::{BoundingBox, ZoomRange};
use crate::constants::{engine, files};
use crate::errors::{EngineError, EngineResult};

/// Configuration for the simulated engine
#[derive(Debug, Clone)]
pub struct SimulatedEngineConfig {
    /// Interval between progress ticks
    pub tick_interval: Duration,
    /// Tiles completed per tick
    pub tiles_per_tick: u64,
    /// Average bytes per tile (±25% jitter)
    pub bytes_per_tile: u64,
    /// Tile cap after which `ResourceLimitReached` fires
    pub tile_limit: Option<u64>,
    /// Pack storage file; in-memory only if `None`
    pub state_file: Option<PathBuf>,
    /// Fetch the style URL when creating a pack
    pub verify_style: bool,
}

impl Default for SimulatedEngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: engine::DEFAULT_TICK_INTERVAL,
            tiles_per_tick: engine::DEFAULT_TILES_PER_TICK,
            bytes_per_tile: engine::DEFAULT_BYTES_PER_TILE,
            tile_limit: None,
            state_file: None,
            verify_style: true,
        }
    }
}

impl SimulatedEngineConfig {
    /// Fast settings for tests
    pub fn testing() -> Self {
        Self {
            tick_interval: Duration::from_millis(5),
            tiles_per_tick: 50,
            bytes_per_tile: 1000,
            ..Default::default()
        }
    }

    /// Keep pack storage in `data_dir`
    pub fn with_data_dir(mut self, data_dir: &std::path::Path) -> Self {
        self.state_file = Some(data_dir.join(files::ENGINE_STATE_FILE));
        self
    }

    pub fn with_tile_limit(mut self, limit: u64) -> Self {
        self.tile_limit = Some(limit);
        self
    }

    pub fn with_verify_style(mut self, verify: bool) -> Self {
        self.verify_style = verify;
        self
    }
}

/// Number of calls made to each engine operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: u32,
    pub resume: u32,
    pub suspend: u32,
    pub delete: u32,
    pub list: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimPack {
    pack_id: u64,
    style_url: String,
    bounds: BoundingBox,
    zoom: ZoomRange,
    metadata: Vec<u8>,
    expected_tiles: u64,
    completed_tiles: u64,
    completed_bytes: u64,
    #[serde(default)]
    active: bool,
    /// Reported counters read as zero after a suspend
    #[serde(default)]
    counters_reset: bool,
}

impl SimPack {
    fn progress(&self) -> PackProgress {
        let state = if self.expected_tiles > 0 && self.completed_tiles >= self.expected_tiles {
            EnginePackState::Complete
        } else if self.active {
            EnginePackState::Active
        } else {
            EnginePackState::Inactive
        };

        if self.counters_reset {
            PackProgress {
                completed_tiles: 0,
                expected_tiles: self.expected_tiles,
                completed_bytes: 0,
                state,
            }
        } else {
            PackProgress {
                completed_tiles: self.completed_tiles,
                expected_tiles: self.expected_tiles,
                completed_bytes: self.completed_bytes,
                state,
            }
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    generation: u64,
    next_pack_id: u64,
    packs: BTreeMap<u64, SimPack>,
    tickers: HashMap<u64, JoinHandle<()>>,
    injected: HashMap<u64, (String, bool)>,
    calls: CallCounts,
}

impl SimState {
    fn pack_mut(&mut self, handle: EngineHandle) -> EngineResult<&mut SimPack> {
        if handle.generation() != self.generation {
            return Err(EngineError::StaleHandle {
                pack_id: handle.pack_id(),
                generation: handle.generation(),
                current: self.generation,
            });
        }
        self.packs
            .get_mut(&handle.pack_id())
            .ok_or(EngineError::PackNotFound {
                pack_id: handle.pack_id(),
            })
    }

    fn handle(&self, pack_id: u64) -> EngineHandle {
        EngineHandle::new(pack_id, self.generation)
    }

    fn stop_ticker(&mut self, pack_id: u64) {
        if let Some(task) = self.tickers.remove(&pack_id) {
            task.abort();
        }
    }
}

struct Shared {
    config: SimulatedEngineConfig,
    state: Mutex<SimState>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    http: reqwest::Client,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        // A panicked ticker must not take the engine down with it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, handle: EngineHandle, kind: EngineEventKind) {
        if self.events_tx.send(EngineEvent { handle, kind }).is_err() {
            debug!("Engine event for {} dropped: no subscriber", handle);
        }
    }

    fn storage_json(&self) -> Option<(PathBuf, String)> {
        let path = self.config.state_file.clone()?;
        let packs: Vec<SimPack> = self.lock().packs.values().cloned().collect();
        match serde_json::to_string_pretty(&packs) {
            Ok(json) => Some((path, json)),
            Err(e) => {
                warn!("Failed to serialize engine storage: {}", e);
                None
            }
        }
    }

    async fn persist(&self) {
        let Some((path, json)) = self.storage_json() else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let temp = path.with_extension(format!("json{}", files::TEMP_FILE_SUFFIX));
        let result = async {
            tokio::fs::write(&temp, json).await?;
            tokio::fs::rename(&temp, &path).await
        }
        .await;
        if let Err(e) = result {
            warn!("Failed to write engine storage {}: {}", path.display(), e);
        }
    }
}

/// In-process engine with timer-driven progress
#[derive(Clone)]
pub struct SimulatedEngine {
    shared: Arc<Shared>,
}

impl SimulatedEngine {
    /// Create an engine, loading pack storage from the state file if present
    pub async fn open(config: SimulatedEngineConfig) -> EngineResult<Self> {
        let mut state = SimState {
            generation: 1,
            next_pack_id: 1,
            ..Default::default()
        };

        if let Some(path) = &config.state_file {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    let packs: Vec<SimPack> =
                        serde_json::from_str(&content).map_err(|e| EngineError::Permanent {
                            message: format!("engine storage {} unreadable: {}", path.display(), e),
                        })?;
                    for mut pack in packs {
                        pack.active = false;
                        pack.counters_reset = false;
                        state.next_pack_id = state.next_pack_id.max(pack.pack_id + 1);
                        state.packs.insert(pack.pack_id, pack);
                    }
                    info!("Loaded {} packs from {}", state.packs.len(), path.display());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("No engine storage at {}", path.display());
                }
                Err(e) => {
                    return Err(EngineError::Permanent {
                        message: format!("engine storage {} unreadable: {}", path.display(), e),
                    })
                }
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .no_proxy()
            .build()
            .map_err(|e| EngineError::Permanent {
                message: format!("HTTP client setup failed: {}", e),
            })?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(state),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                http,
            }),
        })
    }

    /// Calls made so far, per operation
    pub fn call_counts(&self) -> CallCounts {
        self.shared.lock().calls
    }

    /// Current storage generation
    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    /// Number of packs in storage
    pub fn pack_count(&self) -> usize {
        self.shared.lock().packs.len()
    }

    /// Make the next tick of a pack report an error instead of progress
    pub fn inject_error(&self, pack_id: u64, message: impl Into<String>, transient: bool) {
        self.shared
            .lock()
            .injected
            .insert(pack_id, (message.into(), transient));
    }

    /// Store a pack whose metadata cannot be decoded
    pub fn insert_corrupt_pack(&self) -> u64 {
        let mut state = self.shared.lock();
        let pack_id = state.next_pack_id;
        state.next_pack_id += 1;
        state.packs.insert(
            pack_id,
            SimPack {
                pack_id,
                style_url: String::new(),
                bounds: BoundingBox::new(0.0, 0.0, 0.0, 0.0),
                zoom: ZoomRange { min: 0, max: 0 },
                metadata: b"\xffnot-json".to_vec(),
                expected_tiles: 1,
                completed_tiles: 0,
                completed_bytes: 0,
                active: false,
                counters_reset: false,
            },
        );
        pack_id
    }

    fn spawn_ticker(&self, pack_id: u64) -> JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(shared.config.tick_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let (finished, events) = tick(&shared, pack_id);
                if finished {
                    shared.persist().await;
                }
                let handle = shared.lock().handle(pack_id);
                for kind in events {
                    shared.emit(handle, kind);
                }
                if finished {
                    break;
                }
            }
        })
    }
}

/// Advance one pack by one tick
///
/// Returns whether the pack stopped, and the events to emit once storage
/// reflects the tick.
fn tick(shared: &Shared, pack_id: u64) -> (bool, Vec<EngineEventKind>) {
    let mut state = shared.lock();

    if let Some((message, transient)) = state.injected.remove(&pack_id) {
        if !transient {
            if let Some(pack) = state.packs.get_mut(&pack_id) {
                pack.active = false;
            }
            state.tickers.remove(&pack_id);
        }
        return (!transient, vec![EngineEventKind::Error { message, transient }]);
    }

    let tile_limit = shared.config.tile_limit;
    let tiles_per_tick = shared.config.tiles_per_tick;
    let bytes_per_tile = shared.config.bytes_per_tile;

    let Some(pack) = state.packs.get_mut(&pack_id) else {
        return (true, Vec::new());
    };
    if !pack.active {
        return (true, Vec::new());
    }

    let remaining = pack.expected_tiles.saturating_sub(pack.completed_tiles);
    let mut step = tiles_per_tick.min(remaining);
    let mut limit_hit = false;
    if let Some(limit) = tile_limit {
        if pack.completed_tiles + step >= limit {
            step = limit.saturating_sub(pack.completed_tiles);
            limit_hit = true;
        }
    }

    let jitter = if bytes_per_tile >= 4 {
        rand::thread_rng().gen_range(0..=bytes_per_tile / 2)
    } else {
        0
    };
    pack.completed_tiles += step;
    pack.completed_bytes += step * (bytes_per_tile - bytes_per_tile / 4) + step.min(1) * jitter;

    let progress = pack.progress();
    let done = progress.state == EnginePackState::Complete;
    if done || limit_hit {
        pack.active = false;
        state.tickers.remove(&pack_id);
    }

    let mut events = vec![EngineEventKind::ProgressChanged(progress)];
    if limit_hit && !done {
        events.push(EngineEventKind::ResourceLimitReached);
    }
    (done || limit_hit, events)
}

#[async_trait]
impl TileEngine for SimulatedEngine {
    async fn create_pack(&self, request: PackRequest) -> EngineResult<EngineHandle> {
        self.shared.lock().calls.create += 1;

        if self.shared.config.verify_style {
            let response = self
                .shared
                .http
                .get(request.style_url.clone())
                .send()
                .await
                .map_err(|e| EngineError::Transient {
                    message: format!("style fetch failed: {}", e),
                })?;
            let style: serde_json::Value =
                response.json().await.map_err(|e| EngineError::Permanent {
                    message: format!("style at {} is not JSON: {}", request.style_url, e),
                })?;
            debug!(
                "Fetched style {} with {} layers",
                request.style_url,
                style["layers"].as_array().map(|l| l.len()).unwrap_or(0)
            );
        }

        let handle = {
            let mut state = self.shared.lock();
            let pack_id = state.next_pack_id;
            state.next_pack_id += 1;
            state.packs.insert(
                pack_id,
                SimPack {
                    pack_id,
                    style_url: request.style_url.to_string(),
                    bounds: request.bounds,
                    zoom: request.zoom,
                    metadata: request.metadata,
                    expected_tiles: exact_count(&request.bounds, request.zoom),
                    completed_tiles: 0,
                    completed_bytes: 0,
                    active: false,
                    counters_reset: false,
                },
            );
            state.handle(pack_id)
        };

        info!("Created {}", handle);
        self.shared.persist().await;
        Ok(handle)
    }

    async fn resume(&self, handle: EngineHandle) -> EngineResult<()> {
        let complete = {
            let mut state = self.shared.lock();
            state.calls.resume += 1;
            let pack = state.pack_mut(handle)?;
            pack.counters_reset = false;
            let complete = pack.progress().state == EnginePackState::Complete;
            if !complete {
                pack.active = true;
                state.stop_ticker(handle.pack_id());
                let ticker = self.spawn_ticker(handle.pack_id());
                state.tickers.insert(handle.pack_id(), ticker);
            }
            complete
        };

        if complete {
            let progress = self.progress(handle)?;
            self.shared.emit(handle, EngineEventKind::ProgressChanged(progress));
        }
        debug!("Resumed {}", handle);
        Ok(())
    }

    async fn suspend(&self, handle: EngineHandle) -> EngineResult<()> {
        {
            let mut state = self.shared.lock();
            state.calls.suspend += 1;
            let pack = state.pack_mut(handle)?;
            pack.active = false;
            pack.counters_reset = true;
            state.stop_ticker(handle.pack_id());
        }
        debug!("Suspended {}", handle);
        self.shared.persist().await;
        Ok(())
    }

    async fn delete(&self, handle: EngineHandle) -> EngineResult<()> {
        {
            let mut state = self.shared.lock();
            state.calls.delete += 1;
            state.pack_mut(handle)?;
            state.stop_ticker(handle.pack_id());
            state.packs.remove(&handle.pack_id());
            state.injected.remove(&handle.pack_id());
        }
        info!("Deleted {}", handle);
        self.shared.persist().await;
        Ok(())
    }

    async fn list_packs(&self) -> EngineResult<Vec<StoredPack>> {
        let mut state = self.shared.lock();
        state.calls.list += 1;
        state.generation += 1;
        let generation = state.generation;

        let packs = state
            .packs
            .values_mut()
            .map(|pack| {
                pack.counters_reset = false;
                StoredPack {
                    handle: EngineHandle::new(pack.pack_id, generation),
                    metadata: pack.metadata.clone(),
                }
            })
            .collect::<Vec<_>>();

        debug!("Storage reload: {} packs, generation {}", packs.len(), generation);
        Ok(packs)
    }

    fn progress(&self, handle: EngineHandle) -> EngineResult<PackProgress> {
        let mut state = self.shared.lock();
        Ok(state.pack_mut(handle)?.progress())
    }

    fn request_progress(&self, handle: EngineHandle) -> EngineResult<()> {
        let progress = self.progress(handle)?;
        self.shared.emit(handle, EngineEventKind::ProgressChanged(progress));
        Ok(())
    }

    fn subscribe(&self) -> EngineResult<mpsc::UnboundedReceiver<EngineEvent>> {
        self.shared
            .events_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(EngineError::EventStreamClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::models::PackMetadata;
    use tempfile::TempDir;
    use url::Url;

    fn request(name: &str) -> PackRequest {
        PackRequest {
            style_url: Url::parse("http://127.0.0.1:1/styles/x-style.json").unwrap(),
            bounds: BoundingBox::new(59.8, 10.5, 60.0, 10.9),
            zoom: ZoomRange::new(5, 10).unwrap(),
            metadata: PackMetadata {
                name: name.to_string(),
                layer: "kartverket".to_string(),
            }
            .encode(),
        }
    }

    async fn engine() -> SimulatedEngine {
        SimulatedEngine::open(SimulatedEngineConfig::testing().with_verify_style(false))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_pack_downloads_to_completion() {
        let engine = engine().await;
        let mut events = engine.subscribe().unwrap();
        let handle = engine.create_pack(request("Oslo")).await.unwrap();
        engine.resume(handle).await.unwrap();

        let mut last = 0;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let EngineEventKind::ProgressChanged(p) = event.kind {
                assert!(p.completed_tiles >= last);
                last = p.completed_tiles;
                if p.is_complete() {
                    break;
                }
            }
        }
        assert_eq!(engine.progress(handle).unwrap().state, EnginePackState::Complete);
    }

    #[tokio::test]
    async fn test_suspend_resets_reported_counters() {
        let engine = SimulatedEngine::open(SimulatedEngineConfig {
            tick_interval: Duration::from_millis(5),
            tiles_per_tick: 1,
            verify_style: false,
            ..Default::default()
        })
        .await
        .unwrap();
        let handle = engine.create_pack(request("Oslo")).await.unwrap();
        engine.resume(handle).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(engine.progress(handle).unwrap().completed_tiles > 0);
        engine.suspend(handle).await.unwrap();
        assert_eq!(engine.progress(handle).unwrap().completed_tiles, 0);

        engine.resume(handle).await.unwrap();
        assert!(engine.progress(handle).unwrap().completed_tiles > 0);
    }

    #[tokio::test]
    async fn test_reload_invalidates_old_handles() {
        let engine = engine().await;
        let handle = engine.create_pack(request("Oslo")).await.unwrap();
        let packs = engine.list_packs().await.unwrap();

        assert_eq!(packs.len(), 1);
        assert!(matches!(engine.progress(handle), Err(EngineError::StaleHandle { .. })));
        assert!(engine.progress(packs[0].handle).is_ok());
        assert_eq!(packs[0].handle.pack_id(), handle.pack_id());
    }

    #[tokio::test]
    async fn test_tile_limit_raises_resource_limit() {
        let pack = request("Oslo");
        let expected = exact_count(&pack.bounds, pack.zoom);
        let limit = expected / 2;
        assert!(limit > 0 && limit < expected);

        let engine = SimulatedEngine::open(
            SimulatedEngineConfig::testing()
                .with_verify_style(false)
                .with_tile_limit(limit),
        )
        .await
        .unwrap();
        let mut events = engine.subscribe().unwrap();
        let handle = engine.create_pack(pack).await.unwrap();
        engine.resume(handle).await.unwrap();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if event.kind == EngineEventKind::ResourceLimitReached {
                break;
            }
        }
        let progress = engine.progress(handle).unwrap();
        assert_eq!(progress.completed_tiles, limit);
        assert_ne!(progress.state, EnginePackState::Complete);
    }

    #[tokio::test]
    async fn test_storage_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let config = SimulatedEngineConfig::testing()
            .with_verify_style(false)
            .with_data_dir(dir.path());

        let engine = SimulatedEngine::open(config.clone()).await.unwrap();
        engine.create_pack(request("Oslo")).await.unwrap();
        engine.create_pack(request("Bergen")).await.unwrap();
        drop(engine);

        let reopened = SimulatedEngine::open(config).await.unwrap();
        let packs = reopened.list_packs().await.unwrap();
        let names: Vec<String> = packs
            .iter()
            .map(|p| p.decode_metadata().unwrap().name)
            .collect();
        assert_eq!(names, vec!["Oslo", "Bergen"]);
    }

    #[tokio::test]
    async fn test_subscribe_only_once() {
        let engine = engine().await;
        assert!(engine.subscribe().is_ok());
        assert!(matches!(engine.subscribe(), Err(EngineError::EventStreamClosed)));
    }
}
