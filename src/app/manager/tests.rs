//! Manager lifecycle tests against the simulated engine

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::*;
use crate::app::engine::{
    EngineEvent, PackProgress, SimulatedEngine, SimulatedEngineConfig, StoredPack,
};
use crate::errors::EngineResult;
use crate::app::models::{BoundingBox, ProgressSnapshot};

struct Harness {
    _dir: TempDir,
    engine: Arc<SimulatedEngine>,
    manager: Arc<OfflineRegionManager>,
}

async fn harness(engine_config: SimulatedEngineConfig) -> Harness {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(
        SimulatedEngine::open(engine_config.with_verify_style(false))
            .await
            .unwrap(),
    );
    let server = Arc::new(LocalStyleServer::start(0).await.unwrap());
    let store = PersistedStatusStore::open_in(dir.path()).await.unwrap();
    let manager = OfflineRegionManager::start(
        ManagerConfig::default().with_reload_dirty_window(Duration::from_millis(10)),
        engine.clone(),
        server,
        LayerRegistry::builtin(),
        store,
    )
    .await
    .unwrap();

    Harness {
        _dir: dir,
        engine,
        manager,
    }
}

fn slow_engine() -> SimulatedEngineConfig {
    SimulatedEngineConfig {
        tick_interval: Duration::from_millis(10),
        tiles_per_tick: 1,
        bytes_per_tile: 1000,
        ..Default::default()
    }
}

fn oslo() -> Region {
    Region::new("Oslo", BoundingBox::validated(59.8, 10.5, 60.0, 10.9).unwrap()).unwrap()
}

fn zoom() -> ZoomRange {
    ZoomRange::new(5, 12).unwrap()
}

async fn next_event(subscription: &mut DownloadSubscription) -> Option<DownloadEvent> {
    timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("timed out waiting for a download event")
}

async fn wait_for_progress(subscription: &mut DownloadSubscription, tiles: u64) -> ProgressSnapshot {
    loop {
        match next_event(subscription).await {
            Some(DownloadEvent::Progress(s)) if s.downloaded_tiles >= tiles => return s,
            Some(DownloadEvent::Progress(_)) => continue,
            other => panic!("unexpected event {:?}", other),
        }
    }
}

async fn wait_for_terminal(subscription: &mut DownloadSubscription) -> DownloadEvent {
    loop {
        match next_event(subscription).await {
            Some(event) if event.is_terminal() => return event,
            Some(_) => continue,
            None => panic!("subscription ended without a terminal event"),
        }
    }
}

#[tokio::test]
async fn test_download_becomes_active() {
    let h = harness(slow_engine()).await;
    let mut subscription = h.manager.download_region(&oslo(), "kartverket", zoom()).await.unwrap();
    let key = subscription.key().clone();

    assert_eq!(h.manager.pack_state(&key).await, Some(PackState::Active));
    wait_for_progress(&mut subscription, 1).await;
    assert_eq!(h.engine.call_counts().create, 1);
    assert_eq!(h.engine.call_counts().resume, 1);
}

#[tokio::test]
async fn test_unknown_layer_uses_default() {
    let h = harness(SimulatedEngineConfig::testing()).await;
    let subscription = h.manager.download_region(&oslo(), "no_such_layer", zoom()).await.unwrap();
    assert_eq!(subscription.key().layer_id(), "kartverket");
}

#[tokio::test]
async fn test_stop_unknown_key_returns_false() {
    let h = harness(SimulatedEngineConfig::testing()).await;
    let key = DownloadKey::new("Nowhere", "osm");
    assert!(!h.manager.stop_download(&key).await.unwrap());
}

#[tokio::test]
async fn test_stop_never_reports_lower_progress() {
    let h = harness(slow_engine()).await;
    let mut subscription = h.manager.download_region(&oslo(), "kartverket", zoom()).await.unwrap();
    let key = subscription.key().clone();
    let observed = wait_for_progress(&mut subscription, 3).await;

    assert!(h.manager.stop_download(&key).await.unwrap());
    assert_eq!(h.manager.pack_state(&key).await, Some(PackState::Suspended));

    match h.manager.get_region_status(&key).await {
        RegionStatus::Snapshot(s) => assert!(s.downloaded_tiles >= observed.downloaded_tiles),
        other => panic!("unexpected status {:?}", other),
    }

    // The stopped subscription ends
    while next_event(&mut subscription).await.is_some() {}
    assert!(!h.manager.stop_download(&key).await.unwrap());
}

#[tokio::test]
async fn test_replacing_subscriber_closes_previous() {
    let h = harness(slow_engine()).await;
    let mut first = h.manager.download_region(&oslo(), "kartverket", zoom()).await.unwrap();
    let mut second = h.manager.download_region(&oslo(), "kartverket", zoom()).await.unwrap();

    while next_event(&mut first).await.is_some() {}
    wait_for_progress(&mut second, 1).await;
    assert_eq!(h.engine.call_counts().create, 1);
}

#[tokio::test]
async fn test_permanent_error_fails_once() {
    let h = harness(slow_engine()).await;
    let mut subscription = h.manager.download_region(&oslo(), "kartverket", zoom()).await.unwrap();
    let key = subscription.key().clone();
    wait_for_progress(&mut subscription, 1).await;

    h.engine.inject_error(1, "style could not be parsed", false);

    match wait_for_terminal(&mut subscription).await {
        DownloadEvent::Failed { message } => assert!(message.contains("parsed")),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(next_event(&mut subscription).await, None);
    assert_eq!(h.manager.pack_state(&key).await, None);
}

#[tokio::test]
async fn test_transient_error_keeps_download_active() {
    let h = harness(slow_engine()).await;
    let mut subscription = h.manager.download_region(&oslo(), "kartverket", zoom()).await.unwrap();
    let key = subscription.key().clone();

    h.engine.inject_error(1, "connection timed out", true);
    wait_for_progress(&mut subscription, 1).await;
    assert_eq!(h.manager.pack_state(&key).await, Some(PackState::Active));

    match wait_for_terminal(&mut subscription).await {
        DownloadEvent::Completed(s) => assert!(s.is_complete),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_resource_limit_counts_as_completion() {
    let h = harness(SimulatedEngineConfig::testing().with_tile_limit(20)).await;
    let mut subscription = h.manager.download_region(&oslo(), "kartverket", zoom()).await.unwrap();
    let key = subscription.key().clone();

    match wait_for_terminal(&mut subscription).await {
        DownloadEvent::Completed(s) => {
            assert!(s.is_complete);
            assert_eq!(s.downloaded_tiles, 20);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let status = h.manager.get_region_status(&key).await;
    assert!(status.snapshot().map(|s| s.is_complete).unwrap_or(false));
}

#[tokio::test]
async fn test_region_names_for_layer() {
    let h = harness(SimulatedEngineConfig::testing()).await;
    let bergen = Region::new("Bergen", BoundingBox::validated(60.3, 5.2, 60.45, 5.45).unwrap()).unwrap();

    let mut a = h.manager.download_region(&oslo(), "kartverket", zoom()).await.unwrap();
    let mut b = h.manager.download_region(&bergen, "kartverket", zoom()).await.unwrap();
    let mut c = h.manager.download_region(&bergen, "osm", zoom()).await.unwrap();
    for subscription in [&mut a, &mut b, &mut c] {
        wait_for_terminal(subscription).await;
    }

    assert_eq!(
        h.manager.get_region_names_for_layer("kartverket").await,
        vec!["Bergen".to_string(), "Oslo".to_string()]
    );
    assert_eq!(h.manager.get_region_names_for_layer("osm").await, vec!["Bergen".to_string()]);
    assert!(h.manager.get_region_names_for_layer("sjokart").await.is_empty());
}

#[tokio::test]
async fn test_shutdown_rejects_new_downloads() {
    let h = harness(SimulatedEngineConfig::testing()).await;
    h.manager.shutdown().await;

    let result = h.manager.download_region(&oslo(), "kartverket", zoom()).await;
    assert!(matches!(result, Err(ManagerError::ShutDown)));
}

#[tokio::test]
async fn test_subscription_stream_yields_until_completion() {
    use futures::StreamExt;

    let h = harness(SimulatedEngineConfig::testing()).await;
    let subscription = h.manager.download_region(&oslo(), "kartverket", zoom()).await.unwrap();

    let events: Vec<DownloadEvent> = timeout(
        Duration::from_secs(5),
        subscription.into_stream().collect::<Vec<_>>(),
    )
    .await
    .unwrap();

    assert!(matches!(events.last(), Some(DownloadEvent::Completed(_))));
}

/// Engine whose pack creation waits until the test releases it
struct GatedEngine {
    inner: Arc<SimulatedEngine>,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl TileEngine for GatedEngine {
    async fn create_pack(&self, request: PackRequest) -> EngineResult<EngineHandle> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.create_pack(request).await
    }

    async fn resume(&self, handle: EngineHandle) -> EngineResult<()> {
        self.inner.resume(handle).await
    }

    async fn suspend(&self, handle: EngineHandle) -> EngineResult<()> {
        self.inner.suspend(handle).await
    }

    async fn delete(&self, handle: EngineHandle) -> EngineResult<()> {
        self.inner.delete(handle).await
    }

    async fn list_packs(&self) -> EngineResult<Vec<StoredPack>> {
        self.inner.list_packs().await
    }

    fn progress(&self, handle: EngineHandle) -> EngineResult<PackProgress> {
        self.inner.progress(handle)
    }

    fn request_progress(&self, handle: EngineHandle) -> EngineResult<()> {
        self.inner.request_progress(handle)
    }

    fn subscribe(&self) -> EngineResult<mpsc::UnboundedReceiver<EngineEvent>> {
        self.inner.subscribe()
    }
}

#[tokio::test]
async fn test_delete_while_creating_removes_fresh_pack() {
    let dir = TempDir::new().unwrap();
    let inner = Arc::new(
        SimulatedEngine::open(SimulatedEngineConfig::testing().with_verify_style(false))
            .await
            .unwrap(),
    );
    let gated = Arc::new(GatedEngine {
        inner: inner.clone(),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let server = Arc::new(LocalStyleServer::start(0).await.unwrap());
    let store = PersistedStatusStore::open_in(dir.path()).await.unwrap();
    let manager = OfflineRegionManager::start(
        ManagerConfig::default().with_reload_dirty_window(Duration::from_millis(10)),
        gated.clone(),
        server,
        LayerRegistry::builtin(),
        store,
    )
    .await
    .unwrap();
    let key = DownloadKey::new("Oslo", "kartverket");

    let download = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.download_region(&oslo(), "kartverket", zoom()).await })
    };
    gated.entered.notified().await;
    assert_eq!(manager.pack_state(&key).await, Some(PackState::Creating));

    assert!(manager.delete_region(&key).await.unwrap());
    assert_eq!(manager.get_region_status(&key).await, RegionStatus::NotFound);

    gated.release.notify_one();
    let mut subscription = download.await.unwrap().unwrap();
    assert!(next_event(&mut subscription).await.is_none());

    manager.wait_for_background().await;
    assert_eq!(inner.pack_count(), 0);
    assert_eq!(inner.call_counts().delete, 1);
    assert_eq!(manager.get_region_status(&key).await, RegionStatus::NotFound);
}
