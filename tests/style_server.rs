//! Style server behavior over real HTTP
//!
//! Styles are fetched with reqwest the way a tile engine would, and the
//! simulated engine is run with style verification enabled.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::time::timeout;

use offline_regions::app::{
    BoundingBox, DownloadEvent, LayerRegistry, LocalStyleServer, ManagerConfig,
    OfflineRegionManager, PersistedStatusStore, Region, SimulatedEngine, SimulatedEngineConfig,
    StyleDocumentBuilder, ZoomRange,
};
use offline_regions::errors::{EngineError, ManagerError};

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_registered_style_is_served_as_json() {
    let server = LocalStyleServer::start(0).await.unwrap();
    let registry = LayerRegistry::builtin();
    let osm = registry.resolve("osm");
    server
        .set_style(&osm.id, StyleDocumentBuilder::raster_style(osm).to_json().unwrap())
        .await
        .unwrap();

    let response = client()
        .get(server.style_url("osm").unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers()[reqwest::header::CONTENT_TYPE],
        "application/json"
    );

    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["version"], 8);
    assert_eq!(json["sources"]["osm"]["type"], "raster");
    assert_eq!(
        json["sources"]["osm"]["tiles"][0],
        osm.tile_url_template.as_str()
    );
    assert_eq!(json["layers"][0]["source"], "osm");

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_style_is_empty_and_other_paths_are_missing() {
    let server = LocalStyleServer::start(0).await.unwrap();
    let http = client();

    let json: serde_json::Value = http
        .get(server.style_url("nothing_here").unwrap())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        json,
        serde_json::json!({ "version": 8, "sources": {}, "layers": [] })
    );

    let response = http
        .get(format!("http://{}/tiles/1/2/3.png", server.local_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let response = http
        .post(server.style_url("osm").unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

    server.stop().await;
}

async fn manager_with(
    dir: &TempDir,
    server: Arc<LocalStyleServer>,
) -> Arc<OfflineRegionManager> {
    let engine = Arc::new(
        SimulatedEngine::open(SimulatedEngineConfig::testing().with_data_dir(dir.path()))
            .await
            .unwrap(),
    );
    let store = PersistedStatusStore::open_in(dir.path()).await.unwrap();
    OfflineRegionManager::start(ManagerConfig::default(), engine, server, LayerRegistry::builtin(), store)
        .await
        .unwrap()
}

fn oslo() -> Region {
    Region::new("Oslo", BoundingBox::validated(59.8, 10.5, 60.0, 10.9).unwrap()).unwrap()
}

#[tokio::test]
async fn test_engine_resolves_style_from_server() {
    let dir = TempDir::new().unwrap();
    let server = Arc::new(LocalStyleServer::start(0).await.unwrap());
    let manager = manager_with(&dir, server.clone()).await;

    let mut subscription = manager
        .download_region(&oslo(), "sjokart", ZoomRange::new(5, 10).unwrap())
        .await
        .unwrap();
    assert!(server.has_style("sjokart").await);

    let last = timeout(Duration::from_secs(10), async {
        let mut last = None;
        while let Some(event) = subscription.recv().await {
            last = Some(event);
        }
        last
    })
    .await
    .unwrap();
    assert!(matches!(last, Some(DownloadEvent::Completed(_))));

    manager.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn test_unreachable_style_fails_download_start() {
    let dir = TempDir::new().unwrap();
    let server = Arc::new(LocalStyleServer::start(0).await.unwrap());
    let manager = manager_with(&dir, server.clone()).await;
    server.stop().await;

    let result = manager
        .download_region(&oslo(), "kartverket", ZoomRange::new(5, 10).unwrap())
        .await;

    match result {
        Err(ManagerError::Engine { source, .. }) => {
            assert!(matches!(source, EngineError::Transient { .. }))
        }
        other => panic!("unexpected result {:?}", other.map(|s| s.key().clone())),
    }
    assert_eq!(
        manager.get_region_names_for_layer("kartverket").await,
        Vec::<String>::new()
    );
}
