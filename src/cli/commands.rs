//! Command handlers for the Offline Regions CLI
//!
//! This module implements the command handlers that coordinate between
//! CLI arguments and the core application functionality.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::app::{
    estimate_range, exact_count, DownloadEvent, DownloadKey, HexGrid, HexStatus, LayerStats,
    LocalStyleServer, ManagerNotice, OfflineRegionManager, PersistedStatusStore, Region,
    RegionStatus, SimulatedEngine, StyleDocumentBuilder,
};
use crate::cli::{
    format_bytes, DownloadArgs, EstimateArgs, HexAction, HexArgs, LayerArgs, ListArgs,
    ProgressConfig, ProgressDisplay, RegionArgs, ServeArgs, SessionOutcome,
};
use crate::config::RuntimeConfig;
use crate::constants::cli::{STATUS_POLL_INTERVAL, STATUS_TIMEOUT};
use crate::errors::{AppError, ServerError, Result};

/// Components shared by the region commands
struct Session {
    server: Arc<LocalStyleServer>,
    manager: Arc<OfflineRegionManager>,
}

impl Session {
    async fn open(runtime: &RuntimeConfig) -> Result<Self> {
        let setup_start = Instant::now();

        let server = Arc::new(start_server(runtime.port).await?);
        let engine = Arc::new(SimulatedEngine::open(runtime.engine.clone()).await?);
        let store = PersistedStatusStore::open_in(&runtime.data_dir).await?;
        debug!("Status store at {}", store.path().display());

        let manager = OfflineRegionManager::start(
            runtime.manager.clone(),
            engine,
            server.clone(),
            runtime.registry.clone(),
            store,
        )
        .await?;

        info!("Session ready in {:?}", setup_start.elapsed());
        Ok(Self { server, manager })
    }

    async fn close(self) {
        self.manager.shutdown().await;
        self.server.stop().await;
    }
}

/// Bind the configured port, falling back to an ephemeral one when another
/// process (such as `serve`) already holds it
async fn start_server(port: u16) -> Result<LocalStyleServer> {
    match LocalStyleServer::start(port).await {
        Ok(server) => Ok(server),
        Err(ServerError::Bind { port, source }) if port != 0 => {
            warn!("Port {} unavailable ({}), using an ephemeral port", port, source);
            Ok(LocalStyleServer::start(0).await?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Handle the download command
///
/// Streams progress until the region completes or fails. Ctrl-C stops the
/// download and keeps the pack so the same command resumes it.
pub async fn handle_download(args: DownloadArgs, runtime: RuntimeConfig) -> Result<()> {
    args.validate().map_err(AppError::generic)?;
    let zoom = args.zoom_range().map_err(AppError::generic)?;
    let grid = HexGrid::new(runtime.grid)?;

    let name = args
        .region_name()
        .ok_or_else(|| AppError::generic("A region name is required"))?;
    let region = match (args.bbox, args.hex) {
        (Some(bbox), _) => Region::new(name, bbox)?,
        (None, Some(hex)) => Region::new(name, grid.hex_bounds(&hex))?
            .with_polygon(vec![grid.hex_vertices(&hex).to_vec()]),
        (None, None) => return Err(AppError::generic("Specify an area with --bbox or --hex")),
    };

    let session = Session::open(&runtime).await?;
    let mut subscription = session
        .manager
        .download_region(&region, &args.layer, zoom)
        .await?;
    let key = subscription.key().clone();
    info!("Downloading {} at zoom {}..={}", key, zoom.min, zoom.max);

    let mut display = ProgressDisplay::new(ProgressConfig {
        enable_progress_bars: !args.no_progress,
        ..Default::default()
    });
    display.start(&key.to_string(), estimate_range(region.bounding_box(), zoom));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome = loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    break SessionOutcome::Stopped(display.latest());
                };
                display.update(&event);
                match event {
                    DownloadEvent::Completed(snapshot) => break SessionOutcome::Completed(snapshot),
                    DownloadEvent::Failed { message } => break SessionOutcome::Failed(message),
                    DownloadEvent::Progress(_) => {}
                }
            }
            signal = &mut ctrl_c => {
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Ctrl-C received, stopping {}", key);
                session.manager.stop_download(&key).await?;
                break SessionOutcome::Stopped(display.latest());
            }
        }
    };

    display.finish_with(&outcome);
    session.close().await;

    match outcome {
        SessionOutcome::Failed(message) => Err(AppError::generic(format!(
            "Download of {} failed: {}",
            key, message
        ))),
        _ => Ok(()),
    }
}

/// Handle the status command
pub async fn handle_status(args: RegionArgs, runtime: RuntimeConfig) -> Result<()> {
    let session = Session::open(&runtime).await?;
    let key = args.key();
    let mut notices = session.manager.subscribe_notices();

    let status = settled_status(&session.manager, &key, &mut notices).await;
    match status {
        RegionStatus::Snapshot(s) => {
            println!("{}", key);
            println!(
                "  Tiles: {}/{} ({:.1}%)",
                s.downloaded_tiles,
                s.total_tiles,
                s.percent()
            );
            println!("  Size: {}", format_bytes(s.downloaded_bytes));
            println!("  Complete: {}", if s.is_complete { "yes" } else { "no" });
        }
        RegionStatus::Pending => {
            println!("{}: status not available yet, try again shortly", key);
        }
        RegionStatus::NotFound => {
            println!("No download found for {}", key);
        }
    }

    session.close().await;
    Ok(())
}

/// Handle the delete command
pub async fn handle_delete(args: RegionArgs, runtime: RuntimeConfig) -> Result<()> {
    let session = Session::open(&runtime).await?;
    let key = args.key();

    let deleted = session.manager.delete_region(&key).await?;
    // Waits for the engine to drop the pack
    session.close().await;

    if deleted {
        println!("🗑️  Deleted {}", key);
    } else {
        println!("No download found for {}", key);
    }
    Ok(())
}

/// Handle the stats command
pub async fn handle_stats(args: LayerArgs, runtime: RuntimeConfig) -> Result<()> {
    let session = Session::open(&runtime).await?;
    let layer = session.manager.registry().resolve(&args.layer).clone();
    let mut notices = session.manager.subscribe_notices();

    let deadline = Instant::now() + STATUS_TIMEOUT;
    let stats = loop {
        let stats = session.manager.get_layer_stats(&layer.id).await;
        if !stats.is_pending() || Instant::now() >= deadline {
            break stats;
        }
        wait_for_notice(&mut notices).await;
    };

    match stats {
        LayerStats::Totals { bytes, tiles } => {
            let regions = session.manager.get_region_names_for_layer(&layer.id).await;
            println!("📊 {} ({})", layer.display_name, layer.id);
            println!("  Regions: {}", regions.len());
            println!("  Tiles: {}", tiles);
            println!("  Size: {}", format_bytes(bytes));
        }
        LayerStats::Pending => {
            println!("{}: statistics not available yet, try again shortly", layer.id);
        }
    }

    session.close().await;
    Ok(())
}

/// Handle the list command
pub async fn handle_list(args: ListArgs, runtime: RuntimeConfig) -> Result<()> {
    let session = Session::open(&runtime).await?;
    session.manager.enumerate_if_needed().await;
    let mut notices = session.manager.subscribe_notices();

    let layer_ids: Vec<String> = match args.layer {
        Some(layer) => vec![layer],
        None => session
            .manager
            .registry()
            .all()
            .iter()
            .map(|l| l.id.clone())
            .collect(),
    };

    let mut listed = 0;
    for layer_id in layer_ids {
        let names = session.manager.get_region_names_for_layer(&layer_id).await;
        if names.is_empty() {
            continue;
        }
        println!("{}:", layer_id);
        for name in names {
            let key = DownloadKey::new(&name, &layer_id);
            let status = settled_status(&session.manager, &key, &mut notices).await;
            match status.snapshot() {
                Some(s) if s.is_complete => {
                    println!("  ✅ {} ({})", name, format_bytes(s.downloaded_bytes))
                }
                Some(s) => println!("  ⏸️  {} ({:.1}%)", name, s.percent()),
                None => println!("  ❔ {}", name),
            }
            listed += 1;
        }
    }

    if listed == 0 {
        println!("No regions downloaded yet");
    }

    session.close().await;
    Ok(())
}

/// Handle the layers command
pub fn handle_layers(runtime: &RuntimeConfig) -> Result<()> {
    let default_id = runtime.registry.default_layer().id.clone();
    println!("{:<14} {}", "ID", "NAME");
    for layer in runtime.registry.all() {
        let marker = if layer.id == default_id { " (default)" } else { "" };
        println!("{:<14} {}{}", layer.id, layer.display_name, marker);
    }
    Ok(())
}

/// Handle the hex commands
pub async fn handle_hex(args: HexArgs, runtime: RuntimeConfig) -> Result<()> {
    let grid = HexGrid::new(runtime.grid)?;

    match args.action {
        HexAction::At { lat, lon } => {
            let hex = grid.hex_at_point(lat, lon)?;
            let center = grid.hex_center(&hex);
            let bounds = grid.hex_bounds(&hex);
            println!("{}", hex);
            println!("  Center: {:.5}, {:.5}", center.lat, center.lon);
            println!(
                "  Bounds: {:.5},{:.5},{:.5},{:.5}",
                bounds.south, bounds.west, bounds.north, bounds.east
            );
        }
        HexAction::Bounds { bbox } => {
            let hexes = grid.hexes_in_bounds(&bbox);
            for hex in &hexes {
                println!("{}", hex);
            }
            info!("{} hexes intersect the bounding box", hexes.len());
        }
        HexAction::Overlay {
            bbox,
            layer,
            output,
        } => {
            let layer = runtime.registry.resolve(&layer).clone();
            let hexes = grid.hexes_in_bounds(&bbox);

            // Hex downloads are named after their hex id
            let store = PersistedStatusStore::open_in(&runtime.data_dir).await?;
            let mut statuses = HashMap::new();
            for hex in &hexes {
                if let Some(snapshot) = store.get(&DownloadKey::new(hex.id(), &layer.id)).await {
                    let status = if snapshot.is_complete {
                        HexStatus::Downloaded
                    } else {
                        HexStatus::Downloading
                    };
                    statuses.insert(*hex, status);
                }
            }

            let json =
                StyleDocumentBuilder::hex_overlay_style(&layer, &grid, &hexes, &statuses).to_json()?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, json).await?;
                    println!("Wrote overlay with {} hexes to {}", hexes.len(), path.display());
                }
                None => println!("{}", json),
            }
        }
    }
    Ok(())
}

/// Handle the estimate command
pub fn handle_estimate(args: EstimateArgs) -> Result<()> {
    let zoom = args.zoom_range().map_err(AppError::generic)?;
    println!("Zoom {}..={}", zoom.min, zoom.max);
    println!("  Estimated tiles: {}", estimate_range(&args.bbox, zoom));
    println!("  Exact tiles: {}", exact_count(&args.bbox, zoom));
    Ok(())
}

/// Handle the serve command
///
/// Publishes a raster style for every layer and serves until Ctrl-C.
pub async fn handle_serve(args: ServeArgs, runtime: RuntimeConfig) -> Result<()> {
    let server = LocalStyleServer::start(args.port.unwrap_or(runtime.port)).await?;

    for layer in runtime.registry.all() {
        let style = StyleDocumentBuilder::raster_style(layer).to_json()?;
        server.set_style(&layer.id, style).await?;
        println!("{:<14} {}", layer.id, server.style_url(&layer.id)?);
    }
    println!();
    println!("Serving styles on http://{} (Ctrl-C to stop)", server.local_addr());

    tokio::signal::ctrl_c().await?;
    println!();
    server.stop().await;
    Ok(())
}

/// Poll a region's status until it is no longer pending or the timeout hits
async fn settled_status(
    manager: &Arc<OfflineRegionManager>,
    key: &DownloadKey,
    notices: &mut broadcast::Receiver<ManagerNotice>,
) -> RegionStatus {
    let deadline = Instant::now() + STATUS_TIMEOUT;
    loop {
        let status = manager.get_region_status(key).await;
        if !status.is_pending() || Instant::now() >= deadline {
            return status;
        }
        wait_for_notice(notices).await;
    }
}

/// Sleep until the next manager notice or one poll interval
async fn wait_for_notice(notices: &mut broadcast::Receiver<ManagerNotice>) {
    if let Ok(Ok(notice)) = tokio::time::timeout(STATUS_POLL_INTERVAL, notices.recv()).await {
        debug!("Manager notice: {:?}", notice);
    }
}
