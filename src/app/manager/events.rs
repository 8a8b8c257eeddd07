//! Engine event handling
//!
//! Engine notifications are consumed by a single task that owns the
//! receiving end of the engine's event stream. The loop holds only a weak
//! reference to the manager so dropping the manager ends it.

use std::sync::Weak;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::state::{ManagerState, PackState, StoredEntry};
use super::{ManagerNotice, OfflineRegionManager};
use crate::app::engine::{EngineEvent, EngineEventKind, EngineHandle};
use crate::app::models::{DownloadEvent, DownloadKey, ProgressSnapshot};

pub(super) async fn run_event_loop(
    manager: Weak<OfflineRegionManager>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!("Engine event loop started");
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    warn!("Engine event stream closed");
                    break;
                };
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.handle_engine_event(event).await;
            }
            _ = shutdown_rx.recv() => {
                debug!("Engine event loop received shutdown signal");
                break;
            }
        }
    }
    debug!("Engine event loop stopped");
}

/// Follow-up work decided under the state lock
#[derive(Default)]
struct Outcome {
    persist: Option<(DownloadKey, ProgressSnapshot)>,
    suspend: Option<(DownloadKey, EngineHandle)>,
    ready_layers: Vec<String>,
}

impl OfflineRegionManager {
    pub(super) async fn handle_engine_event(&self, event: EngineEvent) {
        let EngineEvent { handle, kind } = event;
        let mut outcome = Outcome::default();

        {
            let mut state = self.state.lock().await;
            if state.retired.contains(&handle.pack_id()) {
                debug!("Dropping event for deleted {}", handle);
                return;
            }
            let Some((key, owned_by_record)) = state.owner_of(&handle) else {
                debug!("Dropping event for unknown {}", handle);
                return;
            };

            match kind {
                EngineEventKind::ProgressChanged(progress) => {
                    let snapshot = progress.snapshot();
                    if owned_by_record {
                        outcome.persist = record_progress(&mut state, &key, snapshot);
                    } else if let Some(entry) = state.stored.get_mut(&key) {
                        let merged = entry
                            .progress
                            .map_or(snapshot, |previous| previous.merged_with(&snapshot));
                        entry.progress = Some(merged);
                    }
                    outcome.ready_layers = state.take_ready_layers();
                }
                EngineEventKind::Error {
                    message,
                    transient: true,
                } => {
                    warn!("{}: transient engine error, engine will retry: {}", key, message);
                }
                EngineEventKind::Error {
                    message,
                    transient: false,
                } => {
                    error!("{}: engine error: {}", key, message);
                    if let Some(mut record) = state.records.remove(&key) {
                        record.transition(&key, PackState::Failed);
                        record.notify(&key, DownloadEvent::Failed { message });
                        outcome.suspend = Some((key, handle));
                    }
                }
                EngineEventKind::ResourceLimitReached => {
                    if owned_by_record {
                        warn!("{}: engine tile limit reached, treating as complete", key);
                        let observed = self
                            .engine
                            .progress(handle)
                            .map(|p| p.snapshot())
                            .unwrap_or_default();
                        let merged = state.merge_cached(&key, observed);
                        let completed = ProgressSnapshot {
                            is_complete: true,
                            ..merged
                        };
                        state.cached.insert(key.clone(), completed);
                        outcome.persist = Some(finish_record(&mut state, &key, completed));
                    }
                }
            }
        }

        if let Some((key, snapshot)) = outcome.persist {
            if let Err(e) = self.store.put(&key, snapshot).await {
                error!("{}: failed to persist status: {}", key, e);
            }
        }

        if let Some((key, handle)) = outcome.suspend {
            let engine = self.engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.suspend(handle).await {
                    debug!("{}: suspend after failure: {}", key, e);
                }
            });
        }

        for layer in outcome.ready_layers {
            self.publish(ManagerNotice::LayerStatsReady(layer));
        }
    }
}

/// Merge progress for a record and forward it; returns the snapshot to
/// persist when the download completed
fn record_progress(
    state: &mut ManagerState,
    key: &DownloadKey,
    snapshot: ProgressSnapshot,
) -> Option<(DownloadKey, ProgressSnapshot)> {
    let merged = state.merge_cached(key, snapshot);
    if let Some(entry) = state.stored.get_mut(key) {
        entry.progress = Some(merged);
    }

    if merged.is_complete {
        return Some(finish_record(state, key, merged));
    }

    let record = state.records.get_mut(key)?;
    if record.state.is_busy() {
        record.notify(key, DownloadEvent::Progress(merged));
    }
    None
}

/// Remove a completed record, delivering the final event
///
/// The pack stays known as a stored pack so it can be deleted or re-opened
/// without enumerating storage.
fn finish_record(
    state: &mut ManagerState,
    key: &DownloadKey,
    snapshot: ProgressSnapshot,
) -> (DownloadKey, ProgressSnapshot) {
    if let Some(mut record) = state.records.remove(key) {
        record.transition(key, PackState::Complete);
        if let Some(handle) = record.handle {
            state.stored.insert(
                key.clone(),
                StoredEntry {
                    handle,
                    progress: Some(snapshot),
                },
            );
        }
        let elapsed = Utc::now().signed_duration_since(record.started_at);
        info!(
            "{}: complete, {} tiles, {} bytes in {}s",
            key,
            snapshot.downloaded_tiles,
            snapshot.downloaded_bytes,
            elapsed.num_seconds()
        );
        record.notify(key, DownloadEvent::Completed(snapshot));
    }
    (key.clone(), snapshot)
}
