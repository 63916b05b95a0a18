//! Background auto-save.
//!
//! Snapshots every session on a fixed interval, skipping sessions whose
//! state hash has not moved since the previous pass. Save metadata
//! (count, last hash, last save time) lives in the `auto_save` aux doc
//! so the schedule survives restarts.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::storage::{DocKind, SharedStorage};

use super::state::stable_hash;

/// Handle to the running auto-save task; dropping it stops the loop.
pub struct AutoSave {
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl AutoSave {
    /// Spawn the interval task. An interval of 0 disables auto-save and
    /// returns an inert handle.
    pub fn spawn(storage: SharedStorage, interval_secs: u64) -> Self {
        if interval_secs == 0 {
            return Self { shutdown_tx: None };
        }
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick is a no-op
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        info!("auto-save task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        run_pass(&storage).await;
                    }
                }
            }
        });
        info!(interval_secs, "auto-save task started");
        Self {
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for AutoSave {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_pass(storage: &SharedStorage) {
    let sessions = match storage.list_sessions().await {
        Ok(sessions) => sessions,
        Err(e) => {
            warn!(error = %e, "auto-save: listing sessions failed");
            return;
        }
    };
    for session in sessions {
        if let Err(e) = save_if_dirty(storage, &session.slug).await {
            warn!(slug = %session.slug, error = %e, "auto-save failed");
        }
    }
}

const AUTO_SAVE_OWNER: &str = "auto-save";
const AUTO_SAVE_TTL: u64 = 30;

async fn save_if_dirty(
    storage: &SharedStorage,
    slug: &str,
) -> crate::core::error::EngineResult<()> {
    let state = storage.load_state(slug).await?;
    let hash = stable_hash(&state.to_value()?);

    let meta = storage.load_doc(slug, DocKind::AutoSave).await?;
    let last_hash = meta.get("last_hash").and_then(|v| v.as_str());
    if last_hash == Some(hash.as_str()) {
        debug!(slug, "auto-save: unchanged, skipping");
        return Ok(());
    }

    // Snapshots run under the session lock like every other writer. An
    // active player lease wins; this session gets picked up next pass.
    match storage.claim_lock(slug, AUTO_SAVE_OWNER, AUTO_SAVE_TTL).await {
        Ok(_) => {}
        Err(crate::core::error::EngineError::LockHeld { owner }) => {
            debug!(slug, holder = %owner, "auto-save: session locked, skipping");
            return Ok(());
        }
        Err(e) => return Err(e),
    }
    let result = storage.create_snapshot(slug, "auto", "auto").await;
    let release = storage.release_lock(slug, Some(AUTO_SAVE_OWNER)).await;
    let record = result?;
    release?;
    let save_count = meta.get("save_count").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
    storage
        .save_doc(
            slug,
            DocKind::AutoSave,
            &json!({
                "last_save_time": Utc::now().to_rfc3339(),
                "last_hash": hash,
                "save_count": save_count,
                "last_save_id": record.save_id,
            }),
        )
        .await?;
    info!(slug, save_id = %record.save_id, "auto-save completed");
    Ok(())
}
