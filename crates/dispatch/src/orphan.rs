//! Periodic recovery of orphaned frames.
//!
//! A frame is orphaned when it has sat `Running` past the configured timeout
//! with no proc while its job is still pending (the host vanished mid-run).
//! Orphans are cleared back into the queue with the orphan exit status, which
//! does not count against their retries.

use std::sync::Arc;
use std::time::Duration;

use spool_core::frame::EXIT_STATUS_FRAME_ORPHAN;
use spool_db::repositories::FrameRepo;
use spool_events::EventBus;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::error::DispatchResult;
use crate::frame::FrameStateMachine;

/// Orphans handled per sweep.
const SWEEP_BATCH: i64 = 500;

/// Clear every orphan found older than `window`, up to `limit`. Returns how
/// many were cleared; frames that moved on meanwhile are skipped.
pub async fn sweep_once(
    pool: &PgPool,
    frames: &FrameStateMachine,
    window: Duration,
    limit: i64,
) -> DispatchResult<usize> {
    let orphans = FrameRepo::find_orphans(pool, window, limit).await?;
    let mut cleared = 0;
    for orphan in orphans {
        match frames.clear(orphan.id, orphan.version, EXIT_STATUS_FRAME_ORPHAN).await {
            Ok(_) => {
                tracing::warn!(
                    frame_id = orphan.id,
                    host_id = ?orphan.host_id,
                    "Orphaned frame requeued",
                );
                cleared += 1;
            }
            Err(e) if e.is_recoverable() => {
                tracing::debug!(frame_id = orphan.id, error = %e, "Orphan moved on before clear");
            }
            Err(e) => {
                tracing::warn!(frame_id = orphan.id, error = %e, "Failed to clear orphaned frame");
            }
        }
    }
    Ok(cleared)
}

/// Run the orphan sweep loop until `cancel` is triggered.
pub async fn run(pool: PgPool, config: Arc<DispatchConfig>, bus: Arc<EventBus>, cancel: CancellationToken) {
    let frames = FrameStateMachine::new(pool.clone(), bus);

    tracing::info!(
        timeout_secs = config.orphan_timeout.as_secs(),
        interval_secs = config.orphan_sweep_interval.as_secs(),
        "Orphan sweep started"
    );

    let mut interval = tokio::time::interval(config.orphan_sweep_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Orphan sweep stopping");
                break;
            }
            _ = interval.tick() => {
                match sweep_once(&pool, &frames, config.orphan_timeout, SWEEP_BATCH).await {
                    Ok(cleared) if cleared > 0 => {
                        tracing::info!(cleared, "Orphan sweep: frames requeued");
                    }
                    Ok(_) => {
                        tracing::debug!("Orphan sweep: nothing to do");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Orphan sweep failed");
                    }
                }
            }
        }
    }
}
