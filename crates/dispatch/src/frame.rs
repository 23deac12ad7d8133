//! Frame state machine service.
//!
//! Each operation is one transaction: a versioned frame update plus whatever
//! it drags along (proc release, dependency propagation, job completion).
//! Events are published only after commit.

use std::sync::Arc;

use spool_core::error::CoreError;
use spool_core::frame::{resolve_stop_state, stop_target};
use spool_core::states::FrameState;
use spool_core::types::DbId;
use spool_db::models::frame::Frame;
use spool_db::repositories::{FrameRepo, JobRepo, LayerRepo, ProcRepo};
use spool_events::bus::{FRAME_CHECKPOINTED, FRAME_CLEARED, FRAME_EATEN, FRAME_RETRIED, FRAME_STOPPED};
use spool_events::{DispatchEvent, EventBus};
use sqlx::PgPool;

use crate::depend::{self, publish_all};
use crate::error::{DispatchError, DispatchResult};
use crate::proc::release_proc;

/// Attempts at a stop before giving up on a frame that keeps changing.
const STOP_ATTEMPTS: usize = 3;

/// How an external checkpoint agent reported back.
#[derive(Debug, Clone, Copy)]
enum CheckpointOutcome {
    Completed,
    Disabled,
}

impl CheckpointOutcome {
    fn phase(self) -> &'static str {
        match self {
            CheckpointOutcome::Completed => "completed",
            CheckpointOutcome::Disabled => "disabled",
        }
    }

    fn action(self) -> &'static str {
        match self {
            CheckpointOutcome::Completed => "complete a checkpoint",
            CheckpointOutcome::Disabled => "disable its checkpoint",
        }
    }
}

pub struct FrameStateMachine {
    pool: PgPool,
    bus: Arc<EventBus>,
}

impl FrameStateMachine {
    pub fn new(pool: PgPool, bus: Arc<EventBus>) -> Self {
        Self { pool, bus }
    }

    /// Move every `Setup` frame of a launched job into the queue.
    pub async fn activate_job(&self, job_id: DbId) -> DispatchResult<u64> {
        let activated = FrameRepo::activate_job(&self.pool, job_id).await?;
        tracing::info!(job_id, frames = activated, "Job activated");
        Ok(activated)
    }

    // ── Run results ──────────────────────────────────────────────────────

    /// Record that a running frame's process exited.
    ///
    /// The target state follows from the exit status and the job's retry
    /// policy. The frame's proc is released and dependents are notified in
    /// the same transaction.
    pub async fn stop(&self, frame_id: DbId, exit_status: i32, max_rss: i64) -> DispatchResult<Frame> {
        for attempt in 1..=STOP_ATTEMPTS {
            let frame = self.load(frame_id).await?;
            let current = frame.state()?;
            if !matches!(current, FrameState::Running | FrameState::Checkpoint) {
                return Err(CoreError::Conflict(format!(
                    "Frame {frame_id} is {current}, not running"
                ))
                .into());
            }
            let job = JobRepo::find_by_id(&self.pool, frame.job_id)
                .await?
                .ok_or(DispatchError::NotFound {
                    entity: "Job",
                    id: frame.job_id,
                })?;
            let resolved = resolve_stop_state(
                exit_status,
                frame.retries,
                job.max_retries,
                frame.depend_count,
                job.auto_eat,
            );
            let target = stop_target(current, resolved);

            let mut tx = self.pool.begin().await?;
            let Some(stopped) =
                FrameRepo::stop(&mut *tx, frame_id, frame.version, target, exit_status, max_rss).await?
            else {
                tracing::debug!(frame_id, attempt, "Frame changed during stop, retrying");
                continue;
            };

            let mut events = Vec::new();
            if let Some(proc) = ProcRepo::find_by_frame(&mut *tx, frame_id).await? {
                release_proc(&mut tx, proc.id, &mut events).await?;
            }
            depend::on_frame_done(&mut tx, &stopped, &mut events).await?;
            tx.commit().await?;

            let state = stopped.state()?;
            tracing::info!(
                frame_id,
                exit_status,
                state = %state,
                retries = stopped.retries,
                "Frame stopped",
            );
            self.bus.publish(
                DispatchEvent::new(FRAME_STOPPED)
                    .about("frame", frame_id)
                    .with_detail(serde_json::json!({
                        "state": state.as_str(),
                        "exit_status": exit_status,
                        "max_rss": stopped.max_rss,
                    })),
            );
            publish_all(&self.bus, events);
            return Ok(stopped);
        }
        Err(DispatchError::StaleVersion {
            entity: "Frame",
            id: frame_id,
        })
    }

    /// Requeue a `Running` frame that has no proc, recording `exit_status`.
    pub async fn clear(&self, frame_id: DbId, version: i32, exit_status: i32) -> DispatchResult<Frame> {
        let Some(cleared) = FrameRepo::clear(&self.pool, frame_id, version, exit_status).await? else {
            return Err(self.rejected(frame_id, version, "be cleared").await);
        };
        tracing::info!(frame_id, exit_status, "Frame cleared");
        self.bus.publish(
            DispatchEvent::new(FRAME_CLEARED)
                .about("frame", frame_id)
                .with_detail(serde_json::json!({ "exit_status": exit_status })),
        );
        Ok(cleared)
    }

    // ── Operator actions ─────────────────────────────────────────────────

    /// Requeue a finished frame. Dependents it had released are blocked
    /// again and a finished job is reopened.
    pub async fn retry(&self, frame_id: DbId, version: i32) -> DispatchResult<Frame> {
        let mut tx = self.pool.begin().await?;
        let Some(retried) = FrameRepo::retry(&mut *tx, frame_id, version).await? else {
            drop(tx);
            return Err(self.rejected(frame_id, version, "be retried").await);
        };
        let reactivated = depend::reactivate_for_retry(&mut tx, &retried).await?;
        let reopened = JobRepo::reopen(&mut *tx, retried.job_id).await?;
        tx.commit().await?;

        tracing::info!(frame_id, reactivated, reopened, "Frame retried");
        self.bus.publish(
            DispatchEvent::new(FRAME_RETRIED)
                .about("frame", frame_id)
                .with_detail(serde_json::json!({ "reactivated_depends": reactivated })),
        );
        Ok(retried)
    }

    /// Give up on a frame without running it (again). Counts as satisfied
    /// for its dependents.
    pub async fn eat(&self, frame_id: DbId, version: i32) -> DispatchResult<Frame> {
        let mut tx = self.pool.begin().await?;
        let from = [FrameState::Waiting, FrameState::Depend, FrameState::Dead];
        let Some(eaten) =
            FrameRepo::transition(&mut *tx, frame_id, version, &from, FrameState::Eaten).await?
        else {
            drop(tx);
            return Err(self.rejected(frame_id, version, "be eaten").await);
        };
        let mut events = Vec::new();
        depend::on_frame_done(&mut tx, &eaten, &mut events).await?;
        tx.commit().await?;

        tracing::info!(frame_id, "Frame eaten");
        self.bus
            .publish(DispatchEvent::new(FRAME_EATEN).about("frame", frame_id));
        publish_all(&self.bus, events);
        Ok(eaten)
    }

    // ── Checkpoints ──────────────────────────────────────────────────────

    /// Park a running, checkpoint-enabled frame while its checkpoint copies.
    pub async fn enter_checkpoint(&self, frame_id: DbId, version: i32) -> DispatchResult<Frame> {
        let Some(frame) = FrameRepo::enter_checkpoint(&self.pool, frame_id, version).await? else {
            return Err(self.rejected(frame_id, version, "enter a checkpoint").await);
        };
        self.publish_checkpoint(&frame, "entered");
        Ok(frame)
    }

    /// Record a finished checkpoint. A parked frame is requeued and gives up
    /// the proc it still holds.
    pub async fn complete_checkpoint(&self, frame_id: DbId, version: i32) -> DispatchResult<Frame> {
        self.settle_checkpoint(frame_id, version, CheckpointOutcome::Completed).await
    }

    /// Abandon checkpointing for a frame. A parked frame is requeued and
    /// gives up the proc it still holds.
    pub async fn disable_checkpoint(&self, frame_id: DbId, version: i32) -> DispatchResult<Frame> {
        self.settle_checkpoint(frame_id, version, CheckpointOutcome::Disabled).await
    }

    async fn settle_checkpoint(
        &self,
        frame_id: DbId,
        version: i32,
        outcome: CheckpointOutcome,
    ) -> DispatchResult<Frame> {
        let mut tx = self.pool.begin().await?;
        let updated = match outcome {
            CheckpointOutcome::Completed => {
                FrameRepo::complete_checkpoint(&mut *tx, frame_id, version).await?
            }
            CheckpointOutcome::Disabled => {
                FrameRepo::disable_checkpoint(&mut *tx, frame_id, version).await?
            }
        };
        let Some(frame) = updated else {
            drop(tx);
            return Err(self.rejected(frame_id, version, outcome.action()).await);
        };

        let mut events = Vec::new();
        if matches!(frame.state()?, FrameState::Waiting | FrameState::Depend) {
            if let Some(proc) = ProcRepo::find_by_frame(&mut *tx, frame_id).await? {
                release_proc(&mut tx, proc.id, &mut events).await?;
            }
        }
        tx.commit().await?;

        self.publish_checkpoint(&frame, outcome.phase());
        publish_all(&self.bus, events);
        Ok(frame)
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn is_job_complete(&self, job_id: DbId) -> DispatchResult<bool> {
        Ok(JobRepo::is_complete(&self.pool, job_id).await?)
    }

    pub async fn is_layer_complete(&self, layer_id: DbId) -> DispatchResult<bool> {
        Ok(LayerRepo::is_complete(&self.pool, layer_id).await?)
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    async fn load(&self, frame_id: DbId) -> DispatchResult<Frame> {
        FrameRepo::find_by_id(&self.pool, frame_id)
            .await?
            .ok_or(DispatchError::NotFound {
                entity: "Frame",
                id: frame_id,
            })
    }

    /// Explain why a versioned update matched nothing: the frame is gone,
    /// moved past `version`, or is in a state the action does not apply to.
    async fn rejected(&self, frame_id: DbId, version: i32, action: &str) -> DispatchError {
        match self.load(frame_id).await {
            Err(e) => e,
            Ok(frame) if frame.version != version => DispatchError::StaleVersion {
                entity: "Frame",
                id: frame_id,
            },
            Ok(frame) => {
                let state = frame
                    .state()
                    .map(|s| s.as_str())
                    .unwrap_or("an unknown state");
                CoreError::Conflict(format!(
                    "Frame {frame_id} in {state} cannot {action}"
                ))
                .into()
            }
        }
    }

    fn publish_checkpoint(&self, frame: &Frame, phase: &str) {
        tracing::info!(frame_id = frame.id, phase, "Frame checkpoint");
        self.bus.publish(
            DispatchEvent::new(FRAME_CHECKPOINTED)
                .about("frame", frame.id)
                .with_detail(serde_json::json!({
                    "phase": phase,
                    "checkpoint_count": frame.checkpoint_count,
                })),
        );
    }
}
