//! Repository for the `frames` table.
//!
//! Every state change is a single conditional `UPDATE ... WHERE id = $1 AND
//! version = $2 AND state_id = ANY(...)` that bumps `version` and returns the
//! new row. `None` means the caller's snapshot was stale; it is never an
//! error at this layer.

use std::time::Duration;

use spool_core::depend::DependScope;
use spool_core::frame::{EXIT_STATUS_FRAME_CLEARED, SKIP_RETRY_EXIT_STATUSES};
use spool_core::states::{CheckpointState, FrameState, JobState};
use spool_core::types::DbId;
use sqlx::{PgConnection, PgExecutor};

use super::state_ids;
use crate::models::frame::{CreateFrameRange, Frame};
use crate::models::proc::VirtualProc;

/// Column list for `frames` queries.
const COLUMNS: &str = "\
    id, layer_id, job_id, number, dispatch_order, state_id, exit_status, retries, \
    depend_count, version, host_id, last_resource, reserved_cores, reserved_memory, \
    reserved_gpus, reserved_gpu_memory, max_rss, total_core_time, checkpoint_state_id, \
    checkpoint_count, started_at, stopped_at, created_at, updated_at";

/// Column of the frames table matching each scope level.
fn scope_column(scope: &DependScope) -> &'static str {
    match scope {
        DependScope::Job(_) => "job_id",
        DependScope::Layer(_) => "layer_id",
        DependScope::Frame(_) => "id",
    }
}

pub struct FrameRepo;

impl FrameRepo {
    // ── Launch ───────────────────────────────────────────────────────────

    /// Insert one `Setup` frame per number in `start..=end` (by `step`).
    ///
    /// `dispatch_order` is the frame's position in the range, so frames
    /// dispatch in range order until re-ordered.
    pub async fn create_range(
        db: impl PgExecutor<'_>,
        input: &CreateFrameRange,
    ) -> Result<Vec<Frame>, sqlx::Error> {
        let query = format!(
            "WITH ins AS ( \
                 INSERT INTO frames (layer_id, job_id, number, dispatch_order, state_id) \
                 SELECT l.id, l.job_id, g.n, \
                        (row_number() OVER (ORDER BY g.n))::INTEGER - 1, $5 \
                 FROM layers l \
                 CROSS JOIN generate_series($2::INTEGER, $3::INTEGER, $4::INTEGER) AS g(n) \
                 WHERE l.id = $1 \
                 RETURNING {COLUMNS} \
             ) \
             SELECT {COLUMNS} FROM ins ORDER BY number"
        );
        sqlx::query_as::<_, Frame>(&query)
            .bind(input.layer_id)
            .bind(input.start)
            .bind(input.end)
            .bind(input.step.unwrap_or(1))
            .bind(FrameState::Setup.id())
            .fetch_all(db)
            .await
    }

    /// Move every `Setup` frame of a job to `Waiting`, or `Depend` when it
    /// already carries blockers. Returns the number of frames activated.
    pub async fn activate_job(db: impl PgExecutor<'_>, job_id: DbId) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE frames SET \
                 state_id = CASE WHEN depend_count > 0 THEN $3 ELSE $2 END, \
                 version = version + 1 \
             WHERE job_id = $1 AND state_id = $4",
        )
        .bind(job_id)
        .bind(FrameState::Waiting.id())
        .bind(FrameState::Depend.id())
        .bind(FrameState::Setup.id())
        .execute(db)
        .await?;
        Ok(result.rows_affected())
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn find_by_id(db: impl PgExecutor<'_>, id: DbId) -> Result<Option<Frame>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM frames WHERE id = $1");
        sqlx::query_as::<_, Frame>(&query)
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn list_by_layer(
        db: impl PgExecutor<'_>,
        layer_id: DbId,
    ) -> Result<Vec<Frame>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM frames WHERE layer_id = $1 ORDER BY number");
        sqlx::query_as::<_, Frame>(&query)
            .bind(layer_id)
            .fetch_all(db)
            .await
    }

    pub async fn list_by_job(db: impl PgExecutor<'_>, job_id: DbId) -> Result<Vec<Frame>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM frames WHERE job_id = $1 ORDER BY layer_id, number"
        );
        sqlx::query_as::<_, Frame>(&query)
            .bind(job_id)
            .fetch_all(db)
            .await
    }

    /// Frames running past `window` with no proc while their job is still
    /// `Pending`.
    pub async fn find_orphans(
        db: impl PgExecutor<'_>,
        window: Duration,
        limit: i64,
    ) -> Result<Vec<Frame>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM frames f \
             WHERE f.state_id = $1 \
               AND f.updated_at < NOW() - make_interval(secs => $2) \
               AND NOT EXISTS (SELECT 1 FROM procs p WHERE p.frame_id = f.id) \
               AND EXISTS (SELECT 1 FROM jobs j WHERE j.id = f.job_id AND j.state_id = $3) \
             ORDER BY f.updated_at \
             LIMIT $4"
        );
        sqlx::query_as::<_, Frame>(&query)
            .bind(FrameState::Running.id())
            .bind(window.as_secs_f64())
            .bind(JobState::Pending.id())
            .bind(limit)
            .fetch_all(db)
            .await
    }

    // ── Start ────────────────────────────────────────────────────────────

    /// Lock a `Waiting` frame at `version` for the start transition, failing
    /// fast (`55P03 lock_not_available`) if another booking holds it.
    ///
    /// `None` means the frame moved on since it was read.
    pub async fn lock_for_start(
        conn: &mut PgConnection,
        id: DbId,
        version: i32,
    ) -> Result<Option<Frame>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM frames \
             WHERE id = $1 AND version = $2 AND state_id = $3 \
             FOR UPDATE NOWAIT"
        );
        sqlx::query_as::<_, Frame>(&query)
            .bind(id)
            .bind(version)
            .bind(FrameState::Waiting.id())
            .fetch_optional(conn)
            .await
    }

    /// `Waiting -> Running` onto the proc's host.
    ///
    /// The retry counter is bumped unless the previous exit status is in the
    /// skip-retry set. Checkpointing is armed when the layer enables it.
    pub async fn start(
        db: impl PgExecutor<'_>,
        proc: &VirtualProc,
    ) -> Result<Option<Frame>, sqlx::Error> {
        let query = format!(
            "UPDATE frames SET \
                 state_id = $3, \
                 host_id = $4, \
                 last_resource = $5, \
                 reserved_cores = $6, \
                 reserved_memory = $7, \
                 reserved_gpus = $8, \
                 reserved_gpu_memory = $9, \
                 retries = CASE WHEN exit_status = ANY($10) THEN retries ELSE retries + 1 END, \
                 checkpoint_state_id = CASE WHEN $11 THEN $12 ELSE $13 END, \
                 started_at = NOW(), \
                 stopped_at = NULL, \
                 version = version + 1 \
             WHERE id = $1 AND version = $2 AND state_id = $14 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Frame>(&query)
            .bind(proc.frame_id)
            .bind(proc.frame_version)
            .bind(FrameState::Running.id())
            .bind(proc.host_id)
            .bind(proc.resource_label())
            .bind(proc.slice.cores)
            .bind(proc.slice.memory)
            .bind(proc.slice.gpus)
            .bind(proc.slice.gpu_memory)
            .bind(&SKIP_RETRY_EXIT_STATUSES[..])
            .bind(proc.checkpoint_enabled)
            .bind(CheckpointState::Enabled.id())
            .bind(CheckpointState::Disabled.id())
            .bind(FrameState::Waiting.id())
            .fetch_optional(db)
            .await
    }

    // ── Stop / clear ─────────────────────────────────────────────────────

    /// Record the end of a run: `Running|Checkpoint -> new_state`.
    ///
    /// A `Waiting` target becomes `Depend` if blockers were added while the
    /// frame ran. Accumulates `elapsed_seconds * reserved_cores` into
    /// `total_core_time` and keeps the peak of `max_rss`.
    pub async fn stop(
        db: impl PgExecutor<'_>,
        id: DbId,
        version: i32,
        new_state: FrameState,
        exit_status: i32,
        max_rss: i64,
    ) -> Result<Option<Frame>, sqlx::Error> {
        let query = format!(
            "UPDATE frames SET \
                 state_id = CASE WHEN $3 = $7 AND depend_count > 0 THEN $8 ELSE $3 END, \
                 exit_status = $4, \
                 max_rss = GREATEST(max_rss, $5), \
                 total_core_time = total_core_time + COALESCE( \
                     EXTRACT(EPOCH FROM (NOW() - started_at))::BIGINT * reserved_cores, 0), \
                 stopped_at = NOW(), \
                 version = version + 1 \
             WHERE id = $1 AND version = $2 AND state_id = ANY($6) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Frame>(&query)
            .bind(id)
            .bind(version)
            .bind(new_state.id())
            .bind(exit_status)
            .bind(max_rss)
            .bind(state_ids(&[FrameState::Running, FrameState::Checkpoint]))
            .bind(FrameState::Waiting.id())
            .bind(FrameState::Depend.id())
            .fetch_optional(db)
            .await
    }

    /// `Running -> Waiting|Depend` for a frame no proc references.
    pub async fn clear(
        db: impl PgExecutor<'_>,
        id: DbId,
        version: i32,
        exit_status: i32,
    ) -> Result<Option<Frame>, sqlx::Error> {
        let query = format!(
            "UPDATE frames SET \
                 state_id = CASE WHEN depend_count > 0 THEN $4 ELSE $3 END, \
                 exit_status = $5, \
                 stopped_at = NOW(), \
                 version = version + 1 \
             WHERE id = $1 AND version = $2 AND state_id = $6 \
               AND NOT EXISTS (SELECT 1 FROM procs p WHERE p.frame_id = frames.id) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Frame>(&query)
            .bind(id)
            .bind(version)
            .bind(FrameState::Waiting.id())
            .bind(FrameState::Depend.id())
            .bind(exit_status)
            .bind(FrameState::Running.id())
            .fetch_optional(db)
            .await
    }

    // ── Operator transitions ─────────────────────────────────────────────

    /// Versioned `from -> to` with no other side effects.
    pub async fn transition(
        db: impl PgExecutor<'_>,
        id: DbId,
        version: i32,
        from: &[FrameState],
        to: FrameState,
    ) -> Result<Option<Frame>, sqlx::Error> {
        let query = format!(
            "UPDATE frames SET state_id = $3, version = version + 1 \
             WHERE id = $1 AND version = $2 AND state_id = ANY($4) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Frame>(&query)
            .bind(id)
            .bind(version)
            .bind(to.id())
            .bind(state_ids(from))
            .fetch_optional(db)
            .await
    }

    /// Requeue a finished frame for another run. The exit status becomes
    /// "frame cleared" so the next start does not count as a retry.
    pub async fn retry(
        db: impl PgExecutor<'_>,
        id: DbId,
        version: i32,
    ) -> Result<Option<Frame>, sqlx::Error> {
        let query = format!(
            "UPDATE frames SET \
                 state_id = CASE WHEN depend_count > 0 THEN $4 ELSE $3 END, \
                 exit_status = $5, \
                 version = version + 1 \
             WHERE id = $1 AND version = $2 AND state_id = ANY($6) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Frame>(&query)
            .bind(id)
            .bind(version)
            .bind(FrameState::Waiting.id())
            .bind(FrameState::Depend.id())
            .bind(EXIT_STATUS_FRAME_CLEARED)
            .bind(state_ids(&[
                FrameState::Succeeded,
                FrameState::Dead,
                FrameState::Eaten,
            ]))
            .fetch_optional(db)
            .await
    }

    // ── Checkpoints ──────────────────────────────────────────────────────

    /// `Running -> Checkpoint` for a frame whose checkpointing is armed. The
    /// checkpoint moves to `Copying` until the external agent reports back.
    pub async fn enter_checkpoint(
        db: impl PgExecutor<'_>,
        id: DbId,
        version: i32,
    ) -> Result<Option<Frame>, sqlx::Error> {
        let query = format!(
            "UPDATE frames SET state_id = $3, checkpoint_state_id = $4, version = version + 1 \
             WHERE id = $1 AND version = $2 AND state_id = $5 AND checkpoint_state_id = $6 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Frame>(&query)
            .bind(id)
            .bind(version)
            .bind(FrameState::Checkpoint.id())
            .bind(CheckpointState::Copying.id())
            .bind(FrameState::Running.id())
            .bind(CheckpointState::Enabled.id())
            .fetch_optional(db)
            .await
    }

    /// Mark a checkpoint `Complete` (only from `Copying` or `Enabled`) and
    /// bump the counter. A frame still parked in `Checkpoint` is requeued
    /// (`Waiting`, or `Depend` while it has blockers); any other state is
    /// left alone.
    pub async fn complete_checkpoint(
        db: impl PgExecutor<'_>,
        id: DbId,
        version: i32,
    ) -> Result<Option<Frame>, sqlx::Error> {
        let query = format!(
            "UPDATE frames SET \
                 checkpoint_state_id = $3, \
                 checkpoint_count = checkpoint_count + 1, \
                 state_id = CASE WHEN state_id <> $4 THEN state_id \
                                 WHEN depend_count > 0 THEN $7 ELSE $5 END, \
                 version = version + 1 \
             WHERE id = $1 AND version = $2 AND checkpoint_state_id = ANY($6) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Frame>(&query)
            .bind(id)
            .bind(version)
            .bind(CheckpointState::Complete.id())
            .bind(FrameState::Checkpoint.id())
            .bind(FrameState::Waiting.id())
            .bind(vec![
                CheckpointState::Copying.id(),
                CheckpointState::Enabled.id(),
            ])
            .bind(FrameState::Depend.id())
            .fetch_optional(db)
            .await
    }

    /// Give up on a checkpoint. Same requeue rule as completion, without the
    /// counter.
    pub async fn disable_checkpoint(
        db: impl PgExecutor<'_>,
        id: DbId,
        version: i32,
    ) -> Result<Option<Frame>, sqlx::Error> {
        let query = format!(
            "UPDATE frames SET \
                 checkpoint_state_id = $3, \
                 state_id = CASE WHEN state_id <> $4 THEN state_id \
                                 WHEN depend_count > 0 THEN $6 ELSE $5 END, \
                 version = version + 1 \
             WHERE id = $1 AND version = $2 AND checkpoint_state_id <> $3 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Frame>(&query)
            .bind(id)
            .bind(version)
            .bind(CheckpointState::Disabled.id())
            .bind(FrameState::Checkpoint.id())
            .bind(FrameState::Waiting.id())
            .bind(FrameState::Depend.id())
            .fetch_optional(db)
            .await
    }

    // ── Dependency counters ──────────────────────────────────────────────

    /// Share-lock every frame in `scope` so their states cannot change until
    /// the transaction ends. Waits for in-flight stops to commit.
    ///
    /// Returns the number of frames locked.
    pub async fn lock_scope_for_share(
        conn: &mut PgConnection,
        scope: &DependScope,
    ) -> Result<u64, sqlx::Error> {
        let query = format!(
            "SELECT id FROM frames WHERE {} = $1 ORDER BY id FOR SHARE",
            scope_column(scope)
        );
        let locked: Vec<DbId> = sqlx::query_scalar(&query)
            .bind(scope.id())
            .fetch_all(conn)
            .await?;
        Ok(locked.len() as u64)
    }

    /// Add one blocker to every frame in `scope`. `Waiting` frames drop to
    /// `Depend` (and bump their version); frames in other states only count.
    ///
    /// Returns the number of frames touched.
    pub async fn increment_depend_count(
        db: impl PgExecutor<'_>,
        scope: &DependScope,
    ) -> Result<u64, sqlx::Error> {
        let query = format!(
            "UPDATE frames SET \
                 depend_count = depend_count + 1, \
                 version = version + CASE WHEN state_id = $2 THEN 1 ELSE 0 END, \
                 state_id = CASE WHEN state_id = $2 THEN $3 ELSE state_id END \
             WHERE {} = $1",
            scope_column(scope)
        );
        let result = sqlx::query(&query)
            .bind(scope.id())
            .bind(FrameState::Waiting.id())
            .bind(FrameState::Depend.id())
            .execute(db)
            .await?;
        Ok(result.rows_affected())
    }

    /// Remove one blocker from every frame in `scope` that has any. A
    /// `Depend` frame losing its last blocker becomes `Waiting`.
    ///
    /// Returns the number of frames touched.
    pub async fn decrement_depend_count(
        db: impl PgExecutor<'_>,
        scope: &DependScope,
    ) -> Result<u64, sqlx::Error> {
        let query = format!(
            "UPDATE frames SET \
                 depend_count = depend_count - 1, \
                 version = version + CASE WHEN state_id = $2 AND depend_count = 1 THEN 1 ELSE 0 END, \
                 state_id = CASE WHEN state_id = $2 AND depend_count = 1 THEN $3 ELSE state_id END \
             WHERE {} = $1 AND depend_count > 0",
            scope_column(scope)
        );
        let result = sqlx::query(&query)
            .bind(scope.id())
            .bind(FrameState::Depend.id())
            .bind(FrameState::Waiting.id())
            .execute(db)
            .await?;
        Ok(result.rows_affected())
    }
}
