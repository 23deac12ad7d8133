//! Read-only queries behind the dispatch matcher.
//!
//! Eligibility is always re-read from the current rows; nothing here is
//! cached across calls, since jobs can be paused, moved or re-capped at any
//! time by collaborators outside the core.

use spool_core::resources::{ResourceSlice, CORE_UNITS_PER_CORE};
use spool_core::scheduling::{SchedulingMode, ANY_TAG};
use spool_core::states::{FrameState, JobState};
use spool_core::types::DbId;
use sqlx::PgExecutor;

use crate::models::directory::Job;
use crate::models::frame::DispatchFrame;
use crate::models::local::LocalAssignment;

/// Columns of [`DispatchFrame`], selected from `frames f`, `layers l`, `jobs j`.
const FRAME_COLUMNS: &str = "\
    f.id, f.layer_id, f.job_id, j.group_id, j.show_id, f.number, f.version, \
    f.dispatch_order, l.dispatch_order AS layer_dispatch_order, f.exit_status, \
    l.name AS layer_name, l.min_cores, l.min_memory, l.min_gpus, l.min_gpu_memory, \
    l.is_threadable, l.checkpoint_enabled, l.tags";

/// Column list for `jobs` queries, qualified with `j`.
const JOB_COLUMNS: &str = "\
    j.id, j.show_id, j.group_id, j.name, j.state_id, j.priority, j.min_cores, j.max_cores, \
    j.int_cores, j.is_paused, j.auto_eat, j.max_retries, j.started_at, j.stopped_at, \
    j.created_at, j.updated_at";

/// Layer fits the offer bound at `$c, $m, $g, $gm` (positional numbers
/// substituted by the caller). Non-threadable layers ask for one core at most.
fn layer_fits(c: u8, m: u8, g: u8, gm: u8) -> String {
    format!(
        "CASE WHEN l.is_threadable THEN l.min_cores \
              ELSE LEAST(l.min_cores, {CORE_UNITS_PER_CORE}) END <= ${c} \
         AND l.min_memory <= ${m} AND l.min_gpus <= ${g} AND l.min_gpu_memory <= ${gm}"
    )
}

/// Layer tags are compatible with the host tags bound at `$t`.
fn tags_match(t: u8) -> String {
    format!("(cardinality(l.tags) = 0 OR '{ANY_TAG}' = ANY(l.tags) OR l.tags && ${t})")
}

fn job_order(mode: SchedulingMode) -> &'static str {
    match mode {
        SchedulingMode::Priority => "j.priority DESC, j.started_at ASC, j.id ASC",
        SchedulingMode::Fifo => "j.started_at ASC, j.id ASC",
    }
}

/// Frame order within a job.
const FRAME_ORDER: &str = "f.dispatch_order ASC, l.dispatch_order ASC, f.number ASC, f.id ASC";

/// Restricts which jobs the general matcher considers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JobScope {
    #[default]
    All,
    Group(DbId),
    Show(DbId),
}

impl JobScope {
    fn group_id(self) -> Option<DbId> {
        match self {
            JobScope::Group(id) => Some(id),
            _ => None,
        }
    }

    fn show_id(self) -> Option<DbId> {
        match self {
            JobScope::Show(id) => Some(id),
            _ => None,
        }
    }
}

pub struct DispatchRepo;

impl DispatchRepo {
    /// Jobs with at least one `Waiting` frame that fits `offer` on a host
    /// tagged `host_tags`, in scheduling order.
    ///
    /// Jobs are filtered to `Pending`, unpaused, in a dispatch-enabled show,
    /// and below the job, group and show core ceilings.
    pub async fn find_dispatchable_jobs(
        db: impl PgExecutor<'_>,
        host_tags: &[String],
        offer: &ResourceSlice,
        mode: SchedulingMode,
        scope: JobScope,
        limit: i64,
    ) -> Result<Vec<DbId>, sqlx::Error> {
        let query = format!(
            "SELECT j.id FROM jobs j \
             JOIN shows s ON s.id = j.show_id \
             JOIN groups g ON g.id = j.group_id \
             WHERE j.state_id = $1 AND NOT j.is_paused AND s.dispatch_enabled \
               AND (j.max_cores < 0 OR j.int_cores < j.max_cores) \
               AND (g.max_cores < 0 OR g.int_cores < g.max_cores) \
               AND (s.max_cores < 0 OR s.int_cores < s.max_cores) \
               AND ($8::BIGINT IS NULL OR j.group_id = $8) \
               AND ($9::BIGINT IS NULL OR j.show_id = $9) \
               AND EXISTS ( \
                   SELECT 1 FROM frames f JOIN layers l ON l.id = f.layer_id \
                   WHERE f.job_id = j.id AND f.state_id = $2 \
                     AND {fits} AND {tags} \
               ) \
             ORDER BY {order} \
             LIMIT $10",
            fits = layer_fits(3, 4, 5, 6),
            tags = tags_match(7),
            order = job_order(mode),
        );
        sqlx::query_scalar::<_, DbId>(&query)
            .bind(JobState::Pending.id())
            .bind(FrameState::Waiting.id())
            .bind(offer.cores)
            .bind(offer.memory)
            .bind(offer.gpus)
            .bind(offer.gpu_memory)
            .bind(host_tags)
            .bind(scope.group_id())
            .bind(scope.show_id())
            .bind(limit)
            .fetch_all(db)
            .await
    }

    /// `Waiting` frames of one job that individually fit `offer` on a host
    /// tagged `host_tags`, in dispatch order.
    pub async fn find_next_frames(
        db: impl PgExecutor<'_>,
        job_id: DbId,
        host_tags: &[String],
        offer: &ResourceSlice,
        limit: i64,
    ) -> Result<Vec<DispatchFrame>, sqlx::Error> {
        let query = format!(
            "SELECT {FRAME_COLUMNS} FROM frames f \
             JOIN layers l ON l.id = f.layer_id \
             JOIN jobs j ON j.id = f.job_id \
             WHERE f.job_id = $1 AND f.state_id = $2 \
               AND {fits} AND {tags} \
             ORDER BY {FRAME_ORDER} \
             LIMIT $8",
            fits = layer_fits(3, 4, 5, 6),
            tags = tags_match(7),
        );
        sqlx::query_as::<_, DispatchFrame>(&query)
            .bind(job_id)
            .bind(FrameState::Waiting.id())
            .bind(offer.cores)
            .bind(offer.memory)
            .bind(offer.gpus)
            .bind(offer.gpu_memory)
            .bind(host_tags)
            .bind(limit)
            .fetch_all(db)
            .await
    }

    /// `Waiting` frames inside a pin's scope that fit its idle pool.
    ///
    /// Tags and show/job eligibility are not consulted: the pin itself is the
    /// eligibility decision.
    pub async fn find_local_frames(
        db: impl PgExecutor<'_>,
        pin: &LocalAssignment,
        limit: i64,
    ) -> Result<Vec<DispatchFrame>, sqlx::Error> {
        let query = format!(
            "SELECT {FRAME_COLUMNS} FROM frames f \
             JOIN layers l ON l.id = f.layer_id \
             JOIN jobs j ON j.id = f.job_id \
             WHERE f.job_id = $1 AND f.state_id = $2 AND j.state_id = $9 \
               AND ($7::BIGINT IS NULL OR f.layer_id = $7) \
               AND ($8::BIGINT IS NULL OR f.id = $8) \
               AND {fits} \
             ORDER BY {FRAME_ORDER} \
             LIMIT $10",
            fits = layer_fits(3, 4, 5, 6),
        );
        sqlx::query_as::<_, DispatchFrame>(&query)
            .bind(pin.job_id)
            .bind(FrameState::Waiting.id())
            .bind(pin.idle_cores)
            .bind(pin.idle_memory)
            .bind(pin.idle_gpus)
            .bind(pin.idle_gpu_memory)
            .bind(pin.layer_id)
            .bind(pin.frame_id)
            .bind(JobState::Pending.id())
            .bind(limit)
            .fetch_all(db)
            .await
    }

    /// Distinct `Pending` jobs pinned to this host by an active assignment.
    pub async fn find_local_dispatchable_jobs(
        db: impl PgExecutor<'_>,
        host_id: DbId,
    ) -> Result<Vec<DbId>, sqlx::Error> {
        sqlx::query_scalar::<_, DbId>(
            "SELECT DISTINCT hl.job_id FROM host_local hl \
             JOIN jobs j ON j.id = hl.job_id \
             WHERE hl.host_id = $1 AND hl.is_active AND j.state_id = $2 \
             ORDER BY hl.job_id",
        )
        .bind(host_id)
        .bind(JobState::Pending.id())
        .fetch_all(db)
        .await
    }

    /// Dispatchable jobs (ignoring capacity) with a layer compatible with
    /// `host_tags`. Input to the higher-priority-waiting check.
    pub async fn list_pending_for_tags(
        db: impl PgExecutor<'_>,
        host_tags: &[String],
    ) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs j \
             JOIN shows s ON s.id = j.show_id \
             WHERE j.state_id = $1 AND NOT j.is_paused AND s.dispatch_enabled \
               AND EXISTS ( \
                   SELECT 1 FROM layers l WHERE l.job_id = j.id AND {tags} \
               ) \
             ORDER BY j.id",
            tags = tags_match(2),
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(JobState::Pending.id())
            .bind(host_tags)
            .fetch_all(db)
            .await
    }
}
