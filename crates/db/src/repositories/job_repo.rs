//! Repository for the `jobs` table.
//!
//! Besides the launch-side insert, the dispatch core only touches a job to
//! keep its running-core counter current and to finish or reopen it.

use spool_core::states::{FrameState, JobState};
use spool_core::types::DbId;
use sqlx::PgExecutor;

use super::state_ids;
use crate::models::directory::{CreateJob, Job};

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, show_id, group_id, name, state_id, priority, min_cores, max_cores, \
    int_cores, is_paused, auto_eat, max_retries, started_at, stopped_at, \
    created_at, updated_at";

pub struct JobRepo;

impl JobRepo {
    /// Insert a `Pending` job.
    pub async fn create(db: impl PgExecutor<'_>, input: &CreateJob) -> Result<Job, sqlx::Error> {
        let query = format!(
            "INSERT INTO jobs (show_id, group_id, name, state_id, priority, min_cores, max_cores, \
                auto_eat, max_retries, is_paused, started_at) \
             VALUES ($1, $2, $3, $4, COALESCE($5, 0), COALESCE($6, 0), COALESCE($7, -1), \
                COALESCE($8, false), COALESCE($9, 3), COALESCE($10, false), COALESCE($11, NOW())) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(input.show_id)
            .bind(input.group_id)
            .bind(&input.name)
            .bind(JobState::Pending.id())
            .bind(input.priority)
            .bind(input.min_cores)
            .bind(input.max_cores)
            .bind(input.auto_eat)
            .bind(input.max_retries)
            .bind(input.is_paused)
            .bind(input.started_at)
            .fetch_one(db)
            .await
    }

    pub async fn find_by_id(db: impl PgExecutor<'_>, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn set_paused(
        db: impl PgExecutor<'_>,
        id: DbId,
        paused: bool,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE jobs SET is_paused = $2 WHERE id = $1")
            .bind(id)
            .bind(paused)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_priority(
        db: impl PgExecutor<'_>,
        id: DbId,
        priority: i32,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE jobs SET priority = $2 WHERE id = $1")
            .bind(id)
            .bind(priority)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set the job's min/max core bounds in core units (`-1` max = unlimited).
    pub async fn set_core_bounds(
        db: impl PgExecutor<'_>,
        id: DbId,
        min_cores: i32,
        max_cores: i32,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE jobs SET min_cores = $2, max_cores = $3 WHERE id = $1")
            .bind(id)
            .bind(min_cores)
            .bind(max_cores)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Add `delta` core units to the running counters of the job, its group
    /// and its show in one statement. Negative on release.
    pub async fn add_running_cores(
        db: impl PgExecutor<'_>,
        job_id: DbId,
        delta: i32,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "WITH j AS ( \
                 UPDATE jobs SET int_cores = int_cores + $2 WHERE id = $1 \
                 RETURNING group_id, show_id \
             ), g AS ( \
                 UPDATE groups SET int_cores = groups.int_cores + $2 \
                 FROM j WHERE groups.id = j.group_id \
                 RETURNING groups.id \
             ) \
             UPDATE shows SET int_cores = shows.int_cores + $2 \
             FROM j WHERE shows.id = j.show_id",
        )
        .bind(job_id)
        .bind(delta)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Charge a new proc's `cores` to the job, its group and its show, but
    /// only if none of the three would go past its `max_cores` ceiling
    /// (negative means unlimited). The rows are locked while checked, so two
    /// hosts booking the same job cannot both squeeze under the ceiling.
    ///
    /// Returns false, charging nothing, when a ceiling is in the way.
    pub async fn charge_running_cores(
        db: impl PgExecutor<'_>,
        job_id: DbId,
        cores: i32,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "WITH target AS ( \
                 SELECT j.id, j.group_id, j.show_id \
                 FROM jobs j \
                 JOIN groups g ON g.id = j.group_id \
                 JOIN shows s ON s.id = j.show_id \
                 WHERE j.id = $1 \
                   AND (j.max_cores < 0 OR j.int_cores + $2 <= j.max_cores) \
                   AND (g.max_cores < 0 OR g.int_cores + $2 <= g.max_cores) \
                   AND (s.max_cores < 0 OR s.int_cores + $2 <= s.max_cores) \
                 FOR UPDATE OF j, g, s \
             ), charged_job AS ( \
                 UPDATE jobs SET int_cores = jobs.int_cores + $2 \
                 FROM target WHERE jobs.id = target.id \
                 RETURNING jobs.id \
             ), charged_group AS ( \
                 UPDATE groups SET int_cores = groups.int_cores + $2 \
                 FROM target WHERE groups.id = target.group_id \
                 RETURNING groups.id \
             ) \
             UPDATE shows SET int_cores = shows.int_cores + $2 \
             FROM target WHERE shows.id = target.show_id",
        )
        .bind(job_id)
        .bind(cores)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Core units the job may still take before it, its group or its show
    /// hits a ceiling. `None` when none of them has one.
    pub async fn core_headroom(
        db: impl PgExecutor<'_>,
        job_id: DbId,
    ) -> Result<Option<i32>, sqlx::Error> {
        let headroom: Option<Option<i32>> = sqlx::query_scalar(
            "SELECT LEAST( \
                 CASE WHEN j.max_cores < 0 THEN NULL ELSE j.max_cores - j.int_cores END, \
                 CASE WHEN g.max_cores < 0 THEN NULL ELSE g.max_cores - g.int_cores END, \
                 CASE WHEN s.max_cores < 0 THEN NULL ELSE s.max_cores - s.int_cores END) \
             FROM jobs j \
             JOIN groups g ON g.id = j.group_id \
             JOIN shows s ON s.id = j.show_id \
             WHERE j.id = $1",
        )
        .bind(job_id)
        .fetch_optional(db)
        .await?;
        Ok(headroom.flatten().map(|h| h.max(0)))
    }

    /// True when every frame of the job is Succeeded or Eaten: what job-level
    /// dependents wait for. A `Dead` frame keeps this false.
    pub async fn is_satisfied(db: impl PgExecutor<'_>, job_id: DbId) -> Result<bool, sqlx::Error> {
        let done = state_ids(&[FrameState::Succeeded, FrameState::Eaten]);
        let satisfied: bool = sqlx::query_scalar(
            "SELECT NOT EXISTS ( \
                 SELECT 1 FROM frames WHERE job_id = $1 AND NOT (state_id = ANY($2)) \
             )",
        )
        .bind(job_id)
        .bind(&done)
        .fetch_one(db)
        .await?;
        Ok(satisfied)
    }

    /// True when no frame of the job is outside {Succeeded, Dead, Eaten}.
    pub async fn is_complete(db: impl PgExecutor<'_>, job_id: DbId) -> Result<bool, sqlx::Error> {
        let done = state_ids(&[FrameState::Succeeded, FrameState::Dead, FrameState::Eaten]);
        let complete: bool = sqlx::query_scalar(
            "SELECT NOT EXISTS ( \
                 SELECT 1 FROM frames WHERE job_id = $1 AND NOT (state_id = ANY($2)) \
             )",
        )
        .bind(job_id)
        .bind(&done)
        .fetch_one(db)
        .await?;
        Ok(complete)
    }

    /// Move a job to `Finished`. Returns false if it already was.
    pub async fn finish(db: impl PgExecutor<'_>, job_id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET state_id = $2, stopped_at = NOW() \
             WHERE id = $1 AND state_id <> $2",
        )
        .bind(job_id)
        .bind(JobState::Finished.id())
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Put a `Finished` job back to `Pending` (after a frame retry).
    pub async fn reopen(db: impl PgExecutor<'_>, job_id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE jobs SET state_id = $2, stopped_at = NULL \
             WHERE id = $1 AND state_id = $3",
        )
        .bind(job_id)
        .bind(JobState::Pending.id())
        .bind(JobState::Finished.id())
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
