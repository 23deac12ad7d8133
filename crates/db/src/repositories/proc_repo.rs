//! Repository for the `procs` table.

use spool_core::types::DbId;
use sqlx::PgExecutor;

use crate::models::proc::{Proc, VirtualProc};

/// Column list for `procs` queries.
const COLUMNS: &str = "\
    id, host_id, frame_id, layer_id, job_id, host_local_id, reserved_cores, \
    reserved_memory, reserved_gpus, reserved_gpu_memory, threads, used_memory, \
    max_used_memory, is_local_dispatch, is_unbooked, booked_at, updated_at";

pub struct ProcRepo;

impl ProcRepo {
    /// Persist a proc. Fails with `23505` on `uq_procs_frame` if the frame
    /// already has one.
    pub async fn insert(db: impl PgExecutor<'_>, proc: &VirtualProc) -> Result<Proc, sqlx::Error> {
        let query = format!(
            "INSERT INTO procs (host_id, frame_id, layer_id, job_id, host_local_id, \
                reserved_cores, reserved_memory, reserved_gpus, reserved_gpu_memory, \
                threads, is_local_dispatch) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Proc>(&query)
            .bind(proc.host_id)
            .bind(proc.frame_id)
            .bind(proc.layer_id)
            .bind(proc.job_id)
            .bind(proc.host_local_id)
            .bind(proc.slice.cores)
            .bind(proc.slice.memory)
            .bind(proc.slice.gpus)
            .bind(proc.slice.gpu_memory)
            .bind(proc.threads)
            .bind(proc.is_local_dispatch)
            .fetch_one(db)
            .await
    }

    pub async fn find_by_id(db: impl PgExecutor<'_>, id: DbId) -> Result<Option<Proc>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM procs WHERE id = $1");
        sqlx::query_as::<_, Proc>(&query)
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn find_by_frame(
        db: impl PgExecutor<'_>,
        frame_id: DbId,
    ) -> Result<Option<Proc>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM procs WHERE frame_id = $1");
        sqlx::query_as::<_, Proc>(&query)
            .bind(frame_id)
            .fetch_optional(db)
            .await
    }

    pub async fn list_by_host(db: impl PgExecutor<'_>, host_id: DbId) -> Result<Vec<Proc>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM procs WHERE host_id = $1 ORDER BY id");
        sqlx::query_as::<_, Proc>(&query)
            .bind(host_id)
            .fetch_all(db)
            .await
    }

    /// Lock and return every proc on a host, for memory rebalancing.
    pub async fn lock_by_host(db: impl PgExecutor<'_>, host_id: DbId) -> Result<Vec<Proc>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM procs WHERE host_id = $1 ORDER BY id FOR UPDATE"
        );
        sqlx::query_as::<_, Proc>(&query)
            .bind(host_id)
            .fetch_all(db)
            .await
    }

    /// Mark a proc as no longer wanted. Its reservation stays until release.
    pub async fn unbook(db: impl PgExecutor<'_>, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE procs SET is_unbooked = true WHERE id = $1 AND NOT is_unbooked",
        )
        .bind(id)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a proc, returning the row so its slice can be released.
    pub async fn delete(db: impl PgExecutor<'_>, id: DbId) -> Result<Option<Proc>, sqlx::Error> {
        let query = format!("DELETE FROM procs WHERE id = $1 RETURNING {COLUMNS}");
        sqlx::query_as::<_, Proc>(&query)
            .bind(id)
            .fetch_optional(db)
            .await
    }

    /// Record measured memory of a running frame's proc.
    pub async fn update_usage(
        db: impl PgExecutor<'_>,
        frame_id: DbId,
        used_memory: i64,
    ) -> Result<Option<Proc>, sqlx::Error> {
        let query = format!(
            "UPDATE procs SET used_memory = $2, max_used_memory = GREATEST(max_used_memory, $2) \
             WHERE frame_id = $1 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Proc>(&query)
            .bind(frame_id)
            .bind(used_memory)
            .fetch_optional(db)
            .await
    }

    /// Shift a proc's memory reservation by `delta` KB, refusing to end
    /// below `floor`.
    pub async fn adjust_reserved_memory(
        db: impl PgExecutor<'_>,
        id: DbId,
        delta: i64,
        floor: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE procs SET reserved_memory = reserved_memory + $2 \
             WHERE id = $1 AND reserved_memory + $2 >= $3",
        )
        .bind(id)
        .bind(delta)
        .bind(floor)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
