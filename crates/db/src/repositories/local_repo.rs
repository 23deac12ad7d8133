//! Repository for the `host_local` table: pinned pools on a host.
//!
//! A pin's pool is carved out of its host's capacity; the CHECK constraints
//! on the table keep `0 <= idle <= max` even if a caller is wrong.

use spool_core::resources::{resize_pool, ResourceSlice};
use spool_core::types::DbId;
use sqlx::{FromRow, PgConnection, PgExecutor};

use crate::models::local::{CreateLocalAssignment, LocalAssignment, LocalResize};

/// Column list for `host_local` queries.
const COLUMNS: &str = "\
    id, host_id, kind_id, job_id, layer_id, frame_id, max_cores, idle_cores, \
    max_memory, idle_memory, max_gpus, idle_gpus, max_gpu_memory, idle_gpu_memory, \
    threads, is_active, created_at, updated_at";

/// A resized row plus the pool it had before the update.
#[derive(FromRow)]
struct ResizedRow {
    #[sqlx(flatten)]
    assignment: LocalAssignment,
    old_max_cores: i32,
    old_idle_cores: i32,
    old_max_memory: i64,
    old_idle_memory: i64,
    old_max_gpus: i32,
    old_idle_gpus: i32,
    old_max_gpu_memory: i64,
    old_idle_gpu_memory: i64,
}

pub struct LocalAssignmentRepo;

impl LocalAssignmentRepo {
    /// Pin part of a host. The pool starts fully idle.
    ///
    /// Returns `None` if the host does not exist or `max` exceeds its total
    /// capacity in any dimension.
    pub async fn create(
        db: impl PgExecutor<'_>,
        input: &CreateLocalAssignment,
    ) -> Result<Option<LocalAssignment>, sqlx::Error> {
        let query = format!(
            "INSERT INTO host_local (host_id, kind_id, job_id, layer_id, frame_id, \
                max_cores, idle_cores, max_memory, idle_memory, max_gpus, idle_gpus, \
                max_gpu_memory, idle_gpu_memory, threads) \
             SELECT h.id, $2, $3, $4, $5, $6, $6, $7, $7, $8, $8, $9, $9, COALESCE($10, 1) \
             FROM hosts h \
             WHERE h.id = $1 \
               AND $6 <= h.total_cores AND $7 <= h.total_memory \
               AND $8 <= h.total_gpus AND $9 <= h.total_gpu_memory \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, LocalAssignment>(&query)
            .bind(input.host_id)
            .bind(input.kind.id())
            .bind(input.job_id)
            .bind(input.layer_id)
            .bind(input.frame_id)
            .bind(input.max.cores)
            .bind(input.max.memory)
            .bind(input.max.gpus)
            .bind(input.max.gpu_memory)
            .bind(input.threads)
            .fetch_optional(db)
            .await
    }

    pub async fn find_by_id(
        db: impl PgExecutor<'_>,
        id: DbId,
    ) -> Result<Option<LocalAssignment>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM host_local WHERE id = $1");
        sqlx::query_as::<_, LocalAssignment>(&query)
            .bind(id)
            .fetch_optional(db)
            .await
    }

    /// Active pins on a host, frame pins first, then layer, then job.
    pub async fn list_active_for_host(
        db: impl PgExecutor<'_>,
        host_id: DbId,
    ) -> Result<Vec<LocalAssignment>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM host_local \
             WHERE host_id = $1 AND is_active \
             ORDER BY kind_id DESC, id"
        );
        sqlx::query_as::<_, LocalAssignment>(&query)
            .bind(host_id)
            .fetch_all(db)
            .await
    }

    /// Take `slice` from the pin's idle pool, refusing if any dimension is short.
    pub async fn reserve(
        db: impl PgExecutor<'_>,
        id: DbId,
        slice: &ResourceSlice,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE host_local SET \
                 idle_cores = idle_cores - $2, \
                 idle_memory = idle_memory - $3, \
                 idle_gpus = idle_gpus - $4, \
                 idle_gpu_memory = idle_gpu_memory - $5 \
             WHERE id = $1 AND is_active \
               AND idle_cores >= $2 AND idle_memory >= $3 \
               AND idle_gpus >= $4 AND idle_gpu_memory >= $5",
        )
        .bind(id)
        .bind(slice.cores)
        .bind(slice.memory)
        .bind(slice.gpus)
        .bind(slice.gpu_memory)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lock a pin's row for the rest of the transaction.
    pub async fn lock(
        conn: &mut PgConnection,
        id: DbId,
    ) -> Result<Option<LocalAssignment>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM host_local WHERE id = $1 FOR UPDATE");
        sqlx::query_as::<_, LocalAssignment>(&query)
            .bind(id)
            .fetch_optional(conn)
            .await
    }

    /// Recompute a pin's idle pool as `max` minus what its remaining procs
    /// hold, floored at zero. Call after the released proc is deleted and
    /// with the pin locked (see [`lock`](Self::lock)), so a shrink's excess
    /// is paid down before idle grows again.
    pub async fn release(db: impl PgExecutor<'_>, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE host_local hl SET \
                 idle_cores = GREATEST(0, hl.max_cores - c.cores), \
                 idle_memory = GREATEST(0, hl.max_memory - c.memory), \
                 idle_gpus = GREATEST(0, hl.max_gpus - c.gpus), \
                 idle_gpu_memory = GREATEST(0, hl.max_gpu_memory - c.gpu_memory) \
             FROM ( \
                 SELECT COALESCE(SUM(reserved_cores), 0)::INTEGER AS cores, \
                        COALESCE(SUM(reserved_memory), 0)::BIGINT AS memory, \
                        COALESCE(SUM(reserved_gpus), 0)::INTEGER AS gpus, \
                        COALESCE(SUM(reserved_gpu_memory), 0)::BIGINT AS gpu_memory \
                 FROM procs WHERE host_local_id = $1 \
             ) c \
             WHERE hl.id = $1",
        )
        .bind(id)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Change a pin's max pool. Idle moves by the same delta and is clamped
    /// at zero; the committed amount left above the new max is reported.
    ///
    /// Returns `None` if the pin does not exist or `new_max` exceeds the
    /// host's total capacity.
    pub async fn resize(
        db: impl PgExecutor<'_>,
        id: DbId,
        new_max: &ResourceSlice,
    ) -> Result<Option<LocalResize>, sqlx::Error> {
        let returning = COLUMNS
            .split(',')
            .map(|c| format!("hl.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "UPDATE host_local hl SET \
                 max_cores = $2, \
                 idle_cores = GREATEST(0, old.old_idle_cores + ($2 - old.old_max_cores)), \
                 max_memory = $3, \
                 idle_memory = GREATEST(0, old.old_idle_memory + ($3 - old.old_max_memory)), \
                 max_gpus = $4, \
                 idle_gpus = GREATEST(0, old.old_idle_gpus + ($4 - old.old_max_gpus)), \
                 max_gpu_memory = $5, \
                 idle_gpu_memory = GREATEST(0, old.old_idle_gpu_memory + ($5 - old.old_max_gpu_memory)) \
             FROM ( \
                 SELECT l.id, \
                        l.max_cores AS old_max_cores, l.idle_cores AS old_idle_cores, \
                        l.max_memory AS old_max_memory, l.idle_memory AS old_idle_memory, \
                        l.max_gpus AS old_max_gpus, l.idle_gpus AS old_idle_gpus, \
                        l.max_gpu_memory AS old_max_gpu_memory, \
                        l.idle_gpu_memory AS old_idle_gpu_memory \
                 FROM host_local l \
                 JOIN hosts h ON h.id = l.host_id \
                 WHERE l.id = $1 \
                   AND $2 <= h.total_cores AND $3 <= h.total_memory \
                   AND $4 <= h.total_gpus AND $5 <= h.total_gpu_memory \
                 FOR UPDATE OF l \
             ) old \
             WHERE hl.id = old.id \
             RETURNING {returning}, \
                 old.old_max_cores, old.old_idle_cores, old.old_max_memory, old.old_idle_memory, \
                 old.old_max_gpus, old.old_idle_gpus, old.old_max_gpu_memory, old.old_idle_gpu_memory"
        );
        let row = sqlx::query_as::<_, ResizedRow>(&query)
            .bind(id)
            .bind(new_max.cores)
            .bind(new_max.memory)
            .bind(new_max.gpus)
            .bind(new_max.gpu_memory)
            .fetch_optional(db)
            .await?;

        Ok(row.map(|r| {
            let cores = resize_pool(r.old_max_cores.into(), r.old_idle_cores.into(), new_max.cores.into());
            let memory = resize_pool(r.old_max_memory, r.old_idle_memory, new_max.memory);
            let gpus = resize_pool(r.old_max_gpus.into(), r.old_idle_gpus.into(), new_max.gpus.into());
            let gpu_memory =
                resize_pool(r.old_max_gpu_memory, r.old_idle_gpu_memory, new_max.gpu_memory);
            LocalResize {
                assignment: r.assignment,
                oversubscribed: ResourceSlice::new(
                    cores.oversubscribed as i32,
                    memory.oversubscribed,
                    gpus.oversubscribed as i32,
                    gpu_memory.oversubscribed,
                ),
            }
        }))
    }

    /// Stop using a pin. Procs already booked against it keep running.
    pub async fn deactivate(db: impl PgExecutor<'_>, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE host_local SET is_active = false WHERE id = $1 AND is_active")
            .bind(id)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
