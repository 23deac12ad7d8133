//! Repository for the `hosts` table: the host side of the resource ledger.
//!
//! Reservations and releases are single conditional `UPDATE`s keyed by host
//! id. The feasibility check lives in the `WHERE` clause, so two concurrent
//! bookings can never both take the last slice of a host.

use spool_core::resources::ResourceSlice;
use spool_core::states::{HardwareState, LockState};
use spool_core::types::DbId;
use sqlx::PgExecutor;

use crate::models::host::{Host, HostReport};

/// Column list for `hosts` queries.
const COLUMNS: &str = "\
    id, name, total_cores, idle_cores, total_memory, idle_memory, total_gpus, idle_gpus, \
    total_gpu_memory, idle_gpu_memory, tags, lock_state_id, hardware_state_id, \
    last_ping_at, decommissioned_at, created_at, updated_at";

pub struct HostRepo;

impl HostRepo {
    // ── Reports ──────────────────────────────────────────────────────────

    /// Create the host on first report, or refresh it from a heartbeat.
    ///
    /// The reported totals are authoritative, except that a total never drops
    /// below what procs on the host already hold. Idle is re-derived as
    /// `total - committed`, so it moves by the delta of the totals.
    pub async fn upsert_from_report(
        db: impl PgExecutor<'_>,
        report: &HostReport,
    ) -> Result<Host, sqlx::Error> {
        let query = format!(
            "INSERT INTO hosts (name, total_cores, idle_cores, total_memory, idle_memory, \
                total_gpus, idle_gpus, total_gpu_memory, idle_gpu_memory, tags, \
                hardware_state_id, last_ping_at) \
             VALUES ($1, $2, $2, $3, $3, $4, $4, $5, $5, $6, $7, NOW()) \
             ON CONFLICT (name) DO UPDATE SET \
                total_cores = GREATEST(EXCLUDED.total_cores, hosts.total_cores - hosts.idle_cores), \
                idle_cores = GREATEST(EXCLUDED.total_cores, hosts.total_cores - hosts.idle_cores) \
                    - (hosts.total_cores - hosts.idle_cores), \
                total_memory = GREATEST(EXCLUDED.total_memory, hosts.total_memory - hosts.idle_memory), \
                idle_memory = GREATEST(EXCLUDED.total_memory, hosts.total_memory - hosts.idle_memory) \
                    - (hosts.total_memory - hosts.idle_memory), \
                total_gpus = GREATEST(EXCLUDED.total_gpus, hosts.total_gpus - hosts.idle_gpus), \
                idle_gpus = GREATEST(EXCLUDED.total_gpus, hosts.total_gpus - hosts.idle_gpus) \
                    - (hosts.total_gpus - hosts.idle_gpus), \
                total_gpu_memory = GREATEST(EXCLUDED.total_gpu_memory, \
                    hosts.total_gpu_memory - hosts.idle_gpu_memory), \
                idle_gpu_memory = GREATEST(EXCLUDED.total_gpu_memory, \
                    hosts.total_gpu_memory - hosts.idle_gpu_memory) \
                    - (hosts.total_gpu_memory - hosts.idle_gpu_memory), \
                tags = EXCLUDED.tags, \
                hardware_state_id = EXCLUDED.hardware_state_id, \
                last_ping_at = NOW() \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Host>(&query)
            .bind(&report.name)
            .bind(report.total.cores)
            .bind(report.total.memory)
            .bind(report.total.gpus)
            .bind(report.total.gpu_memory)
            .bind(&report.tags)
            .bind(report.hardware_state.id())
            .fetch_one(db)
            .await
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn find_by_id(db: impl PgExecutor<'_>, id: DbId) -> Result<Option<Host>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM hosts WHERE id = $1");
        sqlx::query_as::<_, Host>(&query)
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn find_by_name(
        db: impl PgExecutor<'_>,
        name: &str,
    ) -> Result<Option<Host>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM hosts WHERE name = $1");
        sqlx::query_as::<_, Host>(&query)
            .bind(name)
            .fetch_optional(db)
            .await
    }

    /// Sum of the slices held by every proc on the host.
    pub async fn committed(db: impl PgExecutor<'_>, id: DbId) -> Result<ResourceSlice, sqlx::Error> {
        let (cores, memory, gpus, gpu_memory): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(reserved_cores), 0)::BIGINT, \
                    COALESCE(SUM(reserved_memory), 0)::BIGINT, \
                    COALESCE(SUM(reserved_gpus), 0)::BIGINT, \
                    COALESCE(SUM(reserved_gpu_memory), 0)::BIGINT \
             FROM procs WHERE host_id = $1",
        )
        .bind(id)
        .fetch_one(db)
        .await?;
        Ok(ResourceSlice::new(cores as i32, memory, gpus as i32, gpu_memory))
    }

    // ── Ledger ───────────────────────────────────────────────────────────

    /// Take `slice` out of the host's idle pool. Returns false, changing
    /// nothing, when any dimension is short.
    pub async fn reserve(
        db: impl PgExecutor<'_>,
        id: DbId,
        slice: &ResourceSlice,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE hosts SET \
                 idle_cores = idle_cores - $2, \
                 idle_memory = idle_memory - $3, \
                 idle_gpus = idle_gpus - $4, \
                 idle_gpu_memory = idle_gpu_memory - $5 \
             WHERE id = $1 \
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

    /// Return `slice` to the host's idle pool. Returns false, changing
    /// nothing, when that would push idle above total.
    pub async fn release(
        db: impl PgExecutor<'_>,
        id: DbId,
        slice: &ResourceSlice,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE hosts SET \
                 idle_cores = idle_cores + $2, \
                 idle_memory = idle_memory + $3, \
                 idle_gpus = idle_gpus + $4, \
                 idle_gpu_memory = idle_gpu_memory + $5 \
             WHERE id = $1 \
               AND idle_cores + $2 <= total_cores AND idle_memory + $3 <= total_memory \
               AND idle_gpus + $4 <= total_gpus AND idle_gpu_memory + $5 <= total_gpu_memory",
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

    // ── Administration ───────────────────────────────────────────────────

    pub async fn set_lock_state(
        db: impl PgExecutor<'_>,
        id: DbId,
        state: LockState,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE hosts SET lock_state_id = $2 WHERE id = $1")
            .bind(id)
            .bind(state.id())
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_hardware_state(
        db: impl PgExecutor<'_>,
        id: DbId,
        state: HardwareState,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE hosts SET hardware_state_id = $2 WHERE id = $1")
            .bind(id)
            .bind(state.id())
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Retire a host. Hosts are never deleted implicitly.
    pub async fn decommission(db: impl PgExecutor<'_>, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE hosts SET decommissioned_at = NOW(), lock_state_id = $2 \
             WHERE id = $1 AND decommissioned_at IS NULL",
        )
        .bind(id)
        .bind(LockState::Locked.id())
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
