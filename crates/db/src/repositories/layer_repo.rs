//! Repository for the `layers` table.

use spool_core::states::FrameState;
use spool_core::types::DbId;
use sqlx::PgExecutor;

use super::state_ids;
use crate::models::directory::{CreateLayer, Layer};

/// Column list for `layers` queries.
const COLUMNS: &str = "\
    id, job_id, name, command, dispatch_order, min_cores, min_memory, min_gpus, \
    min_gpu_memory, is_threadable, checkpoint_enabled, tags, created_at, updated_at";

pub struct LayerRepo;

impl LayerRepo {
    pub async fn create(db: impl PgExecutor<'_>, input: &CreateLayer) -> Result<Layer, sqlx::Error> {
        let query = format!(
            "INSERT INTO layers (job_id, name, command, dispatch_order, min_cores, min_memory, \
                min_gpus, min_gpu_memory, is_threadable, checkpoint_enabled, tags) \
             VALUES ($1, $2, COALESCE($3, ''), COALESCE($4, 0), COALESCE($5, 100), \
                COALESCE($6, 0), COALESCE($7, 0), COALESCE($8, 0), COALESCE($9, false), \
                COALESCE($10, false), COALESCE($11, '{{}}'::TEXT[])) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Layer>(&query)
            .bind(input.job_id)
            .bind(&input.name)
            .bind(&input.command)
            .bind(input.dispatch_order)
            .bind(input.min_cores)
            .bind(input.min_memory)
            .bind(input.min_gpus)
            .bind(input.min_gpu_memory)
            .bind(input.is_threadable)
            .bind(input.checkpoint_enabled)
            .bind(&input.tags)
            .fetch_one(db)
            .await
    }

    pub async fn find_by_id(db: impl PgExecutor<'_>, id: DbId) -> Result<Option<Layer>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM layers WHERE id = $1");
        sqlx::query_as::<_, Layer>(&query)
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn list_by_job(db: impl PgExecutor<'_>, job_id: DbId) -> Result<Vec<Layer>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM layers WHERE job_id = $1 ORDER BY dispatch_order, id"
        );
        sqlx::query_as::<_, Layer>(&query)
            .bind(job_id)
            .fetch_all(db)
            .await
    }

    /// True when no frame of the layer is outside {Succeeded, Eaten}.
    ///
    /// Dead frames keep a layer incomplete: downstream layers wait until an
    /// operator retries or eats them.
    pub async fn is_complete(db: impl PgExecutor<'_>, layer_id: DbId) -> Result<bool, sqlx::Error> {
        let done = state_ids(&[FrameState::Succeeded, FrameState::Eaten]);
        let complete: bool = sqlx::query_scalar(
            "SELECT NOT EXISTS ( \
                 SELECT 1 FROM frames WHERE layer_id = $1 AND NOT (state_id = ANY($2)) \
             )",
        )
        .bind(layer_id)
        .bind(&done)
        .fetch_one(db)
        .await?;
        Ok(complete)
    }

    /// True when at least one frame of the layer is Succeeded or Eaten.
    pub async fn has_satisfied_frame(
        db: impl PgExecutor<'_>,
        layer_id: DbId,
    ) -> Result<bool, sqlx::Error> {
        let done = state_ids(&[FrameState::Succeeded, FrameState::Eaten]);
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM frames WHERE layer_id = $1 AND state_id = ANY($2))",
        )
        .bind(layer_id)
        .bind(&done)
        .fetch_one(db)
        .await
    }
}
