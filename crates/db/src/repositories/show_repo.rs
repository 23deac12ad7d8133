//! Repository for the `shows` table.

use spool_core::types::DbId;
use sqlx::PgExecutor;

use crate::models::directory::{CreateShow, Show};

/// Column list for `shows` queries.
const COLUMNS: &str = "id, name, dispatch_enabled, max_cores, int_cores, created_at, updated_at";

pub struct ShowRepo;

impl ShowRepo {
    pub async fn create(db: impl PgExecutor<'_>, input: &CreateShow) -> Result<Show, sqlx::Error> {
        let query = format!(
            "INSERT INTO shows (name, max_cores) VALUES ($1, COALESCE($2, -1)) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Show>(&query)
            .bind(&input.name)
            .bind(input.max_cores)
            .fetch_one(db)
            .await
    }

    pub async fn find_by_id(db: impl PgExecutor<'_>, id: DbId) -> Result<Option<Show>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM shows WHERE id = $1");
        sqlx::query_as::<_, Show>(&query)
            .bind(id)
            .fetch_optional(db)
            .await
    }

    /// Turn dispatching on or off for every job in the show.
    pub async fn set_dispatch_enabled(
        db: impl PgExecutor<'_>,
        id: DbId,
        enabled: bool,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE shows SET dispatch_enabled = $2 WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set the show-wide core ceiling in core units (`-1` = unlimited).
    pub async fn set_max_cores(
        db: impl PgExecutor<'_>,
        id: DbId,
        max_cores: i32,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE shows SET max_cores = $2 WHERE id = $1")
            .bind(id)
            .bind(max_cores)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
