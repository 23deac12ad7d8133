//! Repository for the `groups` table.

use spool_core::types::DbId;
use sqlx::PgExecutor;

use crate::models::directory::{CreateGroup, Group};

/// Column list for `groups` queries.
const COLUMNS: &str = "id, show_id, name, max_cores, int_cores, created_at, updated_at";

pub struct GroupRepo;

impl GroupRepo {
    pub async fn create(db: impl PgExecutor<'_>, input: &CreateGroup) -> Result<Group, sqlx::Error> {
        let query = format!(
            "INSERT INTO groups (show_id, name, max_cores) VALUES ($1, $2, COALESCE($3, -1)) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Group>(&query)
            .bind(input.show_id)
            .bind(&input.name)
            .bind(input.max_cores)
            .fetch_one(db)
            .await
    }

    pub async fn find_by_id(db: impl PgExecutor<'_>, id: DbId) -> Result<Option<Group>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM groups WHERE id = $1");
        sqlx::query_as::<_, Group>(&query)
            .bind(id)
            .fetch_optional(db)
            .await
    }

    /// Set the group's core ceiling in core units (`-1` = unlimited).
    pub async fn set_max_cores(
        db: impl PgExecutor<'_>,
        id: DbId,
        max_cores: i32,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE groups SET max_cores = $2 WHERE id = $1")
            .bind(id)
            .bind(max_cores)
            .execute(db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
