//! Repository for the `depends` table.

use spool_core::depend::{DependScope, ScopeLevel};
use spool_core::states::{DependTarget, DependType};
use spool_core::types::{DbId, StateId};
use sqlx::PgExecutor;

use crate::models::depend::{Depend, NewDepend};

/// Column list for `depends` queries.
const COLUMNS: &str = "\
    id, type_id, target_id, any_frame, is_active, is_composite, parent_id, signature, \
    er_job_id, er_layer_id, er_frame_id, on_job_id, on_layer_id, on_frame_id, \
    created_at, satisfied_at";

fn type_ids(types: impl Iterator<Item = DependType>) -> Vec<StateId> {
    types.map(|t| t.id()).collect()
}

/// `(column, type ids)` selecting edges whose upstream side is `scope`.
fn upstream_filter(scope: &DependScope) -> (&'static str, Vec<StateId>) {
    let column = match scope {
        DependScope::Job(_) => "on_job_id",
        DependScope::Layer(_) => "on_layer_id",
        DependScope::Frame(_) => "on_frame_id",
    };
    let types = type_ids(DependType::satisfiable_on(scope.level()).into_iter());
    (column, types)
}

/// `(column, type ids)` selecting edges whose blocked side is `scope`.
fn erring_filter(scope: &DependScope) -> (&'static str, Vec<StateId>) {
    let column = match scope {
        DependScope::Job(_) => "er_job_id",
        DependScope::Layer(_) => "er_layer_id",
        DependScope::Frame(_) => "er_frame_id",
    };
    let level: ScopeLevel = scope.level();
    let types = type_ids(
        DependType::ALL
            .iter()
            .copied()
            .filter(|t| t.er_level() == level),
    );
    (column, types)
}

pub struct DependRepo;

impl DependRepo {
    /// Insert an edge.
    ///
    /// Top-level edges are unique per signature while active; a duplicate
    /// insert returns `None` and the caller looks the existing edge up with
    /// [`find_active_by_signature`](Self::find_active_by_signature).
    pub async fn insert(
        db: impl PgExecutor<'_>,
        input: &NewDepend,
    ) -> Result<Option<Depend>, sqlx::Error> {
        let query = format!(
            "INSERT INTO depends (type_id, target_id, any_frame, is_composite, parent_id, \
                signature, er_job_id, er_layer_id, er_frame_id, on_job_id, on_layer_id, on_frame_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (signature) WHERE is_active AND parent_id IS NULL DO NOTHING \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Depend>(&query)
            .bind(input.kind.id())
            .bind(input.target.id())
            .bind(input.any_frame)
            .bind(input.kind.is_composite())
            .bind(input.parent_id)
            .bind(&input.signature)
            .bind(input.er_job_id)
            .bind(input.er_layer_id)
            .bind(input.er_frame_id)
            .bind(input.on_job_id)
            .bind(input.on_layer_id)
            .bind(input.on_frame_id)
            .fetch_optional(db)
            .await
    }

    pub async fn find_by_id(db: impl PgExecutor<'_>, id: DbId) -> Result<Option<Depend>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM depends WHERE id = $1");
        sqlx::query_as::<_, Depend>(&query)
            .bind(id)
            .fetch_optional(db)
            .await
    }

    pub async fn find_active_by_signature(
        db: impl PgExecutor<'_>,
        signature: &str,
    ) -> Result<Option<Depend>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM depends \
             WHERE signature = $1 AND is_active AND parent_id IS NULL"
        );
        sqlx::query_as::<_, Depend>(&query)
            .bind(signature)
            .fetch_optional(db)
            .await
    }

    /// Edges waiting on `scope`: the ones its completion can satisfy.
    ///
    /// Composite parents never appear here; their children do.
    pub async fn what_depends_on(
        db: impl PgExecutor<'_>,
        scope: &DependScope,
        include_inactive: bool,
    ) -> Result<Vec<Depend>, sqlx::Error> {
        let (column, types) = upstream_filter(scope);
        let query = format!(
            "SELECT {COLUMNS} FROM depends \
             WHERE {column} = $1 AND type_id = ANY($2) AND ($3 OR is_active) \
             ORDER BY id"
        );
        sqlx::query_as::<_, Depend>(&query)
            .bind(scope.id())
            .bind(&types)
            .bind(include_inactive)
            .fetch_all(db)
            .await
    }

    /// Active top-level edges blocking `scope`, optionally filtered by target.
    ///
    /// Children of composite edges are not listed on their own.
    pub async fn what_this_depends_on(
        db: impl PgExecutor<'_>,
        scope: &DependScope,
        target: Option<DependTarget>,
    ) -> Result<Vec<Depend>, sqlx::Error> {
        let (column, types) = erring_filter(scope);
        let query = format!(
            "SELECT {COLUMNS} FROM depends \
             WHERE {column} = $1 AND type_id = ANY($2) AND is_active AND parent_id IS NULL \
               AND ($3::SMALLINT IS NULL OR target_id = $3) \
             ORDER BY id"
        );
        sqlx::query_as::<_, Depend>(&query)
            .bind(scope.id())
            .bind(&types)
            .bind(target.map(|t| t.id()))
            .fetch_all(db)
            .await
    }

    pub async fn child_dependencies(
        db: impl PgExecutor<'_>,
        parent_id: DbId,
    ) -> Result<Vec<Depend>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM depends WHERE parent_id = $1 ORDER BY id");
        sqlx::query_as::<_, Depend>(&query)
            .bind(parent_id)
            .fetch_all(db)
            .await
    }

    pub async fn count_active_children(
        db: impl PgExecutor<'_>,
        parent_id: DbId,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM depends WHERE parent_id = $1 AND is_active")
            .bind(parent_id)
            .fetch_one(db)
            .await
    }

    /// Flip an active, non-composite edge off and stamp its satisfaction time.
    /// Returns false when the edge was already inactive or is composite.
    pub async fn deactivate(db: impl PgExecutor<'_>, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE depends SET is_active = false, satisfied_at = NOW() \
             WHERE id = $1 AND is_active AND NOT is_composite",
        )
        .bind(id)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Flip a composite parent off once its children are handled.
    pub async fn deactivate_composite(db: impl PgExecutor<'_>, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE depends SET is_active = false, satisfied_at = NOW() \
             WHERE id = $1 AND is_active AND is_composite",
        )
        .bind(id)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Turn a satisfied edge back on. Only `FrameOnFrame` and `LayerOnLayer`
    /// edges can be reactivated.
    pub async fn reactivate(db: impl PgExecutor<'_>, id: DbId) -> Result<bool, sqlx::Error> {
        let reactivatable = type_ids(
            DependType::ALL
                .iter()
                .copied()
                .filter(|t| t.can_reactivate()),
        );
        let result = sqlx::query(
            "UPDATE depends SET is_active = true, satisfied_at = NULL \
             WHERE id = $1 AND NOT is_active AND type_id = ANY($2)",
        )
        .bind(id)
        .bind(&reactivatable)
        .execute(db)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
