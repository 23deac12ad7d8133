//! Resource ledger: the single path through which host and pin capacity is
//! taken and given back.
//!
//! Every operation is a conditional update in the caller's transaction. A
//! reservation that does not fit changes nothing and surfaces as
//! [`DispatchError::InsufficientResources`]; a release that would push idle
//! above total means the books are already wrong and surfaces as an internal
//! error.

use serde::Serialize;
use spool_core::error::CoreError;
use spool_core::resources::{is_conserved, offerable, Offer, ResourceSlice};
use spool_core::types::DbId;
use spool_db::models::host::Host;
use spool_db::models::local::{CreateLocalAssignment, LocalAssignment, LocalResize};
use spool_db::repositories::{HostRepo, LocalAssignmentRepo};
use sqlx::{PgConnection, PgExecutor, PgPool};

use crate::error::{DispatchError, DispatchResult};

/// Snapshot of one host's books.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerAudit {
    pub host_id: DbId,
    pub total: ResourceSlice,
    pub idle: ResourceSlice,
    /// Sum of every proc reservation on the host.
    pub committed: ResourceSlice,
    pub conserved: bool,
}

pub struct ResourceLedger;

impl ResourceLedger {
    // ── Host pool ────────────────────────────────────────────────────────

    /// Take `slice` from the host's idle pool.
    pub async fn reserve(
        db: impl PgExecutor<'_>,
        host_id: DbId,
        slice: &ResourceSlice,
    ) -> DispatchResult<()> {
        if HostRepo::reserve(db, host_id, slice).await? {
            Ok(())
        } else {
            tracing::debug!(host_id, %slice, "Host reservation refused");
            Err(DispatchError::InsufficientResources { host_id })
        }
    }

    /// Give `slice` back to the host's idle pool.
    pub async fn release(
        db: impl PgExecutor<'_>,
        host_id: DbId,
        slice: &ResourceSlice,
    ) -> DispatchResult<()> {
        if HostRepo::release(db, host_id, slice).await? {
            Ok(())
        } else {
            tracing::error!(host_id, %slice, "Host release would exceed total capacity");
            Err(CoreError::Internal(format!(
                "Releasing {slice} on host {host_id} would exceed its total"
            ))
            .into())
        }
    }

    // ── Pinned pools ─────────────────────────────────────────────────────

    /// Pin part of a host to a job, layer or frame.
    pub async fn create_local(
        db: impl PgExecutor<'_>,
        input: &CreateLocalAssignment,
    ) -> DispatchResult<LocalAssignment> {
        if input.max.has_negative() {
            return Err(CoreError::Validation("Pinned pool cannot be negative".to_string()).into());
        }
        LocalAssignmentRepo::create(db, input).await?.ok_or_else(|| {
            CoreError::Validation(format!(
                "Host {} does not exist or cannot hold a pool of {}",
                input.host_id, input.max
            ))
            .into()
        })
    }

    /// Take `slice` from a pin and from the host it lives on.
    pub async fn reserve_local(
        conn: &mut PgConnection,
        pin_id: DbId,
        host_id: DbId,
        slice: &ResourceSlice,
    ) -> DispatchResult<()> {
        if !LocalAssignmentRepo::reserve(&mut *conn, pin_id, slice).await? {
            tracing::debug!(pin_id, host_id, %slice, "Pinned reservation refused");
            return Err(DispatchError::InsufficientResources { host_id });
        }
        Self::reserve(&mut *conn, host_id, slice).await
    }

    /// Give `slice` back to its host and refill the pin from what its procs
    /// still hold. The released proc must already be gone.
    pub async fn release_local(
        conn: &mut PgConnection,
        pin_id: DbId,
        host_id: DbId,
        slice: &ResourceSlice,
    ) -> DispatchResult<()> {
        if LocalAssignmentRepo::lock(&mut *conn, pin_id).await?.is_none() {
            tracing::warn!(pin_id, host_id, "Released against a pin that no longer exists");
        } else {
            LocalAssignmentRepo::release(&mut *conn, pin_id).await?;
        }
        Self::release(&mut *conn, host_id, slice).await
    }

    /// Resize a pin. Committed capacity left above the new max is reported,
    /// not reclaimed.
    pub async fn resize_local(
        db: impl PgExecutor<'_>,
        pin_id: DbId,
        new_max: &ResourceSlice,
    ) -> DispatchResult<LocalResize> {
        if new_max.has_negative() {
            return Err(CoreError::Validation("Pinned pool cannot be negative".to_string()).into());
        }
        let resized = LocalAssignmentRepo::resize(db, pin_id, new_max)
            .await?
            .ok_or(DispatchError::NotFound {
                entity: "LocalAssignment",
                id: pin_id,
            })?;
        if !resized.oversubscribed.is_zero() {
            tracing::warn!(
                pin_id,
                oversubscribed = %resized.oversubscribed,
                "Pinned pool shrunk below its committed capacity",
            );
        }
        Ok(resized)
    }

    // ── Reads ────────────────────────────────────────────────────────────

    /// What the matcher may hand out on `host`.
    pub fn offer(host: &Host, min_memory_per_core: i64) -> Offer {
        offerable(&host.idle(), min_memory_per_core)
    }

    /// Compare a host's idle pool against the procs it carries.
    pub async fn audit(pool: &PgPool, host_id: DbId) -> DispatchResult<LedgerAudit> {
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;

        let host = HostRepo::find_by_id(&mut *tx, host_id)
            .await?
            .ok_or(DispatchError::NotFound {
                entity: "Host",
                id: host_id,
            })?;
        let committed = HostRepo::committed(&mut *tx, host_id).await?;
        tx.commit().await?;

        let total = host.total();
        let idle = host.idle();
        let conserved = is_conserved(&total, &idle, [&committed]);
        if !conserved {
            tracing::error!(host_id, %total, %idle, %committed, "Host ledger is not conserved");
        }
        Ok(LedgerAudit {
            host_id,
            total,
            idle,
            committed,
            conserved,
        })
    }
}
