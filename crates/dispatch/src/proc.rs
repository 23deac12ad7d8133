//! Proc lifecycle: booking a frame onto a host, releasing it, and moving
//! memory between procs that share a host.

use std::sync::Arc;

use spool_core::booking::{plan_memory_rebalance, RebalancePolicy};
use spool_core::resources::{ResourceSlice, CORE_UNITS_PER_CORE};
use spool_core::types::DbId;
use spool_db::models::frame::DispatchFrame;
use spool_db::models::host::Host;
use spool_db::models::local::LocalAssignment;
use spool_db::models::proc::{Proc, VirtualProc};
use spool_db::repositories::{FrameRepo, HostRepo, JobRepo, ProcRepo};
use spool_events::bus::{FRAME_STARTED, PROC_RELEASED};
use spool_events::{DispatchEvent, EventBus};
use sqlx::{PgConnection, PgPool};

use crate::depend::publish_all;
use crate::error::{DispatchError, DispatchResult};
use crate::ledger::ResourceLedger;

pub struct ProcTracker {
    pool: PgPool,
    bus: Arc<EventBus>,
    rebalance: RebalancePolicy,
}

impl ProcTracker {
    pub fn new(pool: PgPool, bus: Arc<EventBus>, rebalance: RebalancePolicy) -> Self {
        Self {
            pool,
            bus,
            rebalance,
        }
    }

    // ── Building ─────────────────────────────────────────────────────────

    /// The proc `frame` would get on `host`'s general pool.
    pub fn build(host: &Host, frame: &DispatchFrame) -> VirtualProc {
        let slice = frame.requirements().requested_slice();
        VirtualProc {
            host_id: host.id,
            host_name: host.name.clone(),
            frame_id: frame.id,
            frame_version: frame.version,
            layer_id: frame.layer_id,
            job_id: frame.job_id,
            host_local_id: None,
            slice,
            threads: (slice.cores / CORE_UNITS_PER_CORE).max(1),
            is_local_dispatch: false,
            checkpoint_enabled: frame.checkpoint_enabled,
        }
    }

    /// The proc `frame` would get inside `pin`.
    pub fn build_local(host: &Host, frame: &DispatchFrame, pin: &LocalAssignment) -> VirtualProc {
        VirtualProc {
            host_local_id: Some(pin.id),
            threads: pin.threads.max(1),
            is_local_dispatch: true,
            ..Self::build(host, frame)
        }
    }

    // ── Booking ──────────────────────────────────────────────────────────

    /// Commit a booking: lock the frame, take its slice from the ledger,
    /// start the frame, record the proc and charge the job. All of it lands
    /// or none of it does.
    ///
    /// Losing to a concurrent booking yields a recoverable error
    /// (`StaleVersion`, `ReservationConflict` or `InsufficientResources`).
    /// A general booking that would take the job, its group or its show past
    /// `max_cores` is refused with `CoreCeiling`; pinned bookings are exempt.
    pub async fn dispatch(&self, proc: &VirtualProc) -> DispatchResult<Proc> {
        let stale = || DispatchError::StaleVersion {
            entity: "Frame",
            id: proc.frame_id,
        };

        let mut tx = self.pool.begin().await?;
        FrameRepo::lock_for_start(&mut tx, proc.frame_id, proc.frame_version)
            .await?
            .ok_or_else(stale)?;

        match proc.host_local_id {
            Some(pin_id) => {
                ResourceLedger::reserve_local(&mut tx, pin_id, proc.host_id, &proc.slice).await?
            }
            None => ResourceLedger::reserve(&mut *tx, proc.host_id, &proc.slice).await?,
        }

        let frame = FrameRepo::start(&mut *tx, proc).await?.ok_or_else(stale)?;
        let booked = ProcRepo::insert(&mut *tx, proc).await?;
        if proc.is_local_dispatch {
            JobRepo::add_running_cores(&mut *tx, proc.job_id, proc.slice.cores).await?;
        } else if !JobRepo::charge_running_cores(&mut *tx, proc.job_id, proc.slice.cores).await? {
            tracing::debug!(job_id = proc.job_id, frame_id = proc.frame_id, "Job at its core ceiling");
            return Err(DispatchError::CoreCeiling { job_id: proc.job_id });
        }
        tx.commit().await?;

        tracing::info!(
            proc_id = booked.id,
            frame_id = frame.id,
            job_id = frame.job_id,
            host = %proc.host_name,
            resources = %proc.slice,
            local = proc.is_local_dispatch,
            "Frame started",
        );
        self.bus.publish(
            DispatchEvent::new(FRAME_STARTED)
                .about("frame", frame.id)
                .on_host(proc.host_id)
                .with_detail(serde_json::json!({
                    "proc_id": booked.id,
                    "retries": frame.retries,
                    "resource": frame.last_resource,
                })),
        );
        Ok(booked)
    }

    /// Flag a proc as no longer wanted. Its reservation stays until release.
    pub async fn unbook(&self, proc_id: DbId) -> DispatchResult<bool> {
        Ok(ProcRepo::unbook(&self.pool, proc_id).await?)
    }

    /// Delete a proc and give its slice back to the ledger.
    pub async fn release(&self, proc_id: DbId) -> DispatchResult<Proc> {
        let mut tx = self.pool.begin().await?;
        let mut events = Vec::new();
        let released = release_proc(&mut tx, proc_id, &mut events)
            .await?
            .ok_or(DispatchError::NotFound {
                entity: "Proc",
                id: proc_id,
            })?;
        tx.commit().await?;

        publish_all(&self.bus, events);
        Ok(released)
    }

    // ── Memory ───────────────────────────────────────────────────────────

    /// Grow a proc's memory reservation by up to `needed` KB: first from the
    /// host's idle memory, then from the slack of other procs on the host.
    ///
    /// Best effort; returns how much was granted. Pinned procs are neither
    /// grown nor used as donors.
    pub async fn rebalance_memory(
        &self,
        host_id: DbId,
        proc_id: DbId,
        needed: i64,
    ) -> DispatchResult<i64> {
        if needed <= 0 {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let procs = ProcRepo::lock_by_host(&mut *tx, host_id).await?;
        let recipient = procs
            .iter()
            .find(|p| p.id == proc_id)
            .ok_or(DispatchError::NotFound {
                entity: "Proc",
                id: proc_id,
            })?;
        if recipient.is_local_dispatch {
            return Ok(0);
        }

        let mut granted = 0;
        let host = HostRepo::find_by_id(&mut *tx, host_id)
            .await?
            .ok_or(DispatchError::NotFound {
                entity: "Host",
                id: host_id,
            })?;
        let from_idle = needed.min(host.idle_memory);
        if from_idle > 0
            && HostRepo::reserve(&mut *tx, host_id, &ResourceSlice::new(0, from_idle, 0, 0)).await?
        {
            granted += from_idle;
        }

        if granted < needed {
            let donors: Vec<_> = procs
                .iter()
                .filter(|p| !p.is_local_dispatch)
                .map(Proc::memory)
                .collect();
            let plan = plan_memory_rebalance(proc_id, needed - granted, &donors, &self.rebalance);
            for transfer in plan.transfers {
                if ProcRepo::adjust_reserved_memory(
                    &mut *tx,
                    transfer.donor_proc_id,
                    -transfer.amount,
                    self.rebalance.floor,
                )
                .await?
                {
                    granted += transfer.amount;
                }
            }
        }

        if granted > 0 {
            ProcRepo::adjust_reserved_memory(&mut *tx, proc_id, granted, 0).await?;
        }
        tx.commit().await?;

        if granted < needed {
            tracing::warn!(host_id, proc_id, needed, granted, "Memory rebalance fell short");
        } else {
            tracing::debug!(host_id, proc_id, granted, "Memory rebalanced");
        }
        Ok(granted)
    }
}

/// Delete a proc and return its slice to the host (and its pin), uncharging
/// the job. `None` when the proc is already gone.
pub(crate) async fn release_proc(
    conn: &mut PgConnection,
    proc_id: DbId,
    events: &mut Vec<DispatchEvent>,
) -> DispatchResult<Option<Proc>> {
    let Some(proc) = ProcRepo::delete(&mut *conn, proc_id).await? else {
        return Ok(None);
    };

    let slice = proc.reservation();
    match proc.host_local_id {
        Some(pin_id) => ResourceLedger::release_local(conn, pin_id, proc.host_id, &slice).await?,
        None => ResourceLedger::release(&mut *conn, proc.host_id, &slice).await?,
    }
    JobRepo::add_running_cores(&mut *conn, proc.job_id, -proc.reserved_cores).await?;

    tracing::debug!(proc_id, frame_id = proc.frame_id, host_id = proc.host_id, "Proc released");
    events.push(
        DispatchEvent::new(PROC_RELEASED)
            .about("proc", proc.id)
            .on_host(proc.host_id)
            .with_detail(serde_json::json!({ "frame_id": proc.frame_id })),
    );
    Ok(Some(proc))
}
