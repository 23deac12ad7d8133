//! Decides which frames a host should run next.
//!
//! The matcher only reads. Everything it returns is a candidate that
//! [`ProcTracker::dispatch`](crate::proc::ProcTracker::dispatch) may still
//! lose to a concurrent booking.

use std::sync::atomic::{AtomicU8, Ordering};

use spool_core::booking::plan_batch;
use spool_core::resources::{Offer, ResourceSlice};
use spool_core::scheduling::{higher_priority_waiting, SchedulingMode};
use spool_core::types::DbId;
use spool_db::models::frame::DispatchFrame;
use spool_db::models::host::Host;
use spool_db::models::local::LocalAssignment;
use spool_db::repositories::{DispatchRepo, JobRepo, JobScope};
use sqlx::PgPool;

use crate::config::DispatchConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::ledger::ResourceLedger;

/// Candidate frames fetched per frame wanted, so a batch can skip frames
/// that no longer fit once earlier ones are planned.
const FRAME_OVERFETCH: usize = 4;

pub struct DispatchMatcher {
    pool: PgPool,
    mode: AtomicU8,
    min_memory_per_core: i64,
    job_candidates: i64,
}

impl DispatchMatcher {
    pub fn new(pool: PgPool, config: &DispatchConfig) -> Self {
        Self {
            pool,
            mode: AtomicU8::new(config.scheduling_mode.as_u8()),
            min_memory_per_core: config.min_memory_per_core,
            job_candidates: config.job_candidates,
        }
    }

    pub fn mode(&self) -> SchedulingMode {
        SchedulingMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    /// Switch scheduling mode. Takes effect on the next query.
    pub fn set_mode(&self, mode: SchedulingMode) {
        let previous = SchedulingMode::from_u8(self.mode.swap(mode.as_u8(), Ordering::Relaxed));
        if previous != mode {
            tracing::info!(from = %previous, to = %mode, "Scheduling mode changed");
        }
    }

    /// Capacity `host` can hand out, after stranded cores are set aside.
    pub fn offer_for(&self, host: &Host) -> Offer {
        let offer = ResourceLedger::offer(host, self.min_memory_per_core);
        if offer.stranded_cores > 0 {
            tracing::debug!(host = %host.name, stranded = offer.stranded_cores, "Idle cores stranded");
        }
        offer
    }

    // ── General pool ─────────────────────────────────────────────────────

    /// Jobs with a frame that fits `offer` on `host`, best first.
    pub async fn find_dispatchable_jobs(
        &self,
        host: &Host,
        offer: &ResourceSlice,
        scope: JobScope,
    ) -> DispatchResult<Vec<DbId>> {
        Ok(DispatchRepo::find_dispatchable_jobs(
            &self.pool,
            &host.tags,
            offer,
            self.mode(),
            scope,
            self.job_candidates,
        )
        .await?)
    }

    /// Up to `limit` frames of `job_id` that fit `offer` together.
    pub async fn find_next_frames(
        &self,
        host: &Host,
        job_id: DbId,
        offer: &ResourceSlice,
        limit: usize,
    ) -> DispatchResult<Vec<DispatchFrame>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let candidates = DispatchRepo::find_next_frames(
            &self.pool,
            job_id,
            &host.tags,
            offer,
            overfetch(limit),
        )
        .await?;
        Ok(pack(candidates, offer, limit))
    }

    /// `offer` with its cores cut down to what `job_id` may still take under
    /// its own, its group's and its show's core ceilings.
    pub async fn cap_to_ceiling(&self, job_id: DbId, offer: &ResourceSlice) -> DispatchResult<ResourceSlice> {
        let mut capped = *offer;
        if let Some(headroom) = JobRepo::core_headroom(&self.pool, job_id).await? {
            capped.cores = capped.cores.min(headroom);
        }
        Ok(capped)
    }

    /// The single best frame of `job_id` for `host`, if any fits.
    pub async fn find_next_frame(
        &self,
        host: &Host,
        job_id: DbId,
        offer: &ResourceSlice,
    ) -> DispatchResult<Option<DispatchFrame>> {
        Ok(self
            .find_next_frames(host, job_id, offer, 1)
            .await?
            .into_iter()
            .next())
    }

    // ── Pinned pools ─────────────────────────────────────────────────────

    /// Jobs pinned to `host_id` by an active assignment.
    pub async fn find_local_dispatchable_jobs(&self, host_id: DbId) -> DispatchResult<Vec<DbId>> {
        Ok(DispatchRepo::find_local_dispatchable_jobs(&self.pool, host_id).await?)
    }

    /// Up to `limit` frames inside `pin`'s scope that fit its idle pool together.
    pub async fn find_local_frames(
        &self,
        pin: &LocalAssignment,
        limit: usize,
    ) -> DispatchResult<Vec<DispatchFrame>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let candidates = DispatchRepo::find_local_frames(&self.pool, pin, overfetch(limit)).await?;
        Ok(pack(candidates, &pin.idle(), limit))
    }

    // ── Preemption hints ─────────────────────────────────────────────────

    /// Whether a job that could run on `host` outranks `job_id` while still
    /// short of its minimum cores.
    pub async fn higher_priority_job_exists(&self, job_id: DbId, host: &Host) -> DispatchResult<bool> {
        let incumbent = JobRepo::find_by_id(&self.pool, job_id)
            .await?
            .ok_or(DispatchError::NotFound { entity: "Job", id: job_id })?
            .candidate();
        let others: Vec<_> = DispatchRepo::list_pending_for_tags(&self.pool, &host.tags)
            .await?
            .iter()
            .map(|j| j.candidate())
            .collect();
        Ok(higher_priority_waiting(self.mode(), &incumbent, &others))
    }
}

fn overfetch(limit: usize) -> i64 {
    limit.saturating_mul(FRAME_OVERFETCH).try_into().unwrap_or(i64::MAX)
}

/// Keep the candidates a greedy packing of `offer` accepts, in order.
fn pack(candidates: Vec<DispatchFrame>, offer: &ResourceSlice, limit: usize) -> Vec<DispatchFrame> {
    let requirements: Vec<_> = candidates.iter().map(DispatchFrame::requirements).collect();
    let planned = plan_batch(&requirements, *offer, limit);
    let mut keep = vec![false; candidates.len()];
    for booking in &planned {
        keep[booking.index] = true;
    }
    candidates
        .into_iter()
        .zip(keep)
        .filter_map(|(frame, keep)| keep.then_some(frame))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: DbId, cores: i32, memory: i64) -> DispatchFrame {
        DispatchFrame {
            id,
            layer_id: 1,
            job_id: 1,
            group_id: 1,
            show_id: 1,
            number: id as i32,
            version: 0,
            dispatch_order: id as i32,
            layer_dispatch_order: 0,
            exit_status: -1,
            layer_name: "comp".to_string(),
            min_cores: cores,
            min_memory: memory,
            min_gpus: 0,
            min_gpu_memory: 0,
            is_threadable: true,
            checkpoint_enabled: false,
            tags: vec![],
        }
    }

    #[test]
    fn pack_keeps_dispatch_order_and_skips_what_no_longer_fits() {
        let candidates = vec![frame(1, 200, 100), frame(2, 300, 100), frame(3, 100, 100)];
        let packed = pack(candidates, &ResourceSlice::new(300, 1000, 0, 0), 10);
        let ids: Vec<_> = packed.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn pack_honours_limit() {
        let candidates = vec![frame(1, 100, 100), frame(2, 100, 100)];
        let packed = pack(candidates, &ResourceSlice::new(800, 1000, 0, 0), 1);
        assert_eq!(packed.len(), 1);
        assert_eq!(packed[0].id, 1);
    }

    #[test]
    fn overfetch_saturates() {
        assert_eq!(overfetch(2), 8);
        assert_eq!(overfetch(usize::MAX), i64::MAX);
    }
}
