//! Host heartbeat handling: refresh the host, record what it is running,
//! then book as much work onto it as fits.

use std::sync::Arc;

use spool_core::resources::ResourceSlice;
use spool_db::models::host::{FrameUsage, Host, HostReport};
use spool_db::models::local::LocalAssignment;
use spool_db::models::proc::{Proc, VirtualProc};
use spool_db::repositories::{HostRepo, JobScope, LocalAssignmentRepo, ProcRepo};
use spool_events::EventBus;
use sqlx::PgPool;

use crate::config::DispatchConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::matcher::DispatchMatcher;
use crate::proc::ProcTracker;

pub struct HostReportHandler {
    pool: PgPool,
    matcher: DispatchMatcher,
    procs: ProcTracker,
    max_frames_per_report: usize,
}

/// What a booking attempt means for the rest of the cycle.
enum Booking {
    Booked(Proc),
    Skipped,
    JobFull,
    HostFull,
}

impl HostReportHandler {
    pub fn new(pool: PgPool, bus: Arc<EventBus>, config: &DispatchConfig) -> Self {
        Self {
            matcher: DispatchMatcher::new(pool.clone(), config),
            procs: ProcTracker::new(pool.clone(), bus, config.rebalance),
            max_frames_per_report: config.max_frames_per_report,
            pool,
        }
    }

    pub fn matcher(&self) -> &DispatchMatcher {
        &self.matcher
    }

    pub fn procs(&self) -> &ProcTracker {
        &self.procs
    }

    /// Process one heartbeat and return the procs booked onto the host.
    ///
    /// A host with active pins runs pinned work only. Lost races are skipped;
    /// other failures end the cycle, and are returned only if nothing was
    /// booked before them.
    pub async fn handle_report(&self, report: &HostReport) -> DispatchResult<Vec<Proc>> {
        let host = HostRepo::upsert_from_report(&self.pool, report).await?;
        self.record_usage(&host, &report.running).await;

        if !host.is_bookable() {
            tracing::debug!(host = %host.name, "Host not bookable, skipping dispatch");
            return Ok(Vec::new());
        }

        let pins = LocalAssignmentRepo::list_active_for_host(&self.pool, host.id).await?;
        let booked = if pins.is_empty() {
            self.dispatch_general(&host).await?
        } else {
            self.dispatch_local(&host, &pins).await?
        };

        if !booked.is_empty() {
            tracing::info!(host = %host.name, booked = booked.len(), "Host report dispatched");
        }
        Ok(booked)
    }

    /// Store measured memory for the host's running frames and grow any
    /// reservation the frame has outgrown. Failures are logged, not returned.
    async fn record_usage(&self, host: &Host, running: &[FrameUsage]) {
        for usage in running {
            let proc = match ProcRepo::update_usage(&self.pool, usage.frame_id, usage.used_memory).await {
                Ok(Some(proc)) => proc,
                Ok(None) => {
                    tracing::warn!(host = %host.name, frame_id = usage.frame_id, "Report names a frame with no proc");
                    continue;
                }
                Err(e) => {
                    tracing::error!(host = %host.name, error = %e, "Failed to record frame usage");
                    continue;
                }
            };
            if proc.host_id != host.id || proc.used_memory <= proc.reserved_memory {
                continue;
            }
            let needed = proc.used_memory - proc.reserved_memory;
            if let Err(e) = self.procs.rebalance_memory(host.id, proc.id, needed).await {
                tracing::warn!(proc_id = proc.id, error = %e, "Memory rebalance failed");
            }
        }
    }

    async fn dispatch_general(&self, host: &Host) -> DispatchResult<Vec<Proc>> {
        let mut remaining = self.matcher.offer_for(host).offerable;
        let mut booked = Vec::new();
        if remaining.cores <= 0 && remaining.gpus <= 0 {
            return Ok(booked);
        }

        let jobs = self
            .matcher
            .find_dispatchable_jobs(host, &remaining, JobScope::All)
            .await?;
        'jobs: for job_id in jobs {
            let wanted = self.max_frames_per_report - booked.len();
            if wanted == 0 {
                break;
            }
            let offer = match self.matcher.cap_to_ceiling(job_id, &remaining).await {
                Ok(offer) => offer,
                Err(e) => return finish(booked, e),
            };
            if offer.cores <= 0 && offer.gpus <= 0 {
                continue;
            }
            let frames = match self.matcher.find_next_frames(host, job_id, &offer, wanted).await {
                Ok(frames) => frames,
                Err(e) => return finish(booked, e),
            };
            for frame in frames {
                let proc = ProcTracker::build(host, &frame);
                match self.book(&proc).await {
                    Ok(Booking::Booked(row)) => {
                        remaining = remaining.checked_sub(&proc.slice).unwrap_or(ResourceSlice::ZERO);
                        booked.push(row);
                    }
                    Ok(Booking::Skipped) => {}
                    Ok(Booking::JobFull) => continue 'jobs,
                    Ok(Booking::HostFull) => break 'jobs,
                    Err(e) => return finish(booked, e),
                }
            }
        }
        Ok(booked)
    }

    async fn dispatch_local(&self, host: &Host, pins: &[LocalAssignment]) -> DispatchResult<Vec<Proc>> {
        let mut booked = Vec::new();
        for pin in pins {
            let wanted = self.max_frames_per_report - booked.len();
            if wanted == 0 {
                break;
            }
            let frames = match self.matcher.find_local_frames(pin, wanted).await {
                Ok(frames) => frames,
                Err(e) => return finish(booked, e),
            };
            for frame in frames {
                let proc = ProcTracker::build_local(host, &frame, pin);
                match self.book(&proc).await {
                    Ok(Booking::Booked(row)) => booked.push(row),
                    Ok(Booking::Skipped) | Ok(Booking::JobFull) => {}
                    Ok(Booking::HostFull) => break,
                    Err(e) => return finish(booked, e),
                }
            }
        }
        Ok(booked)
    }

    async fn book(&self, proc: &VirtualProc) -> DispatchResult<Booking> {
        match self.procs.dispatch(proc).await {
            Ok(row) => Ok(Booking::Booked(row)),
            Err(DispatchError::InsufficientResources { .. }) => {
                tracing::debug!(host = %proc.host_name, frame_id = proc.frame_id, "Host ran out of room");
                Ok(Booking::HostFull)
            }
            Err(DispatchError::CoreCeiling { job_id }) => {
                tracing::debug!(host = %proc.host_name, job_id, "Job reached its core ceiling");
                Ok(Booking::JobFull)
            }
            Err(e) if e.is_lost_race() => {
                tracing::debug!(frame_id = proc.frame_id, error = %e, "Lost booking race");
                Ok(Booking::Skipped)
            }
            Err(e) => Err(e),
        }
    }
}

/// End a cycle on an unexpected error, keeping what was already committed.
fn finish(booked: Vec<Proc>, err: DispatchError) -> DispatchResult<Vec<Proc>> {
    if booked.is_empty() {
        return Err(err);
    }
    tracing::error!(error = %err, booked = booked.len(), "Dispatch cycle stopped early");
    Ok(booked)
}
