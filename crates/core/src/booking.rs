//! Booking planner: how much of a host each candidate frame takes, how a
//! batch of frames is packed onto one host, and how memory slack is moved
//! between procs on a host.
//!
//! Pure logic: nothing here commits anything. Plans are applied one
//! reservation at a time by the dispatch layer, each of which may still lose
//! to a concurrent booking.

use crate::resources::{cores_for_layer, ResourceSlice};
use crate::types::DbId;

// ---------------------------------------------------------------------------
// Batch planning
// ---------------------------------------------------------------------------

/// Minimum requirements of a frame's layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerRequirements {
    pub min_cores: i32,
    pub min_memory: i64,
    pub min_gpus: i32,
    pub min_gpu_memory: i64,
    pub threadable: bool,
}

impl LayerRequirements {
    /// The slice a proc for this layer reserves.
    pub fn requested_slice(&self) -> ResourceSlice {
        ResourceSlice {
            cores: cores_for_layer(self.min_cores, self.threadable),
            memory: self.min_memory,
            gpus: self.min_gpus,
            gpu_memory: self.min_gpu_memory,
        }
    }
}

/// One frame chosen for a batch and the slice it was planned against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedBooking {
    /// Index into the candidate slice passed to [`plan_batch`].
    pub index: usize,
    pub slice: ResourceSlice,
}

/// Greedily pack candidates (already in dispatch order) into `offer`.
///
/// A local copy of the idle capacity is decremented as frames are taken, so
/// the batch never plans beyond what the host offered. Candidates that do not
/// fit are skipped; later, smaller ones may still fit.
pub fn plan_batch(
    candidates: &[LayerRequirements],
    offer: ResourceSlice,
    limit: usize,
) -> Vec<PlannedBooking> {
    let mut idle = offer;
    let mut planned = Vec::new();
    for (index, req) in candidates.iter().enumerate() {
        if planned.len() >= limit {
            break;
        }
        let slice = req.requested_slice();
        if slice.cores <= 0 && slice.gpus <= 0 {
            // A proc must hold something on the host.
            continue;
        }
        if let Some(rest) = idle.checked_sub(&slice) {
            idle = rest;
            planned.push(PlannedBooking { index, slice });
        }
    }
    planned
}

// ---------------------------------------------------------------------------
// Memory rebalancing
// ---------------------------------------------------------------------------

/// Default floor below which a proc's memory reservation is never reduced.
pub const DEFAULT_REBALANCE_FLOOR_KB: i64 = 512 * 1024;

/// Default headroom kept above a donor proc's measured usage, in percent.
pub const DEFAULT_REBALANCE_HEADROOM_PERCENT: i64 = 20;

/// Memory view of one proc on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcMemory {
    pub proc_id: DbId,
    pub reserved: i64,
    pub used: i64,
}

/// Tunables for [`plan_memory_rebalance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebalancePolicy {
    pub floor: i64,
    pub headroom_percent: i64,
}

impl Default for RebalancePolicy {
    fn default() -> Self {
        Self {
            floor: DEFAULT_REBALANCE_FLOOR_KB,
            headroom_percent: DEFAULT_REBALANCE_HEADROOM_PERCENT,
        }
    }
}

/// Memory taken from one donor proc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryTransfer {
    pub donor_proc_id: DbId,
    pub amount: i64,
}

/// A best-effort plan to cover `needed` KB for one proc.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalancePlan {
    pub transfers: Vec<MemoryTransfer>,
    pub total: i64,
}

impl RebalancePlan {
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

/// Reservation a donor must keep: its usage plus headroom, never under the floor.
pub fn donor_keep(proc: &ProcMemory, policy: &RebalancePolicy) -> i64 {
    let with_headroom = proc.used + proc.used * policy.headroom_percent / 100;
    with_headroom.max(policy.floor)
}

/// Plan reclaiming up to `needed` KB of slack from procs other than
/// `recipient_proc_id`, largest slack first.
///
/// The plan may cover less than `needed`; it never takes a donor below
/// [`donor_keep`].
pub fn plan_memory_rebalance(
    recipient_proc_id: DbId,
    needed: i64,
    procs: &[ProcMemory],
    policy: &RebalancePolicy,
) -> RebalancePlan {
    let mut donors: Vec<(DbId, i64)> = procs
        .iter()
        .filter(|p| p.proc_id != recipient_proc_id)
        .map(|p| (p.proc_id, p.reserved - donor_keep(p, policy)))
        .filter(|(_, slack)| *slack > 0)
        .collect();
    donors.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut plan = RebalancePlan::default();
    for (donor_proc_id, slack) in donors {
        let remaining = needed - plan.total;
        if remaining <= 0 {
            break;
        }
        let amount = slack.min(remaining);
        plan.transfers.push(MemoryTransfer {
            donor_proc_id,
            amount,
        });
        plan.total += amount;
    }
    plan
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const GB: i64 = 1024 * 1024;

    fn req(cores: i32, memory: i64, threadable: bool) -> LayerRequirements {
        LayerRequirements {
            min_cores: cores,
            min_memory: memory,
            min_gpus: 0,
            min_gpu_memory: 0,
            threadable,
        }
    }

    #[test]
    fn batch_never_overcommits_the_offer() {
        let candidates = vec![req(100, GB, false); 5];
        let planned = plan_batch(&candidates, ResourceSlice::new(300, 8 * GB, 0, 0), 10);
        assert_eq!(planned.len(), 3);
        assert_eq!(planned.iter().map(|p| p.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn batch_respects_limit() {
        let candidates = vec![req(100, GB, false); 5];
        let planned = plan_batch(&candidates, ResourceSlice::new(800, 8 * GB, 0, 0), 2);
        assert_eq!(planned.len(), 2);
    }

    #[test]
    fn batch_skips_frames_that_do_not_fit() {
        let candidates = vec![req(400, GB, true), req(100, GB, false)];
        let planned = plan_batch(&candidates, ResourceSlice::new(200, 8 * GB, 0, 0), 10);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].index, 1);
    }

    #[test]
    fn batch_stops_on_memory() {
        let candidates = vec![req(100, 4 * GB, false); 3];
        let planned = plan_batch(&candidates, ResourceSlice::new(800, 10 * GB, 0, 0), 10);
        assert_eq!(planned.len(), 2);
    }

    #[test]
    fn non_threadable_batch_slices_are_one_core() {
        let candidates = vec![req(400, GB, false)];
        let planned = plan_batch(&candidates, ResourceSlice::new(100, 8 * GB, 0, 0), 10);
        assert_eq!(planned[0].slice.cores, 100);
    }

    #[test]
    fn rebalance_takes_from_largest_slack_first() {
        let procs = [
            ProcMemory { proc_id: 1, reserved: 8 * GB, used: 8 * GB },
            ProcMemory { proc_id: 2, reserved: 4 * GB, used: GB },
            ProcMemory { proc_id: 3, reserved: 8 * GB, used: GB },
        ];
        let policy = RebalancePolicy { floor: GB / 2, headroom_percent: 0 };
        let plan = plan_memory_rebalance(1, 2 * GB, &procs, &policy);
        assert_eq!(plan.total, 2 * GB);
        assert_eq!(plan.transfers, vec![MemoryTransfer { donor_proc_id: 3, amount: 2 * GB }]);
    }

    #[test]
    fn rebalance_never_goes_below_floor() {
        let procs = [
            ProcMemory { proc_id: 1, reserved: GB, used: GB },
            ProcMemory { proc_id: 2, reserved: 2 * GB, used: 0 },
        ];
        let policy = RebalancePolicy { floor: GB + GB / 2, headroom_percent: 0 };
        let plan = plan_memory_rebalance(1, 4 * GB, &procs, &policy);
        assert_eq!(plan.total, GB / 2);
        let donor = &procs[1];
        assert!(donor.reserved - plan.transfers[0].amount >= policy.floor);
    }

    #[test]
    fn rebalance_keeps_headroom_over_usage() {
        let procs = [
            ProcMemory { proc_id: 1, reserved: GB, used: GB },
            ProcMemory { proc_id: 2, reserved: 4 * GB, used: 2 * GB },
        ];
        let policy = RebalancePolicy { floor: 0, headroom_percent: 50 };
        // Donor keeps 3 GB, so only 1 GB is available.
        let plan = plan_memory_rebalance(1, 4 * GB, &procs, &policy);
        assert_eq!(plan.total, GB);
    }

    #[test]
    fn rebalance_with_no_slack_is_empty() {
        let procs = [ProcMemory { proc_id: 1, reserved: GB, used: GB }];
        let plan = plan_memory_rebalance(1, GB, &procs, &RebalancePolicy::default());
        assert!(plan.is_empty());
    }
}
