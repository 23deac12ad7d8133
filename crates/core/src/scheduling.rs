//! Scheduling mode, tag matching and job ordering.
//!
//! This module lives in `core` (zero internal deps) so the ordering used by
//! the store's `ORDER BY` clauses can be exercised without a database.

use std::cmp::Ordering;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{DbId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// A layer carrying this tag runs on any host.
pub const ANY_TAG: &str = "any";

/// A negative core ceiling means "no ceiling".
pub const UNLIMITED_CORES: i32 = -1;

// ---------------------------------------------------------------------------
// Scheduling mode
// ---------------------------------------------------------------------------

/// How candidate jobs are ranked against each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingMode {
    /// Highest priority first; ties broken by start time, oldest first.
    #[default]
    Priority,
    /// Oldest start time first, ignoring priority.
    Fifo,
}

impl SchedulingMode {
    /// Compact encoding for atomic storage.
    pub fn as_u8(self) -> u8 {
        match self {
            SchedulingMode::Priority => 0,
            SchedulingMode::Fifo => 1,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => SchedulingMode::Fifo,
            _ => SchedulingMode::Priority,
        }
    }
}

impl FromStr for SchedulingMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "priority" => Ok(SchedulingMode::Priority),
            "fifo" => Ok(SchedulingMode::Fifo),
            other => Err(CoreError::Validation(format!(
                "Unknown scheduling mode \"{other}\" (expected \"priority\" or \"fifo\")"
            ))),
        }
    }
}

impl std::fmt::Display for SchedulingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulingMode::Priority => f.write_str("priority"),
            SchedulingMode::Fifo => f.write_str("fifo"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tag matching
// ---------------------------------------------------------------------------

/// Whether a layer requiring `required` tags may run on a host tagged
/// `host_tags`.
///
/// Untagged layers and layers carrying [`ANY_TAG`] match every host;
/// otherwise at least one tag must be shared.
pub fn tags_compatible(required: &[String], host_tags: &[String]) -> bool {
    if required.is_empty() || required.iter().any(|t| t == ANY_TAG) {
        return true;
    }
    required.iter().any(|req| host_tags.iter().any(|ht| ht == req))
}

// ---------------------------------------------------------------------------
// Job ordering
// ---------------------------------------------------------------------------

/// The scheduling-relevant view of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCandidate {
    pub id: DbId,
    pub priority: i32,
    pub started_at: Timestamp,
    /// Core units currently running.
    pub int_cores: i32,
    pub min_cores: i32,
    pub max_cores: i32,
}

impl JobCandidate {
    /// At or over the job's max-core ceiling.
    pub fn at_ceiling(&self) -> bool {
        at_core_ceiling(self.int_cores, self.max_cores)
    }

    /// Running fewer cores than the job's guaranteed minimum.
    pub fn under_min(&self) -> bool {
        self.int_cores < self.min_cores
    }
}

/// Whether `int_cores` has reached a ceiling of `max_cores`.
pub fn at_core_ceiling(int_cores: i32, max_cores: i32) -> bool {
    max_cores >= 0 && int_cores >= max_cores
}

/// Total order of two jobs under `mode`. Earlier sorts first.
///
/// The id is the final tie-breaker so the order is deterministic for a given
/// snapshot.
pub fn compare_jobs(mode: SchedulingMode, a: &JobCandidate, b: &JobCandidate) -> Ordering {
    let by_time = a
        .started_at
        .cmp(&b.started_at)
        .then_with(|| a.id.cmp(&b.id));
    match mode {
        SchedulingMode::Priority => b.priority.cmp(&a.priority).then(by_time),
        SchedulingMode::Fifo => by_time,
    }
}

/// Sort candidates into dispatch order.
pub fn order_jobs(mode: SchedulingMode, jobs: &mut [JobCandidate]) {
    jobs.sort_by(|a, b| compare_jobs(mode, a, b));
}

/// Whether `challenger` strictly outranks `incumbent` under `mode`.
pub fn outranks(mode: SchedulingMode, challenger: &JobCandidate, incumbent: &JobCandidate) -> bool {
    match mode {
        SchedulingMode::Priority => challenger.priority > incumbent.priority,
        SchedulingMode::Fifo => challenger.started_at < incumbent.started_at,
    }
}

/// Whether any job in `others` outranks `incumbent` while still short of its
/// minimum cores. Used when deciding whether a running allocation should be
/// reconsidered.
pub fn higher_priority_waiting(
    mode: SchedulingMode,
    incumbent: &JobCandidate,
    others: &[JobCandidate],
) -> bool {
    others
        .iter()
        .filter(|o| o.id != incumbent.id)
        .any(|o| o.under_min() && outranks(mode, o, incumbent))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn job(id: DbId, priority: i32, age_secs: i64) -> JobCandidate {
        JobCandidate {
            id,
            priority,
            started_at: Utc::now() - Duration::seconds(age_secs),
            int_cores: 0,
            min_cores: 0,
            max_cores: UNLIMITED_CORES,
        }
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("FIFO".parse::<SchedulingMode>().unwrap(), SchedulingMode::Fifo);
        assert_eq!(" priority ".parse::<SchedulingMode>().unwrap(), SchedulingMode::Priority);
        assert!("round-robin".parse::<SchedulingMode>().is_err());
    }

    #[test]
    fn mode_round_trips_through_u8() {
        for mode in [SchedulingMode::Priority, SchedulingMode::Fifo] {
            assert_eq!(SchedulingMode::from_u8(mode.as_u8()), mode);
        }
    }

    #[test]
    fn untagged_and_any_layers_match_every_host() {
        let host = vec!["linux".to_string()];
        assert!(tags_compatible(&[], &host));
        assert!(tags_compatible(&[ANY_TAG.to_string()], &host));
    }

    #[test]
    fn tags_need_one_shared_label() {
        let host = vec!["linux".to_string(), "gpu".to_string()];
        assert!(tags_compatible(&["gpu".to_string(), "houdini".to_string()], &host));
        assert!(!tags_compatible(&["houdini".to_string()], &host));
    }

    #[test]
    fn priority_mode_prefers_higher_priority() {
        // j1 is older but lower priority.
        let mut jobs = vec![job(1, 10, 600), job(2, 50, 60)];
        order_jobs(SchedulingMode::Priority, &mut jobs);
        assert_eq!(jobs[0].id, 2);
    }

    #[test]
    fn fifo_mode_prefers_older_jobs() {
        let mut jobs = vec![job(2, 50, 60), job(1, 10, 600)];
        order_jobs(SchedulingMode::Fifo, &mut jobs);
        assert_eq!(jobs[0].id, 1);
    }

    #[test]
    fn priority_ties_break_oldest_first() {
        let mut jobs = vec![job(2, 10, 60), job(1, 10, 600)];
        order_jobs(SchedulingMode::Priority, &mut jobs);
        assert_eq!(jobs[0].id, 1);
    }

    #[test]
    fn ceiling_ignores_unlimited() {
        assert!(!at_core_ceiling(10_000, UNLIMITED_CORES));
        assert!(at_core_ceiling(400, 400));
        assert!(!at_core_ceiling(300, 400));
    }

    #[test]
    fn starved_higher_priority_job_is_detected() {
        let incumbent = job(1, 10, 600);
        let mut starved = job(2, 50, 60);
        starved.min_cores = 200;
        assert!(higher_priority_waiting(SchedulingMode::Priority, &incumbent, &[starved.clone()]));

        starved.int_cores = 200;
        assert!(!higher_priority_waiting(SchedulingMode::Priority, &incumbent, &[starved]));
    }

    #[test]
    fn lower_priority_starved_job_does_not_count() {
        let incumbent = job(1, 50, 60);
        let mut starved = job(2, 10, 600);
        starved.min_cores = 200;
        assert!(!higher_priority_waiting(SchedulingMode::Priority, &incumbent, &[starved.clone()]));
        // Under FIFO the older job does outrank.
        assert!(higher_priority_waiting(SchedulingMode::Fifo, &incumbent, &[starved]));
    }
}
