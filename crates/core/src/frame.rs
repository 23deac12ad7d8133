//! Frame lifecycle rules: transition table, retry accounting, stop
//! resolution and checkpoint guards.
//!
//! The store applies every transition as a versioned conditional update;
//! these functions decide *which* transition to ask for.

use std::time::Duration;

use crate::error::CoreError;
use crate::states::{CheckpointState, FrameState, JobState};
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Exit statuses
// ---------------------------------------------------------------------------

/// Exit status of a frame that has never run.
pub const EXIT_STATUS_NONE: i32 = -1;

/// Exit status of a successful run.
pub const EXIT_STATUS_SUCCESS: i32 = 0;

/// The host's owner reclaimed the machine and the frame was evicted.
pub const EXIT_STATUS_NIMBY_KILL: i32 = 286;

/// An operator cleared the frame (or retried it).
pub const EXIT_STATUS_FRAME_CLEARED: i32 = 299;

/// The orphan sweep reclaimed the frame after its host vanished.
pub const EXIT_STATUS_FRAME_ORPHAN: i32 = 301;

/// The host went down under the frame.
pub const EXIT_STATUS_DOWN_HOST: i32 = 399;

/// Previous exit statuses that do not count toward the retry limit on the
/// next start. None of them are the frame's own fault.
pub const SKIP_RETRY_EXIT_STATUSES: [i32; 4] = [
    EXIT_STATUS_NIMBY_KILL,
    EXIT_STATUS_FRAME_CLEARED,
    EXIT_STATUS_FRAME_ORPHAN,
    EXIT_STATUS_DOWN_HOST,
];

/// Default staleness window for orphan detection.
pub const DEFAULT_ORPHAN_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// Returns the set of states reachable from `from`.
pub fn valid_transitions(from: FrameState) -> &'static [FrameState] {
    use FrameState::*;
    match from {
        Setup => &[Waiting, Depend],
        Waiting => &[Depend, Running, Dead, Eaten],
        Depend => &[Waiting, Dead, Eaten],
        Running => &[Succeeded, Dead, Eaten, Waiting, Depend, Checkpoint],
        Checkpoint => &[Waiting, Depend, Succeeded, Dead, Eaten],
        // Terminal states only leave through an operator retry.
        Succeeded | Dead | Eaten => &[Waiting, Depend],
    }
}

/// Check whether a transition from `from` to `to` is valid.
pub fn can_transition(from: FrameState, to: FrameState) -> bool {
    valid_transitions(from).contains(&to)
}

/// Validate a transition, returning a `Conflict` error for invalid ones.
pub fn validate_transition(from: FrameState, to: FrameState) -> Result<(), CoreError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(CoreError::Conflict(format!(
            "Invalid frame transition: {from} -> {to}"
        )))
    }
}

/// The state a frame lands in when it is (re)queued: `Depend` while it still
/// has blockers, `Waiting` otherwise.
pub fn requeue_state(depend_count: i32) -> FrameState {
    if depend_count > 0 {
        FrameState::Depend
    } else {
        FrameState::Waiting
    }
}

// ---------------------------------------------------------------------------
// Retries
// ---------------------------------------------------------------------------

/// Whether starting a frame whose last exit status was `previous_exit_status`
/// counts as a retry.
pub fn counts_as_retry(previous_exit_status: i32) -> bool {
    !SKIP_RETRY_EXIT_STATUSES.contains(&previous_exit_status)
}

/// Whether a frame has used up its retries.
pub fn retries_exhausted(retries: i32, max_retries: i32) -> bool {
    retries >= max_retries
}

/// Decide the state a running frame moves to when its process exits.
///
/// - exit 0 → `Succeeded`
/// - any other status → back to the queue (`Waiting`/`Depend`) for another
///   attempt, unless the retry limit is reached, in which case the frame is
///   `Dead` (or `Eaten` for auto-eat jobs) whatever it would have become.
///
/// The limit applies to skip-retry statuses too: a frame evicted on its last
/// counted attempt is `Dead`, and an operator retry gives it a free start.
pub fn resolve_stop_state(
    exit_status: i32,
    retries: i32,
    max_retries: i32,
    depend_count: i32,
    auto_eat: bool,
) -> FrameState {
    if exit_status == EXIT_STATUS_SUCCESS {
        return FrameState::Succeeded;
    }
    if retries_exhausted(retries, max_retries) {
        return if auto_eat {
            FrameState::Eaten
        } else {
            FrameState::Dead
        };
    }
    requeue_state(depend_count)
}

/// Where a stopping frame actually lands given where it is now.
///
/// A frame parked in `Checkpoint` keeps waiting for its checkpoint to
/// complete (which requeues it) unless the stop is final: success, `Dead`
/// or `Eaten`.
pub fn stop_target(current: FrameState, resolved: FrameState) -> FrameState {
    if current == FrameState::Checkpoint && !resolved.is_terminal() {
        FrameState::Checkpoint
    } else {
        resolved
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// A running frame may enter `Checkpoint` only when its layer enabled it.
pub fn can_enter_checkpoint(state: FrameState, checkpoint: CheckpointState) -> bool {
    state == FrameState::Running && checkpoint == CheckpointState::Enabled
}

/// A checkpoint may be completed only from `Copying` or `Enabled`.
pub fn can_complete_checkpoint(checkpoint: CheckpointState) -> bool {
    matches!(
        checkpoint,
        CheckpointState::Copying | CheckpointState::Enabled
    )
}

/// State after a checkpoint completes or is disabled: `Waiting` only if the
/// frame is still parked in `Checkpoint`.
pub fn state_after_checkpoint(current: FrameState) -> FrameState {
    if current == FrameState::Checkpoint {
        FrameState::Waiting
    } else {
        current
    }
}

// ---------------------------------------------------------------------------
// Orphans
// ---------------------------------------------------------------------------

/// A frame is orphaned when it has sat `Running` past `window` with no proc
/// attached while its job is still `Pending`.
pub fn is_orphaned(
    state: FrameState,
    updated_at: Timestamp,
    now: Timestamp,
    attached_procs: i64,
    job_state: JobState,
    window: Duration,
) -> bool {
    let Ok(window) = chrono::Duration::from_std(window) else {
        return false;
    };
    state == FrameState::Running
        && attached_procs == 0
        && job_state == JobState::Pending
        && now.signed_duration_since(updated_at) > window
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    // -- transitions ---------------------------------------------------------

    #[test]
    fn waiting_to_running() {
        assert!(can_transition(FrameState::Waiting, FrameState::Running));
    }

    #[test]
    fn depend_cannot_run() {
        assert!(!can_transition(FrameState::Depend, FrameState::Running));
    }

    #[test]
    fn setup_cannot_skip_to_running() {
        assert!(validate_transition(FrameState::Setup, FrameState::Running).is_err());
    }

    #[test]
    fn checkpoint_returns_to_waiting() {
        assert!(can_transition(FrameState::Checkpoint, FrameState::Waiting));
        assert!(!can_transition(FrameState::Checkpoint, FrameState::Running));
    }

    #[test]
    fn requeue_respects_blockers() {
        assert_eq!(requeue_state(0), FrameState::Waiting);
        assert_eq!(requeue_state(2), FrameState::Depend);
    }

    // -- retries -------------------------------------------------------------

    #[test]
    fn cleared_frames_do_not_count_as_retries() {
        assert!(!counts_as_retry(EXIT_STATUS_FRAME_CLEARED));
        assert!(!counts_as_retry(EXIT_STATUS_NIMBY_KILL));
        assert!(!counts_as_retry(EXIT_STATUS_DOWN_HOST));
        assert!(!counts_as_retry(EXIT_STATUS_FRAME_ORPHAN));
    }

    #[test]
    fn software_failures_count_as_retries() {
        assert!(counts_as_retry(1));
        assert!(counts_as_retry(EXIT_STATUS_NONE));
    }

    #[test]
    fn success_wins_even_at_retry_limit() {
        assert_eq!(resolve_stop_state(0, 3, 3, 0, false), FrameState::Succeeded);
    }

    #[test]
    fn failure_with_retries_left_requeues() {
        assert_eq!(resolve_stop_state(1, 1, 3, 0, false), FrameState::Waiting);
        assert_eq!(resolve_stop_state(1, 1, 3, 1, false), FrameState::Depend);
    }

    #[test]
    fn failure_at_retry_limit_is_dead() {
        assert_eq!(resolve_stop_state(1, 3, 3, 0, false), FrameState::Dead);
    }

    #[test]
    fn retry_limit_overrides_skip_statuses() {
        assert_eq!(
            resolve_stop_state(EXIT_STATUS_DOWN_HOST, 3, 3, 0, false),
            FrameState::Dead
        );
    }

    #[test]
    fn auto_eat_turns_dead_into_eaten() {
        assert_eq!(resolve_stop_state(1, 3, 3, 0, true), FrameState::Eaten);
    }

    #[test]
    fn checkpointing_frame_stays_parked_unless_final() {
        assert_eq!(
            stop_target(FrameState::Checkpoint, FrameState::Waiting),
            FrameState::Checkpoint
        );
        assert_eq!(
            stop_target(FrameState::Checkpoint, FrameState::Depend),
            FrameState::Checkpoint
        );
        assert_eq!(stop_target(FrameState::Checkpoint, FrameState::Dead), FrameState::Dead);
        assert_eq!(stop_target(FrameState::Checkpoint, FrameState::Eaten), FrameState::Eaten);
        assert_eq!(stop_target(FrameState::Running, FrameState::Succeeded), FrameState::Succeeded);
    }

    #[test]
    fn checkpointing_frame_that_succeeds_is_done() {
        assert_eq!(
            stop_target(FrameState::Checkpoint, FrameState::Succeeded),
            FrameState::Succeeded
        );
        assert!(can_transition(FrameState::Checkpoint, FrameState::Succeeded));
    }

    // -- checkpoints ---------------------------------------------------------

    #[test]
    fn checkpoint_completion_requires_copying_or_enabled() {
        assert!(can_complete_checkpoint(CheckpointState::Copying));
        assert!(can_complete_checkpoint(CheckpointState::Enabled));
        assert!(!can_complete_checkpoint(CheckpointState::Disabled));
        assert!(!can_complete_checkpoint(CheckpointState::Complete));
    }

    #[test]
    fn checkpoint_does_not_resurrect_moved_on_frames() {
        assert_eq!(state_after_checkpoint(FrameState::Checkpoint), FrameState::Waiting);
        assert_eq!(state_after_checkpoint(FrameState::Dead), FrameState::Dead);
    }

    #[test]
    fn only_enabled_running_frames_enter_checkpoint() {
        assert!(can_enter_checkpoint(FrameState::Running, CheckpointState::Enabled));
        assert!(!can_enter_checkpoint(FrameState::Running, CheckpointState::Disabled));
        assert!(!can_enter_checkpoint(FrameState::Waiting, CheckpointState::Enabled));
    }

    // -- orphans -------------------------------------------------------------

    #[test]
    fn stale_running_frame_without_proc_is_orphaned() {
        let now = Utc::now();
        let updated = now - chrono::Duration::seconds(301);
        assert!(is_orphaned(
            FrameState::Running,
            updated,
            now,
            0,
            JobState::Pending,
            DEFAULT_ORPHAN_TIMEOUT
        ));
    }

    #[test]
    fn frame_with_proc_is_not_orphaned() {
        let now = Utc::now();
        let updated = now - chrono::Duration::seconds(3600);
        assert!(!is_orphaned(
            FrameState::Running,
            updated,
            now,
            1,
            JobState::Pending,
            DEFAULT_ORPHAN_TIMEOUT
        ));
    }

    #[test]
    fn fresh_frame_is_not_orphaned() {
        let now = Utc::now();
        assert!(!is_orphaned(
            FrameState::Running,
            now - chrono::Duration::seconds(10),
            now,
            0,
            JobState::Pending,
            DEFAULT_ORPHAN_TIMEOUT
        ));
    }

    #[test]
    fn finished_job_frames_are_not_orphans() {
        let now = Utc::now();
        assert!(!is_orphaned(
            FrameState::Running,
            now - chrono::Duration::seconds(3600),
            now,
            0,
            JobState::Finished,
            DEFAULT_ORPHAN_TIMEOUT
        ));
    }
}
