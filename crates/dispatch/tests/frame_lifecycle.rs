//! Frame transitions after booking: stop, retry, eat, checkpoints and
//! orphan recovery.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use common::{layer, report, Farm, GB};
use spool_core::error::CoreError;
use spool_core::frame::{EXIT_STATUS_FRAME_CLEARED, EXIT_STATUS_FRAME_ORPHAN};
use spool_core::states::{CheckpointState, FrameState, JobState};
use spool_db::models::directory::{CreateJob, CreateLayer};
use spool_db::repositories::{HostRepo, ProcRepo};
use spool_dispatch::{orphan, DispatchError, ResourceLedger};
use spool_events::bus::{FRAME_STOPPED, JOB_FINISHED, PROC_RELEASED};
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// Test: Stop
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_successful_stop_releases_proc_and_finishes_job(pool: PgPool) {
    let farm = Farm::new(pool).await;
    let (job, layer) = farm.simple_job(farm.job("ok"), 2).await;
    let procs = farm.reports.handle_report(&report("node01", 800, 16 * GB)).await.unwrap();
    assert_eq!(procs.len(), 2);
    let mut events = farm.bus.subscribe();

    let first = farm.frames.stop(procs[0].frame_id, 0, 2 * GB).await.unwrap();
    assert_eq!(first.state().unwrap(), FrameState::Succeeded);
    assert_eq!(first.max_rss, 2 * GB);
    assert!(!farm.frames.is_job_complete(job.id).await.unwrap());

    farm.frames.stop(procs[1].frame_id, 0, GB).await.unwrap();
    assert!(farm.frames.is_job_complete(job.id).await.unwrap());
    assert!(farm.frames.is_layer_complete(layer.id).await.unwrap());
    assert_eq!(farm.job_row(job.id).await.state().unwrap(), JobState::Finished);
    assert_eq!(farm.job_row(job.id).await.int_cores, 0);

    let host = HostRepo::find_by_name(&farm.pool, "node01").await.unwrap().unwrap();
    assert_eq!(host.idle(), host.total());
    assert!(ResourceLedger::audit(&farm.pool, host.id).await.unwrap().conserved);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event_type);
    }
    assert_eq!(seen.iter().filter(|t| *t == FRAME_STOPPED).count(), 2);
    assert_eq!(seen.iter().filter(|t| *t == PROC_RELEASED).count(), 2);
    assert_eq!(seen.iter().filter(|t| *t == JOB_FINISHED).count(), 1);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_failed_stop_requeues_until_retries_run_out(pool: PgPool) {
    let farm = Farm::new(pool).await;
    let (job, layer) = farm
        .simple_job(
            CreateJob {
                max_retries: Some(2),
                ..farm.job("flaky")
            },
            1,
        )
        .await;
    let frame_id = farm.frames_of(&layer).await[0].id;

    farm.reports.handle_report(&report("node02", 800, 16 * GB)).await.unwrap();
    let requeued = farm.frames.stop(frame_id, 1, 0).await.unwrap();
    assert_eq!(requeued.state().unwrap(), FrameState::Waiting);
    assert_eq!(requeued.retries, 1);

    farm.reports.handle_report(&report("node02", 800, 16 * GB)).await.unwrap();
    let dead = farm.frames.stop(frame_id, 1, 0).await.unwrap();
    assert_eq!(dead.state().unwrap(), FrameState::Dead);
    assert_eq!(dead.retries, 2);

    // Dead frames still let the job finish.
    assert_eq!(farm.job_row(job.id).await.state().unwrap(), JobState::Finished);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_auto_eat_job_eats_exhausted_frames(pool: PgPool) {
    let farm = Farm::new(pool).await;
    let (_, layer) = farm
        .simple_job(
            CreateJob {
                max_retries: Some(1),
                auto_eat: Some(true),
                ..farm.job("eater")
            },
            1,
        )
        .await;
    let frame_id = farm.frames_of(&layer).await[0].id;

    farm.reports.handle_report(&report("node03", 800, 16 * GB)).await.unwrap();
    let eaten = farm.frames.stop(frame_id, 137, 0).await.unwrap();
    assert_eq!(eaten.state().unwrap(), FrameState::Eaten);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_success_on_last_retry_still_succeeds(pool: PgPool) {
    let farm = Farm::new(pool).await;
    let (_, layer) = farm
        .simple_job(
            CreateJob {
                max_retries: Some(1),
                ..farm.job("lastchance")
            },
            1,
        )
        .await;
    let frame_id = farm.frames_of(&layer).await[0].id;

    farm.reports.handle_report(&report("node04", 800, 16 * GB)).await.unwrap();
    let done = farm.frames.stop(frame_id, 0, 0).await.unwrap();
    assert_eq!(done.state().unwrap(), FrameState::Succeeded);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_stopping_a_frame_that_is_not_running_is_a_conflict(pool: PgPool) {
    let farm = Farm::new(pool).await;
    let (_, layer) = farm.simple_job(farm.job("idle"), 1).await;
    let frame_id = farm.frames_of(&layer).await[0].id;

    let err = farm.frames.stop(frame_id, 0, 0).await.unwrap_err();
    assert_matches!(err, DispatchError::Core(CoreError::Conflict(_)));

    let err = farm.frames.stop(i64::MAX, 0, 0).await.unwrap_err();
    assert_matches!(err, DispatchError::NotFound { entity: "Frame", .. });
}

// ---------------------------------------------------------------------------
// Test: Retry and eat
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_retry_reopens_finished_job_without_spending_a_retry(pool: PgPool) {
    let farm = Farm::new(pool).await;
    let (job, layer) = farm.simple_job(farm.job("again"), 1).await;
    let frame_id = farm.frames_of(&layer).await[0].id;
    farm.reports.handle_report(&report("node05", 800, 16 * GB)).await.unwrap();
    let done = farm.frames.stop(frame_id, 0, 0).await.unwrap();
    assert_eq!(farm.job_row(job.id).await.state().unwrap(), JobState::Finished);

    let retried = farm.frames.retry(frame_id, done.version).await.unwrap();
    assert_eq!(retried.state().unwrap(), FrameState::Waiting);
    assert_eq!(retried.exit_status, EXIT_STATUS_FRAME_CLEARED);
    assert_eq!(farm.job_row(job.id).await.state().unwrap(), JobState::Pending);

    farm.reports.handle_report(&report("node05", 800, 16 * GB)).await.unwrap();
    assert_eq!(farm.frame(frame_id).await.retries, 1);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_retry_rejects_running_and_stale_frames(pool: PgPool) {
    let farm = Farm::new(pool).await;
    let (_, layer) = farm.simple_job(farm.job("busy"), 1).await;
    let frame_id = farm.frames_of(&layer).await[0].id;
    farm.reports.handle_report(&report("node06", 800, 16 * GB)).await.unwrap();
    let running = farm.frame(frame_id).await;

    let err = farm.frames.retry(frame_id, running.version).await.unwrap_err();
    assert_matches!(err, DispatchError::Core(CoreError::Conflict(_)));

    let err = farm.frames.retry(frame_id, running.version - 1).await.unwrap_err();
    assert_matches!(err, DispatchError::StaleVersion { .. });
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_eating_the_last_frame_finishes_the_job(pool: PgPool) {
    let farm = Farm::new(pool).await;
    let (job, layer) = farm.simple_job(farm.job("skip"), 1).await;
    let frame = farm.frames_of(&layer).await.remove(0);

    let eaten = farm.frames.eat(frame.id, frame.version).await.unwrap();
    assert_eq!(eaten.state().unwrap(), FrameState::Eaten);
    assert_eq!(farm.job_row(job.id).await.state().unwrap(), JobState::Finished);

    let err = farm.frames.eat(frame.id, eaten.version).await.unwrap_err();
    assert_matches!(err, DispatchError::Core(CoreError::Conflict(_)));
}

// ---------------------------------------------------------------------------
// Test: Checkpoints
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_checkpoint_round_trip(pool: PgPool) {
    let farm = Farm::new(pool).await;
    let job = farm.create_job(farm.job("ckpt")).await;
    farm.add_layer_with(
            CreateLayer {
                checkpoint_enabled: Some(true),
                ..layer(job.id, "sim")
            },
            1,
        )
        .await;
    farm.frames.activate_job(job.id).await.unwrap();
    let procs = farm.reports.handle_report(&report("node07", 800, 16 * GB)).await.unwrap();
    let frame_id = procs[0].frame_id;

    let running = farm.frame(frame_id).await;
    assert_eq!(running.checkpoint_state().unwrap(), CheckpointState::Enabled);

    let parked = farm.frames.enter_checkpoint(frame_id, running.version).await.unwrap();
    assert_eq!(parked.state().unwrap(), FrameState::Checkpoint);
    assert_eq!(parked.checkpoint_state().unwrap(), CheckpointState::Copying);

    // The process exits while copying: the proc goes, the frame stays parked.
    let stopped = farm.frames.stop(frame_id, 1, 0).await.unwrap();
    assert_eq!(stopped.state().unwrap(), FrameState::Checkpoint);
    assert!(ProcRepo::find_by_frame(&farm.pool, frame_id).await.unwrap().is_none());

    let resumed = farm.frames.complete_checkpoint(frame_id, stopped.version).await.unwrap();
    assert_eq!(resumed.state().unwrap(), FrameState::Waiting);
    assert_eq!(resumed.checkpoint_state().unwrap(), CheckpointState::Complete);
    assert_eq!(resumed.checkpoint_count, 1);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_frame_that_succeeds_while_checkpointing_is_done(pool: PgPool) {
    let farm = Farm::new(pool).await;
    let job = farm.create_job(farm.job("ckpt_ok")).await;
    farm.add_layer_with(
        CreateLayer {
            checkpoint_enabled: Some(true),
            ..layer(job.id, "sim")
        },
        1,
    )
    .await;
    farm.frames.activate_job(job.id).await.unwrap();
    let procs = farm.reports.handle_report(&report("node10", 800, 16 * GB)).await.unwrap();
    let frame_id = procs[0].frame_id;
    let running = farm.frame(frame_id).await;
    farm.frames.enter_checkpoint(frame_id, running.version).await.unwrap();

    let done = farm.frames.stop(frame_id, 0, GB).await.unwrap();
    assert_eq!(done.state().unwrap(), FrameState::Succeeded);
    assert!(ProcRepo::find_by_frame(&farm.pool, frame_id).await.unwrap().is_none());
    assert_eq!(farm.job_row(job.id).await.state().unwrap(), JobState::Finished);

    // A late copy notice must not bring the frame back.
    let _ = farm.frames.complete_checkpoint(frame_id, done.version).await;
    assert_eq!(farm.frame(frame_id).await.state().unwrap(), FrameState::Succeeded);
    let procs = farm.reports.handle_report(&report("node10", 800, 16 * GB)).await.unwrap();
    assert!(procs.is_empty());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_checkpoint_completed_while_running_frees_the_proc(pool: PgPool) {
    let farm = Farm::new(pool).await;
    let job = farm.create_job(farm.job("ckpt_live")).await;
    farm.add_layer_with(
        CreateLayer {
            checkpoint_enabled: Some(true),
            ..layer(job.id, "sim")
        },
        1,
    )
    .await;
    farm.frames.activate_job(job.id).await.unwrap();
    let procs = farm.reports.handle_report(&report("node11", 800, 16 * GB)).await.unwrap();
    let frame_id = procs[0].frame_id;
    let running = farm.frame(frame_id).await;
    let parked = farm.frames.enter_checkpoint(frame_id, running.version).await.unwrap();
    let mut events = farm.bus.subscribe();

    // The copy lands before the process reports its exit.
    let requeued = farm.frames.complete_checkpoint(frame_id, parked.version).await.unwrap();
    assert_eq!(requeued.state().unwrap(), FrameState::Waiting);
    assert_eq!(requeued.checkpoint_count, 1);
    assert!(ProcRepo::find_by_frame(&farm.pool, frame_id).await.unwrap().is_none());
    assert_eq!(farm.job_row(job.id).await.int_cores, 0);
    let host = HostRepo::find_by_name(&farm.pool, "node11").await.unwrap().unwrap();
    assert_eq!(host.idle(), host.total());
    assert!(ResourceLedger::audit(&farm.pool, host.id).await.unwrap().conserved);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event_type);
    }
    assert!(seen.iter().any(|t| t == PROC_RELEASED));

    // The exit that follows no longer owns the frame.
    let err = farm.frames.stop(frame_id, 0, 0).await.unwrap_err();
    assert_matches!(err, DispatchError::Core(CoreError::Conflict(_)));

    let rebooked = farm.reports.handle_report(&report("node11", 800, 16 * GB)).await.unwrap();
    assert_eq!(rebooked.len(), 1);
    assert_eq!(rebooked[0].frame_id, frame_id);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_checkpoint_needs_an_enabled_layer(pool: PgPool) {
    let farm = Farm::new(pool).await;
    farm.simple_job(farm.job("plain"), 1).await;
    let procs = farm.reports.handle_report(&report("node08", 800, 16 * GB)).await.unwrap();
    let running = farm.frame(procs[0].frame_id).await;
    assert_eq!(running.checkpoint_state().unwrap(), CheckpointState::Disabled);

    let err = farm
        .frames
        .enter_checkpoint(running.id, running.version)
        .await
        .unwrap_err();
    assert_matches!(err, DispatchError::Core(CoreError::Conflict(_)));

    let err = farm
        .frames
        .disable_checkpoint(running.id, running.version)
        .await
        .unwrap_err();
    assert_matches!(err, DispatchError::Core(CoreError::Conflict(_)));
}

// ---------------------------------------------------------------------------
// Test: Orphans
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_sweep_requeues_running_frames_that_lost_their_proc(pool: PgPool) {
    let farm = Farm::new(pool).await;
    let (_, layer) = farm.simple_job(farm.job("lost"), 2).await;
    let procs = farm.reports.handle_report(&report("node09", 800, 16 * GB)).await.unwrap();
    let lost = procs[0].frame_id;

    // The host vanished and its proc row went with it.
    sqlx::query("DELETE FROM procs WHERE frame_id = $1")
        .bind(lost)
        .execute(&farm.pool)
        .await
        .unwrap();

    let cleared = orphan::sweep_once(&farm.pool, &farm.frames, Duration::ZERO, 10)
        .await
        .unwrap();
    assert_eq!(cleared, 1);

    let frame = farm.frame(lost).await;
    assert_eq!(frame.state().unwrap(), FrameState::Waiting);
    assert_eq!(frame.exit_status, EXIT_STATUS_FRAME_ORPHAN);

    // The other frame kept its proc and is left alone.
    let others: Vec<_> = farm
        .frames_of(&layer)
        .await
        .into_iter()
        .filter(|f| f.id != lost)
        .collect();
    assert_eq!(others[0].state().unwrap(), FrameState::Running);

    // Re-running an orphan does not count against its retries.
    farm.reports.handle_report(&report("node09", 800, 16 * GB)).await.unwrap();
    assert_eq!(farm.frame(lost).await.retries, 1);

    let nothing = orphan::sweep_once(&farm.pool, &farm.frames, Duration::ZERO, 10)
        .await
        .unwrap();
    assert_eq!(nothing, 0);
}
