//! Integration tests for the host and pinned-pool side of the ledger:
//! - Host upsert from reports (totals clamped to what procs hold)
//! - Conditional reserve / release
//! - Pinned pool creation and resize
//! - Core ceiling charges

use spool_core::resources::ResourceSlice;
use spool_core::states::{HardwareState, PartitionKind};
use spool_db::models::directory::{CreateGroup, CreateJob, CreateShow};
use spool_db::models::host::HostReport;
use spool_db::models::local::CreateLocalAssignment;
use spool_db::repositories::{GroupRepo, HostRepo, JobRepo, LocalAssignmentRepo, ShowRepo};
use sqlx::PgPool;

const GB: i64 = 1024 * 1024;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn report(name: &str, cores: i32, memory: i64) -> HostReport {
    HostReport {
        name: name.to_string(),
        total: ResourceSlice::new(cores, memory, 0, 0),
        tags: vec!["linux".to_string()],
        hardware_state: HardwareState::Up,
        running: vec![],
    }
}

async fn seed_job(pool: &PgPool) -> i64 {
    let show = ShowRepo::create(
        pool,
        &CreateShow {
            name: "ledger".to_string(),
            max_cores: None,
        },
    )
    .await
    .unwrap();
    let group = GroupRepo::create(
        pool,
        &CreateGroup {
            show_id: show.id,
            name: "lighting".to_string(),
            max_cores: None,
        },
    )
    .await
    .unwrap();
    JobRepo::create(
        pool,
        &CreateJob {
            show_id: show.id,
            group_id: group.id,
            name: "ledger-job".to_string(),
            priority: None,
            min_cores: None,
            max_cores: None,
            auto_eat: None,
            max_retries: None,
            is_paused: None,
            started_at: None,
        },
    )
    .await
    .unwrap()
    .id
}

// ---------------------------------------------------------------------------
// Test: Host upsert
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_first_report_creates_idle_host(pool: PgPool) {
    let host = HostRepo::upsert_from_report(&pool, &report("r01", 800, 32 * GB))
        .await
        .unwrap();
    assert_eq!(host.total(), ResourceSlice::new(800, 32 * GB, 0, 0));
    assert_eq!(host.idle(), host.total());
    assert!(host.is_bookable());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_report_shifts_idle_by_delta_of_totals(pool: PgPool) {
    let host = HostRepo::upsert_from_report(&pool, &report("r02", 800, 32 * GB))
        .await
        .unwrap();
    assert!(HostRepo::reserve(&pool, host.id, &ResourceSlice::new(200, 4 * GB, 0, 0))
        .await
        .unwrap());

    let host = HostRepo::upsert_from_report(&pool, &report("r02", 1600, 64 * GB))
        .await
        .unwrap();
    assert_eq!(host.idle_cores, 1400);
    assert_eq!(host.idle_memory, 60 * GB);
}

// ---------------------------------------------------------------------------
// Test: Conditional reserve / release
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_reserve_refuses_when_any_dimension_is_short(pool: PgPool) {
    let host = HostRepo::upsert_from_report(&pool, &report("r03", 400, 4 * GB))
        .await
        .unwrap();

    let too_much_memory = ResourceSlice::new(100, 8 * GB, 0, 0);
    assert!(!HostRepo::reserve(&pool, host.id, &too_much_memory).await.unwrap());

    let host = HostRepo::find_by_id(&pool, host.id).await.unwrap().unwrap();
    assert_eq!(host.idle(), host.total());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_release_never_exceeds_total(pool: PgPool) {
    let host = HostRepo::upsert_from_report(&pool, &report("r04", 400, 4 * GB))
        .await
        .unwrap();
    let slice = ResourceSlice::new(100, GB, 0, 0);

    assert!(HostRepo::reserve(&pool, host.id, &slice).await.unwrap());
    assert!(HostRepo::release(&pool, host.id, &slice).await.unwrap());
    assert!(!HostRepo::release(&pool, host.id, &slice).await.unwrap());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_concurrent_reserves_cannot_both_take_the_last_core(pool: PgPool) {
    let host = HostRepo::upsert_from_report(&pool, &report("r05", 100, 4 * GB))
        .await
        .unwrap();
    let slice = ResourceSlice::new(100, GB, 0, 0);

    let (a, b) = tokio::join!(
        HostRepo::reserve(&pool, host.id, &slice),
        HostRepo::reserve(&pool, host.id, &slice),
    );
    assert!(a.unwrap() ^ b.unwrap());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_decommissioned_host_is_not_bookable(pool: PgPool) {
    let host = HostRepo::upsert_from_report(&pool, &report("r06", 400, 4 * GB))
        .await
        .unwrap();
    assert!(HostRepo::decommission(&pool, host.id).await.unwrap());
    assert!(!HostRepo::decommission(&pool, host.id).await.unwrap());

    let host = HostRepo::find_by_id(&pool, host.id).await.unwrap().unwrap();
    assert!(!host.is_bookable());
}

// ---------------------------------------------------------------------------
// Test: Pinned pools
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_pin_larger_than_host_is_refused(pool: PgPool) {
    let host = HostRepo::upsert_from_report(&pool, &report("r07", 400, 4 * GB))
        .await
        .unwrap();
    let job_id = seed_job(&pool).await;

    let pin = LocalAssignmentRepo::create(
        &pool,
        &CreateLocalAssignment {
            host_id: host.id,
            kind: PartitionKind::JobPartition,
            job_id,
            layer_id: None,
            frame_id: None,
            max: ResourceSlice::new(800, GB, 0, 0),
            threads: None,
        },
    )
    .await
    .unwrap();
    assert!(pin.is_none());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_pin_resize_moves_idle_by_delta_and_reports_excess(pool: PgPool) {
    let host = HostRepo::upsert_from_report(&pool, &report("r08", 800, 16 * GB))
        .await
        .unwrap();
    let job_id = seed_job(&pool).await;
    let pin = LocalAssignmentRepo::create(
        &pool,
        &CreateLocalAssignment {
            host_id: host.id,
            kind: PartitionKind::JobPartition,
            job_id,
            layer_id: None,
            frame_id: None,
            max: ResourceSlice::new(400, 8 * GB, 0, 0),
            threads: Some(4),
        },
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(pin.idle(), pin.max());

    // 300 cores committed inside the pin.
    assert!(LocalAssignmentRepo::reserve(&pool, pin.id, &ResourceSlice::new(300, 2 * GB, 0, 0))
        .await
        .unwrap());

    let grown = LocalAssignmentRepo::resize(&pool, pin.id, &ResourceSlice::new(600, 8 * GB, 0, 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(grown.assignment.idle_cores, 300);
    assert!(grown.oversubscribed.is_zero());

    let shrunk = LocalAssignmentRepo::resize(&pool, pin.id, &ResourceSlice::new(200, 8 * GB, 0, 0))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(shrunk.assignment.max_cores, 200);
    assert_eq!(shrunk.assignment.idle_cores, 0);
    assert_eq!(shrunk.oversubscribed.cores, 100);
}

// ---------------------------------------------------------------------------
// Test: Core ceilings
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_charge_stops_at_the_tightest_ceiling(pool: PgPool) {
    let job_id = seed_job(&pool).await;
    let job = JobRepo::find_by_id(&pool, job_id).await.unwrap().unwrap();
    assert_eq!(JobRepo::core_headroom(&pool, job_id).await.unwrap(), None);

    GroupRepo::set_max_cores(&pool, job.group_id, 300).await.unwrap();
    assert_eq!(JobRepo::core_headroom(&pool, job_id).await.unwrap(), Some(300));

    assert!(JobRepo::charge_running_cores(&pool, job_id, 200).await.unwrap());
    assert_eq!(JobRepo::core_headroom(&pool, job_id).await.unwrap(), Some(100));

    // Would land on 400 in the group: nothing is charged anywhere.
    assert!(!JobRepo::charge_running_cores(&pool, job_id, 200).await.unwrap());
    let job = JobRepo::find_by_id(&pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.int_cores, 200);
    let group = GroupRepo::find_by_id(&pool, job.group_id).await.unwrap().unwrap();
    assert_eq!(group.int_cores, 200);

    assert!(JobRepo::charge_running_cores(&pool, job_id, 100).await.unwrap());
    assert_eq!(JobRepo::core_headroom(&pool, job_id).await.unwrap(), Some(0));
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_concurrent_charges_cannot_both_fit_under_the_ceiling(pool: PgPool) {
    let job_id = seed_job(&pool).await;
    let job = JobRepo::find_by_id(&pool, job_id).await.unwrap().unwrap();
    ShowRepo::set_max_cores(&pool, job.show_id, 100).await.unwrap();

    let (a, b) = tokio::join!(
        JobRepo::charge_running_cores(&pool, job_id, 100),
        JobRepo::charge_running_cores(&pool, job_id, 100),
    );
    assert!(a.unwrap() ^ b.unwrap());
    let job = JobRepo::find_by_id(&pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.int_cores, 100);
}
