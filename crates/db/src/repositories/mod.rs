//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods. Methods
//! that run a single statement accept any `PgExecutor` (a pool, a connection
//! or `&mut *tx`); methods that run several statements take a
//! `&mut PgConnection` so the caller decides the transaction boundary.
//!
//! Conditional updates report success through their return value (`bool` or
//! `Option<Row>`) and never error on zero affected rows.

pub mod depend_repo;
pub mod dispatch_repo;
pub mod frame_repo;
pub mod group_repo;
pub mod host_repo;
pub mod job_repo;
pub mod layer_repo;
pub mod local_repo;
pub mod proc_repo;
pub mod show_repo;

pub use depend_repo::DependRepo;
pub use dispatch_repo::{DispatchRepo, JobScope};
pub use frame_repo::FrameRepo;
pub use group_repo::GroupRepo;
pub use host_repo::HostRepo;
pub use job_repo::JobRepo;
pub use layer_repo::LayerRepo;
pub use local_repo::LocalAssignmentRepo;
pub use proc_repo::ProcRepo;
pub use show_repo::ShowRepo;

use spool_core::states::FrameState;
use spool_core::types::StateId;

/// Map frame states to the SMALLINT array bound for `= ANY($n)` clauses.
pub(crate) fn state_ids(states: &[FrameState]) -> Vec<StateId> {
    states.iter().map(|s| s.id()).collect()
}
