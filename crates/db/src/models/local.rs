//! Local host assignments: sticky pools of one host's capacity pinned to a
//! job, layer or frame.

use serde::{Deserialize, Serialize};
use spool_core::error::CoreError;
use spool_core::resources::ResourceSlice;
use spool_core::states::PartitionKind;
use spool_core::types::{DbId, StateId, Timestamp};
use sqlx::FromRow;

/// A row from the `host_local` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LocalAssignment {
    pub id: DbId,
    pub host_id: DbId,
    pub kind_id: StateId,
    pub job_id: DbId,
    pub layer_id: Option<DbId>,
    pub frame_id: Option<DbId>,
    pub max_cores: i32,
    pub idle_cores: i32,
    pub max_memory: i64,
    pub idle_memory: i64,
    pub max_gpus: i32,
    pub idle_gpus: i32,
    pub max_gpu_memory: i64,
    pub idle_gpu_memory: i64,
    pub threads: i32,
    pub is_active: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl LocalAssignment {
    pub fn kind(&self) -> Result<PartitionKind, CoreError> {
        PartitionKind::from_id(self.kind_id)
    }

    pub fn max(&self) -> ResourceSlice {
        ResourceSlice::new(
            self.max_cores,
            self.max_memory,
            self.max_gpus,
            self.max_gpu_memory,
        )
    }

    pub fn idle(&self) -> ResourceSlice {
        ResourceSlice::new(
            self.idle_cores,
            self.idle_memory,
            self.idle_gpus,
            self.idle_gpu_memory,
        )
    }
}

/// DTO for pinning part of a host to a job, layer or frame.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateLocalAssignment {
    pub host_id: DbId,
    pub kind: PartitionKind,
    pub job_id: DbId,
    pub layer_id: Option<DbId>,
    pub frame_id: Option<DbId>,
    pub max: ResourceSlice,
    pub threads: Option<i32>,
}

/// Result of resizing a pin. Committed capacity above the new max is
/// reported per dimension, never silently reclaimed.
#[derive(Debug, Clone, Serialize)]
pub struct LocalResize {
    pub assignment: LocalAssignment,
    pub oversubscribed: ResourceSlice,
}
