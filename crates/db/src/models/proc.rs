//! Virtual procs: the binding between a host slice and one running frame.

use serde::Serialize;
use spool_core::booking::ProcMemory;
use spool_core::resources::ResourceSlice;
use spool_core::types::{DbId, Timestamp};
use sqlx::FromRow;

/// A row from the `procs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Proc {
    pub id: DbId,
    pub host_id: DbId,
    pub frame_id: DbId,
    pub layer_id: DbId,
    pub job_id: DbId,
    pub host_local_id: Option<DbId>,
    pub reserved_cores: i32,
    pub reserved_memory: i64,
    pub reserved_gpus: i32,
    pub reserved_gpu_memory: i64,
    pub threads: i32,
    pub used_memory: i64,
    pub max_used_memory: i64,
    pub is_local_dispatch: bool,
    pub is_unbooked: bool,
    pub booked_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Proc {
    pub fn reservation(&self) -> ResourceSlice {
        ResourceSlice::new(
            self.reserved_cores,
            self.reserved_memory,
            self.reserved_gpus,
            self.reserved_gpu_memory,
        )
    }

    pub fn memory(&self) -> ProcMemory {
        ProcMemory {
            proc_id: self.id,
            reserved: self.reserved_memory,
            used: self.used_memory,
        }
    }
}

/// An unsaved proc: everything needed to book one frame onto one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualProc {
    pub host_id: DbId,
    pub host_name: String,
    pub frame_id: DbId,
    /// Frame version read by the matcher; the start transition is keyed on it.
    pub frame_version: i32,
    pub layer_id: DbId,
    pub job_id: DbId,
    pub host_local_id: Option<DbId>,
    pub slice: ResourceSlice,
    pub threads: i32,
    pub is_local_dispatch: bool,
    /// Arms checkpointing on the frame at start.
    pub checkpoint_enabled: bool,
}

impl VirtualProc {
    /// `"host/cores/memory/gpus"`, recorded on the frame at start.
    pub fn resource_label(&self) -> String {
        format!(
            "{}/{:.2}/{}/{}",
            self.host_name,
            self.slice.cores as f64 / spool_core::resources::CORE_UNITS_PER_CORE as f64,
            self.slice.memory,
            self.slice.gpus
        )
    }
}
