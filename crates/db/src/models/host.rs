//! Host rows and the capacity report a render node sends.

use serde::{Deserialize, Serialize};
use spool_core::error::CoreError;
use spool_core::resources::ResourceSlice;
use spool_core::states::{HardwareState, LockState};
use spool_core::types::{DbId, StateId, Timestamp};
use sqlx::FromRow;

/// A row from the `hosts` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Host {
    pub id: DbId,
    pub name: String,
    pub total_cores: i32,
    pub idle_cores: i32,
    pub total_memory: i64,
    pub idle_memory: i64,
    pub total_gpus: i32,
    pub idle_gpus: i32,
    pub total_gpu_memory: i64,
    pub idle_gpu_memory: i64,
    pub tags: Vec<String>,
    pub lock_state_id: StateId,
    pub hardware_state_id: StateId,
    pub last_ping_at: Option<Timestamp>,
    pub decommissioned_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Host {
    pub fn total(&self) -> ResourceSlice {
        ResourceSlice::new(
            self.total_cores,
            self.total_memory,
            self.total_gpus,
            self.total_gpu_memory,
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

    pub fn lock_state(&self) -> Result<LockState, CoreError> {
        LockState::from_id(self.lock_state_id)
    }

    pub fn hardware_state(&self) -> Result<HardwareState, CoreError> {
        HardwareState::from_id(self.hardware_state_id)
    }

    /// Open, up and not decommissioned.
    pub fn is_bookable(&self) -> bool {
        self.decommissioned_at.is_none()
            && matches!(self.lock_state(), Ok(LockState::Open))
            && matches!(self.hardware_state(), Ok(HardwareState::Up))
    }
}

/// Memory usage of one running frame, as measured on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameUsage {
    pub frame_id: DbId,
    /// Current resident memory, KB.
    pub used_memory: i64,
}

/// Heartbeat from a render node: total capacity, tags, hardware state and the
/// memory use of whatever it is running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostReport {
    pub name: String,
    pub total: ResourceSlice,
    pub tags: Vec<String>,
    pub hardware_state: HardwareState,
    #[serde(default)]
    pub running: Vec<FrameUsage>,
}
