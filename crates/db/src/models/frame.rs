//! Frame rows and the dispatch view joining a frame with its layer.

use serde::{Deserialize, Serialize};
use spool_core::booking::LayerRequirements;
use spool_core::depend::FrameRef;
use spool_core::error::CoreError;
use spool_core::resources::ResourceSlice;
use spool_core::states::{CheckpointState, FrameState};
use spool_core::types::{DbId, StateId, Timestamp};
use sqlx::FromRow;

/// A row from the `frames` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Frame {
    pub id: DbId,
    pub layer_id: DbId,
    pub job_id: DbId,
    pub number: i32,
    pub dispatch_order: i32,
    pub state_id: StateId,
    pub exit_status: i32,
    pub retries: i32,
    pub depend_count: i32,
    pub version: i32,
    pub host_id: Option<DbId>,
    pub last_resource: Option<String>,
    pub reserved_cores: i32,
    pub reserved_memory: i64,
    pub reserved_gpus: i32,
    pub reserved_gpu_memory: i64,
    pub max_rss: i64,
    pub total_core_time: i64,
    pub checkpoint_state_id: StateId,
    pub checkpoint_count: i32,
    pub started_at: Option<Timestamp>,
    pub stopped_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Frame {
    pub fn state(&self) -> Result<FrameState, CoreError> {
        FrameState::from_id(self.state_id)
    }

    pub fn checkpoint_state(&self) -> Result<CheckpointState, CoreError> {
        CheckpointState::from_id(self.checkpoint_state_id)
    }

    /// The slice recorded at start.
    pub fn reservation(&self) -> ResourceSlice {
        ResourceSlice::new(
            self.reserved_cores,
            self.reserved_memory,
            self.reserved_gpus,
            self.reserved_gpu_memory,
        )
    }

    pub fn frame_ref(&self) -> FrameRef {
        FrameRef {
            id: self.id,
            number: self.number,
        }
    }
}

/// DTO for inserting the frames of a layer over an inclusive number range.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateFrameRange {
    pub layer_id: DbId,
    pub start: i32,
    pub end: i32,
    pub step: Option<i32>,
}

/// A dispatchable frame together with the layer fields the booking path needs.
///
/// Returned by the matcher queries; never written back.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DispatchFrame {
    pub id: DbId,
    pub layer_id: DbId,
    pub job_id: DbId,
    pub group_id: DbId,
    pub show_id: DbId,
    pub number: i32,
    pub version: i32,
    pub dispatch_order: i32,
    pub layer_dispatch_order: i32,
    pub exit_status: i32,
    pub layer_name: String,
    pub min_cores: i32,
    pub min_memory: i64,
    pub min_gpus: i32,
    pub min_gpu_memory: i64,
    pub is_threadable: bool,
    pub checkpoint_enabled: bool,
    pub tags: Vec<String>,
}

impl DispatchFrame {
    pub fn requirements(&self) -> LayerRequirements {
        LayerRequirements {
            min_cores: self.min_cores,
            min_memory: self.min_memory,
            min_gpus: self.min_gpus,
            min_gpu_memory: self.min_gpu_memory,
            threadable: self.is_threadable,
        }
    }

    /// `"<layer>/<number>"`, as shown in host and proc logs.
    pub fn label(&self) -> String {
        format!("{}/{:04}", self.layer_name, self.number)
    }
}
