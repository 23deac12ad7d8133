//! Show, group, job and layer rows: the directory the matcher reads.

use serde::{Deserialize, Serialize};
use spool_core::booking::LayerRequirements;
use spool_core::error::CoreError;
use spool_core::scheduling::JobCandidate;
use spool_core::states::JobState;
use spool_core::types::{DbId, StateId, Timestamp};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

/// A row from the `shows` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Show {
    pub id: DbId,
    pub name: String,
    pub dispatch_enabled: bool,
    pub max_cores: i32,
    pub int_cores: i32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// DTO for creating a show.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateShow {
    pub name: String,
    pub max_cores: Option<i32>,
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// A row from the `groups` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Group {
    pub id: DbId,
    pub show_id: DbId,
    pub name: String,
    pub max_cores: i32,
    pub int_cores: i32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// DTO for creating a group.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateGroup {
    pub show_id: DbId,
    pub name: String,
    pub max_cores: Option<i32>,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A row from the `jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    pub id: DbId,
    pub show_id: DbId,
    pub group_id: DbId,
    pub name: String,
    pub state_id: StateId,
    pub priority: i32,
    pub min_cores: i32,
    pub max_cores: i32,
    pub int_cores: i32,
    pub is_paused: bool,
    pub auto_eat: bool,
    pub max_retries: i32,
    pub started_at: Timestamp,
    pub stopped_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Job {
    pub fn state(&self) -> Result<JobState, CoreError> {
        JobState::from_id(self.state_id)
    }

    /// The scheduling view used by the core ordering functions.
    pub fn candidate(&self) -> JobCandidate {
        JobCandidate {
            id: self.id,
            priority: self.priority,
            started_at: self.started_at,
            int_cores: self.int_cores,
            min_cores: self.min_cores,
            max_cores: self.max_cores,
        }
    }
}

/// DTO for launching a job.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateJob {
    pub show_id: DbId,
    pub group_id: DbId,
    pub name: String,
    pub priority: Option<i32>,
    pub min_cores: Option<i32>,
    pub max_cores: Option<i32>,
    pub auto_eat: Option<bool>,
    pub max_retries: Option<i32>,
    pub is_paused: Option<bool>,
    /// Defaults to `NOW()`. Set explicitly to control FIFO order.
    pub started_at: Option<Timestamp>,
}

// ---------------------------------------------------------------------------
// Layer
// ---------------------------------------------------------------------------

/// A row from the `layers` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Layer {
    pub id: DbId,
    pub job_id: DbId,
    pub name: String,
    pub command: String,
    pub dispatch_order: i32,
    pub min_cores: i32,
    pub min_memory: i64,
    pub min_gpus: i32,
    pub min_gpu_memory: i64,
    pub is_threadable: bool,
    pub checkpoint_enabled: bool,
    pub tags: Vec<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Layer {
    pub fn requirements(&self) -> LayerRequirements {
        LayerRequirements {
            min_cores: self.min_cores,
            min_memory: self.min_memory,
            min_gpus: self.min_gpus,
            min_gpu_memory: self.min_gpu_memory,
            threadable: self.is_threadable,
        }
    }
}

/// DTO for creating a layer.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateLayer {
    pub job_id: DbId,
    pub name: String,
    pub command: Option<String>,
    pub dispatch_order: Option<i32>,
    pub min_cores: Option<i32>,
    pub min_memory: Option<i64>,
    pub min_gpus: Option<i32>,
    pub min_gpu_memory: Option<i64>,
    pub is_threadable: Option<bool>,
    pub checkpoint_enabled: Option<bool>,
    pub tags: Option<Vec<String>>,
}
