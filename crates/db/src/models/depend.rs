//! Dependency edge rows.

use serde::Serialize;
use spool_core::depend::DependScope;
use spool_core::error::CoreError;
use spool_core::states::{DependTarget, DependType};
use spool_core::types::{DbId, StateId, Timestamp};
use sqlx::FromRow;

use spool_core::depend::ScopeLevel;

/// A row from the `depends` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Depend {
    pub id: DbId,
    pub type_id: StateId,
    pub target_id: StateId,
    pub any_frame: bool,
    pub is_active: bool,
    pub is_composite: bool,
    pub parent_id: Option<DbId>,
    pub signature: String,
    pub er_job_id: DbId,
    pub er_layer_id: Option<DbId>,
    pub er_frame_id: Option<DbId>,
    pub on_job_id: DbId,
    pub on_layer_id: Option<DbId>,
    pub on_frame_id: Option<DbId>,
    pub created_at: Timestamp,
    pub satisfied_at: Option<Timestamp>,
}

impl Depend {
    pub fn kind(&self) -> Result<DependType, CoreError> {
        DependType::from_id(self.type_id)
    }

    pub fn target(&self) -> Result<DependTarget, CoreError> {
        DependTarget::from_id(self.target_id)
    }

    /// The blocked side, at the level its type names.
    pub fn er_scope(&self) -> Result<DependScope, CoreError> {
        let level = self.kind()?.er_level();
        self.scope_at(level, self.er_job_id, self.er_layer_id, self.er_frame_id)
    }

    /// The upstream side, at the level its type names.
    pub fn on_scope(&self) -> Result<DependScope, CoreError> {
        let level = self.kind()?.on_level();
        self.scope_at(level, self.on_job_id, self.on_layer_id, self.on_frame_id)
    }

    fn scope_at(
        &self,
        level: ScopeLevel,
        job_id: DbId,
        layer_id: Option<DbId>,
        frame_id: Option<DbId>,
    ) -> Result<DependScope, CoreError> {
        let missing = |what: &str| {
            CoreError::Internal(format!("Depend {} has no {what} id for its type", self.id))
        };
        Ok(match level {
            ScopeLevel::Job => DependScope::Job(job_id),
            ScopeLevel::Layer => DependScope::Layer(layer_id.ok_or_else(|| missing("layer"))?),
            ScopeLevel::Frame => DependScope::Frame(frame_id.ok_or_else(|| missing("frame"))?),
        })
    }
}

/// Insert DTO for one edge. Built by the dependency manager from a validated
/// `DependEdge`; never deserialized from callers.
#[derive(Debug, Clone)]
pub struct NewDepend {
    pub kind: DependType,
    pub target: DependTarget,
    pub any_frame: bool,
    pub parent_id: Option<DbId>,
    pub signature: String,
    pub er_job_id: DbId,
    pub er_layer_id: Option<DbId>,
    pub er_frame_id: Option<DbId>,
    pub on_job_id: DbId,
    pub on_layer_id: Option<DbId>,
    pub on_frame_id: Option<DbId>,
}
