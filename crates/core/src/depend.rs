//! Dependency edges and composite expansion.
//!
//! An edge is a [`DependType`] plus the erring and upstream [`DependScope`]s
//! it connects. Composite types (`FrameByFrame`, `PreviousFrame`) are never
//! satisfied directly: they expand into `FrameOnFrame` children through the
//! pure functions at the bottom of this module.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::states::{DependTarget, DependType};
use crate::types::DbId;

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

/// The entity on one side of a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependScope {
    Job(DbId),
    Layer(DbId),
    Frame(DbId),
}

/// The level of a [`DependScope`], without the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeLevel {
    Job,
    Layer,
    Frame,
}

impl DependScope {
    pub fn level(&self) -> ScopeLevel {
        match self {
            DependScope::Job(_) => ScopeLevel::Job,
            DependScope::Layer(_) => ScopeLevel::Layer,
            DependScope::Frame(_) => ScopeLevel::Frame,
        }
    }

    pub fn id(&self) -> DbId {
        match self {
            DependScope::Job(id) | DependScope::Layer(id) | DependScope::Frame(id) => *id,
        }
    }

    fn tag(&self) -> char {
        match self {
            DependScope::Job(_) => 'j',
            DependScope::Layer(_) => 'l',
            DependScope::Frame(_) => 'f',
        }
    }
}

impl DependType {
    /// Level of the erring (blocked) side.
    pub fn er_level(self) -> ScopeLevel {
        use DependType::*;
        match self {
            JobOnJob | JobOnLayer | JobOnFrame => ScopeLevel::Job,
            LayerOnJob | LayerOnLayer | LayerOnFrame | FrameByFrame | PreviousFrame => {
                ScopeLevel::Layer
            }
            FrameOnJob | FrameOnLayer | FrameOnFrame => ScopeLevel::Frame,
        }
    }

    /// Level of the upstream side.
    pub fn on_level(self) -> ScopeLevel {
        use DependType::*;
        match self {
            JobOnJob | LayerOnJob | FrameOnJob => ScopeLevel::Job,
            JobOnLayer | LayerOnLayer | FrameOnLayer | FrameByFrame | PreviousFrame => {
                ScopeLevel::Layer
            }
            JobOnFrame | LayerOnFrame | FrameOnFrame => ScopeLevel::Frame,
        }
    }

    /// Composite types expand into `FrameOnFrame` children.
    pub fn is_composite(self) -> bool {
        matches!(self, DependType::FrameByFrame | DependType::PreviousFrame)
    }

    /// Types that may flip back on after being satisfied (e.g. on frame retry).
    pub fn can_reactivate(self) -> bool {
        matches!(self, DependType::FrameOnFrame | DependType::LayerOnLayer)
    }

    /// Types whose `any_frame` flag is meaningful: those waiting on a layer.
    pub fn supports_any_frame(self) -> bool {
        matches!(
            self,
            DependType::JobOnLayer | DependType::LayerOnLayer | DependType::FrameOnLayer
        )
    }

    /// Types triggered by an upstream scope at `level`, excluding composites.
    pub fn satisfiable_on(level: ScopeLevel) -> Vec<DependType> {
        DependType::ALL
            .iter()
            .copied()
            .filter(|t| !t.is_composite() && t.on_level() == level)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// A validated dependency edge, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependEdge {
    pub kind: DependType,
    pub er: DependScope,
    pub on: DependScope,
    pub any_frame: bool,
}

impl DependEdge {
    /// Build an edge, checking that both scopes match the type's levels.
    ///
    /// `any_frame` is dropped for types that do not wait on a layer.
    pub fn new(
        kind: DependType,
        er: DependScope,
        on: DependScope,
        any_frame: bool,
    ) -> Result<Self, CoreError> {
        if er.level() != kind.er_level() || on.level() != kind.on_level() {
            return Err(CoreError::Validation(format!(
                "{kind} dependency cannot connect {:?} to {:?}",
                er, on
            )));
        }
        if er == on {
            return Err(CoreError::Validation(format!(
                "{kind} dependency cannot depend on itself"
            )));
        }
        Ok(Self {
            kind,
            er,
            on,
            any_frame: any_frame && kind.supports_any_frame(),
        })
    }

    /// Deduplication key for identical edges.
    pub fn signature(&self) -> String {
        format!(
            "{}:{}{}:{}{}",
            self.kind.id(),
            self.er.tag(),
            self.er.id(),
            self.on.tag(),
            self.on.id()
        )
    }
}

/// `External` when the edge crosses job boundaries.
pub fn target_for(er_job_id: DbId, on_job_id: DbId) -> DependTarget {
    if er_job_id == on_job_id {
        DependTarget::AnyTarget
    } else {
        DependTarget::External
    }
}

// ---------------------------------------------------------------------------
// Composite expansion
// ---------------------------------------------------------------------------

/// A frame identified by id and frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef {
    pub id: DbId,
    pub number: i32,
}

/// One `FrameOnFrame` child of a composite edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildEdge {
    pub er_frame_id: DbId,
    pub on_frame_id: DbId,
}

/// Expand a composite dependency between two layers into frame pairs.
pub fn expand_composite(
    kind: DependType,
    er_frames: &[FrameRef],
    on_frames: &[FrameRef],
) -> Result<Vec<ChildEdge>, CoreError> {
    match kind {
        DependType::FrameByFrame => Ok(expand_frame_by_frame(er_frames, on_frames)),
        DependType::PreviousFrame => Ok(expand_previous_frame(er_frames, on_frames)),
        other => Err(CoreError::Validation(format!(
            "{other} is not a composite dependency type"
        ))),
    }
}

/// Frame *n* of the erring layer waits on frame *n* of the upstream layer.
/// Erring frames without a same-numbered counterpart get no child.
pub fn expand_frame_by_frame(er_frames: &[FrameRef], on_frames: &[FrameRef]) -> Vec<ChildEdge> {
    er_frames
        .iter()
        .filter_map(|er| {
            on_frames
                .iter()
                .find(|on| on.number == er.number)
                .map(|on| ChildEdge {
                    er_frame_id: er.id,
                    on_frame_id: on.id,
                })
        })
        .collect()
}

/// Frame *n* of the erring layer waits on the upstream frame numbered
/// closest below *n*. The first erring frame has nothing to wait on.
pub fn expand_previous_frame(er_frames: &[FrameRef], on_frames: &[FrameRef]) -> Vec<ChildEdge> {
    er_frames
        .iter()
        .filter_map(|er| {
            on_frames
                .iter()
                .filter(|on| on.number < er.number)
                .max_by_key(|on| on.number)
                .map(|on| ChildEdge {
                    er_frame_id: er.id,
                    on_frame_id: on.id,
                })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(base_id: DbId, numbers: &[i32]) -> Vec<FrameRef> {
        numbers
            .iter()
            .enumerate()
            .map(|(i, n)| FrameRef {
                id: base_id + i as DbId,
                number: *n,
            })
            .collect()
    }

    #[test]
    fn edge_rejects_mismatched_scopes() {
        let err = DependEdge::new(
            DependType::FrameOnFrame,
            DependScope::Layer(1),
            DependScope::Frame(2),
            false,
        );
        assert!(err.is_err());
    }

    #[test]
    fn edge_rejects_self_dependency() {
        let err = DependEdge::new(
            DependType::LayerOnLayer,
            DependScope::Layer(7),
            DependScope::Layer(7),
            false,
        );
        assert!(err.is_err());
    }

    #[test]
    fn any_frame_is_dropped_where_meaningless() {
        let edge = DependEdge::new(
            DependType::FrameOnFrame,
            DependScope::Frame(1),
            DependScope::Frame(2),
            true,
        )
        .unwrap();
        assert!(!edge.any_frame);

        let edge = DependEdge::new(
            DependType::LayerOnLayer,
            DependScope::Layer(1),
            DependScope::Layer(2),
            true,
        )
        .unwrap();
        assert!(edge.any_frame);
    }

    #[test]
    fn signature_distinguishes_direction() {
        let a = DependEdge::new(
            DependType::LayerOnLayer,
            DependScope::Layer(1),
            DependScope::Layer(2),
            false,
        )
        .unwrap();
        let b = DependEdge::new(
            DependType::LayerOnLayer,
            DependScope::Layer(2),
            DependScope::Layer(1),
            false,
        )
        .unwrap();
        assert_ne!(a.signature(), b.signature());
        assert_eq!(a.signature(), "5:l1:l2");
    }

    #[test]
    fn only_composites_expand() {
        assert!(DependType::FrameByFrame.is_composite());
        assert!(DependType::PreviousFrame.is_composite());
        assert!(!DependType::LayerOnLayer.is_composite());
        assert!(expand_composite(DependType::LayerOnLayer, &[], &[]).is_err());
    }

    #[test]
    fn satisfiable_types_per_level_exclude_composites() {
        let on_layer = DependType::satisfiable_on(ScopeLevel::Layer);
        assert_eq!(
            on_layer,
            vec![
                DependType::JobOnLayer,
                DependType::LayerOnLayer,
                DependType::FrameOnLayer
            ]
        );
    }

    #[test]
    fn reactivation_is_limited_to_frame_and_layer_pairs() {
        assert!(DependType::FrameOnFrame.can_reactivate());
        assert!(DependType::LayerOnLayer.can_reactivate());
        assert!(!DependType::JobOnJob.can_reactivate());
        assert!(!DependType::FrameByFrame.can_reactivate());
    }

    #[test]
    fn frame_by_frame_pairs_matching_numbers() {
        let er = frames(100, &[1, 2, 3, 4]);
        let on = frames(200, &[2, 3, 4, 5]);
        let children = expand_frame_by_frame(&er, &on);
        assert_eq!(
            children,
            vec![
                ChildEdge { er_frame_id: 101, on_frame_id: 200 },
                ChildEdge { er_frame_id: 102, on_frame_id: 201 },
                ChildEdge { er_frame_id: 103, on_frame_id: 202 },
            ]
        );
    }

    #[test]
    fn previous_frame_waits_on_preceding_number() {
        let er = frames(100, &[1, 2, 3]);
        let on = frames(200, &[1, 2, 3]);
        let children = expand_previous_frame(&er, &on);
        assert_eq!(
            children,
            vec![
                ChildEdge { er_frame_id: 101, on_frame_id: 200 },
                ChildEdge { er_frame_id: 102, on_frame_id: 201 },
            ]
        );
    }

    #[test]
    fn previous_frame_handles_stepped_ranges() {
        let er = frames(100, &[10, 20]);
        let on = frames(200, &[1, 5, 15]);
        let children = expand_previous_frame(&er, &on);
        assert_eq!(children[0].on_frame_id, 201);
        assert_eq!(children[1].on_frame_id, 202);
    }

    #[test]
    fn cross_job_edges_are_external() {
        assert_eq!(target_for(1, 1), DependTarget::AnyTarget);
        assert_eq!(target_for(1, 2), DependTarget::External);
    }
}
