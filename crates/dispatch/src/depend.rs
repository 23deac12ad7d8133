//! Dependency graph service.
//!
//! Edges block the frames on their erring side by bumping `depend_count`;
//! satisfying an edge takes the count back down. Edge state and frame counts
//! always change in the same transaction.

use std::sync::Arc;

use spool_core::depend::{expand_composite, target_for, DependEdge, DependScope};
use spool_core::states::{DependTarget, DependType};
use spool_core::types::DbId;
use spool_db::models::depend::{Depend, NewDepend};
use spool_db::models::frame::Frame;
use spool_db::repositories::{DependRepo, FrameRepo, JobRepo, LayerRepo};
use spool_events::bus::{DEPEND_SATISFIED, JOB_FINISHED};
use spool_events::{DispatchEvent, EventBus};
use sqlx::{PgConnection, PgPool};

use crate::error::{DispatchError, DispatchResult};

/// Job, layer and frame ids behind one side of an edge.
#[derive(Debug, Clone, Copy)]
struct ScopeIds {
    job_id: DbId,
    layer_id: Option<DbId>,
    frame_id: Option<DbId>,
}

pub struct DependManager {
    pool: PgPool,
    bus: Arc<EventBus>,
}

impl DependManager {
    pub fn new(pool: PgPool, bus: Arc<EventBus>) -> Self {
        Self { pool, bus }
    }

    /// Create an edge making `er` wait on `on`.
    ///
    /// Adding an edge identical to an active one returns the existing edge
    /// and counts nothing twice. An edge whose upstream side is already
    /// satisfied is recorded inactive and blocks nothing.
    pub async fn add_dependency(
        &self,
        kind: DependType,
        er: DependScope,
        on: DependScope,
        any_frame: bool,
    ) -> DispatchResult<Depend> {
        let edge = DependEdge::new(kind, er, on, any_frame)?;

        let mut tx = self.pool.begin().await?;
        let er_ids = resolve_scope(&mut tx, &edge.er).await?;
        let on_ids = resolve_scope(&mut tx, &edge.on).await?;
        let input = NewDepend {
            kind,
            target: target_for(er_ids.job_id, on_ids.job_id),
            any_frame: edge.any_frame,
            parent_id: None,
            signature: edge.signature(),
            er_job_id: er_ids.job_id,
            er_layer_id: er_ids.layer_id,
            er_frame_id: er_ids.frame_id,
            on_job_id: on_ids.job_id,
            on_layer_id: on_ids.layer_id,
            on_frame_id: on_ids.frame_id,
        };

        let depend = if kind.is_composite() {
            add_composite(&mut tx, &edge, &input).await?
        } else {
            add_simple(&mut tx, &edge, &input).await?
        };
        tx.commit().await?;

        tracing::info!(
            depend_id = depend.id,
            kind = %kind,
            signature = %depend.signature,
            active = depend.is_active,
            "Dependency added",
        );
        Ok(depend)
    }

    /// Active edges blocked on `scope` finishing.
    pub async fn what_depends_on(&self, scope: DependScope) -> DispatchResult<Vec<Depend>> {
        Ok(DependRepo::what_depends_on(&self.pool, &scope, false).await?)
    }

    /// Active top-level edges blocking `scope`, optionally only those of one
    /// target class.
    pub async fn what_this_depends_on(
        &self,
        scope: DependScope,
        target: Option<DependTarget>,
    ) -> DispatchResult<Vec<Depend>> {
        Ok(DependRepo::what_this_depends_on(&self.pool, &scope, target).await?)
    }

    /// `FrameOnFrame` children of a composite edge.
    pub async fn child_dependencies(&self, parent_id: DbId) -> DispatchResult<Vec<Depend>> {
        Ok(DependRepo::child_dependencies(&self.pool, parent_id).await?)
    }

    /// Satisfy an edge by hand. Satisfying a composite edge satisfies each
    /// of its active children, then the parent.
    ///
    /// Returns false if the edge was already inactive.
    pub async fn satisfy_dependency(&self, depend_id: DbId) -> DispatchResult<bool> {
        let mut tx = self.pool.begin().await?;
        let depend = DependRepo::find_by_id(&mut *tx, depend_id)
            .await?
            .ok_or(DispatchError::NotFound {
                entity: "Depend",
                id: depend_id,
            })?;

        let mut events = Vec::new();
        let satisfied = if depend.is_composite {
            // The last child satisfied also deactivates the parent.
            let mut any_child = false;
            for child in DependRepo::child_dependencies(&mut *tx, depend.id).await? {
                if child.is_active {
                    any_child |= satisfy(&mut tx, &child, &mut events).await?;
                }
            }
            let parent = DependRepo::deactivate_composite(&mut *tx, depend.id).await?;
            any_child || parent
        } else {
            satisfy(&mut tx, &depend, &mut events).await?
        };
        tx.commit().await?;

        publish_all(&self.bus, events);
        Ok(satisfied)
    }

    /// Turn a satisfied `FrameOnFrame` or `LayerOnLayer` edge back on and
    /// block its erring side again.
    pub async fn reactivate(&self, depend_id: DbId) -> DispatchResult<bool> {
        let mut tx = self.pool.begin().await?;
        let depend = DependRepo::find_by_id(&mut *tx, depend_id)
            .await?
            .ok_or(DispatchError::NotFound {
                entity: "Depend",
                id: depend_id,
            })?;
        let reactivated = reactivate(&mut tx, &depend).await?;
        tx.commit().await?;
        Ok(reactivated)
    }
}

// ---------------------------------------------------------------------------
// Transaction-scoped operations
// ---------------------------------------------------------------------------

/// Deactivate one non-composite edge and unblock its erring side. A parent
/// composite whose last active child this was is deactivated too.
///
/// Returns false if the edge was already inactive.
pub(crate) async fn satisfy(
    conn: &mut PgConnection,
    depend: &Depend,
    events: &mut Vec<DispatchEvent>,
) -> DispatchResult<bool> {
    if !DependRepo::deactivate(&mut *conn, depend.id).await? {
        return Ok(false);
    }

    let er = depend.er_scope()?;
    let touched = FrameRepo::decrement_depend_count(&mut *conn, &er).await?;
    if touched == 0 && matches!(er, DependScope::Frame(_)) {
        return Err(DispatchError::DependencyInvariantViolation(format!(
            "Depend {} satisfied but frame {} was not blocked",
            depend.id,
            er.id()
        )));
    }

    if let Some(parent_id) = depend.parent_id {
        if DependRepo::count_active_children(&mut *conn, parent_id).await? == 0 {
            DependRepo::deactivate_composite(&mut *conn, parent_id).await?;
        }
    }

    tracing::debug!(depend_id = depend.id, frames = touched, "Dependency satisfied");
    events.push(
        DispatchEvent::new(DEPEND_SATISFIED)
            .about("depend", depend.id)
            .with_detail(serde_json::json!({
                "signature": depend.signature,
                "unblocked_frames": touched,
            })),
    );
    Ok(true)
}

/// Propagate a frame reaching a new state to everything waiting on it: the
/// frame's own dependents, its layer's dependents and, once every frame of
/// the job is Succeeded or Eaten, the job's dependents. The job itself
/// finishes once every frame is terminal, `Dead` included.
pub(crate) async fn on_frame_done(
    conn: &mut PgConnection,
    frame: &Frame,
    events: &mut Vec<DispatchEvent>,
) -> DispatchResult<()> {
    let state = frame.state()?;

    if state.satisfies_dependents() {
        for depend in DependRepo::what_depends_on(&mut *conn, &DependScope::Frame(frame.id), false).await? {
            satisfy(conn, &depend, events).await?;
        }

        let layer_scope = DependScope::Layer(frame.layer_id);
        let layer_depends = DependRepo::what_depends_on(&mut *conn, &layer_scope, false).await?;
        if !layer_depends.is_empty() {
            let layer_complete = LayerRepo::is_complete(&mut *conn, frame.layer_id).await?;
            for depend in layer_depends {
                if depend.any_frame || layer_complete {
                    satisfy(conn, &depend, events).await?;
                }
            }
        }

        let job_scope = DependScope::Job(frame.job_id);
        let job_depends = DependRepo::what_depends_on(&mut *conn, &job_scope, false).await?;
        if !job_depends.is_empty() && JobRepo::is_satisfied(&mut *conn, frame.job_id).await? {
            for depend in job_depends {
                satisfy(conn, &depend, events).await?;
            }
        }
    }

    if state.is_terminal()
        && JobRepo::is_complete(&mut *conn, frame.job_id).await?
        && JobRepo::finish(&mut *conn, frame.job_id).await?
    {
        tracing::info!(job_id = frame.job_id, "Job finished");
        events.push(DispatchEvent::new(JOB_FINISHED).about("job", frame.job_id));
    }
    Ok(())
}

/// Re-block dependents of a frame being retried: every edge this frame
/// satisfied that can be turned back on.
pub(crate) async fn reactivate_for_retry(conn: &mut PgConnection, frame: &Frame) -> DispatchResult<u32> {
    let mut reactivated = 0;
    for depend in DependRepo::what_depends_on(&mut *conn, &DependScope::Frame(frame.id), true).await? {
        if !depend.is_active && reactivate(conn, &depend).await? {
            reactivated += 1;
        }
    }
    for depend in DependRepo::what_depends_on(&mut *conn, &DependScope::Layer(frame.layer_id), true).await? {
        if !depend.is_active && !depend.any_frame && reactivate(conn, &depend).await? {
            reactivated += 1;
        }
    }
    Ok(reactivated)
}

async fn reactivate(conn: &mut PgConnection, depend: &Depend) -> DispatchResult<bool> {
    if !depend.kind()?.can_reactivate() {
        return Ok(false);
    }
    if !DependRepo::reactivate(&mut *conn, depend.id).await? {
        return Ok(false);
    }
    let er = depend.er_scope()?;
    FrameRepo::increment_depend_count(&mut *conn, &er).await?;
    tracing::debug!(depend_id = depend.id, "Dependency reactivated");
    Ok(true)
}

pub(crate) fn publish_all(bus: &EventBus, events: Vec<DispatchEvent>) {
    for event in events {
        bus.publish(event);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn resolve_scope(conn: &mut PgConnection, scope: &DependScope) -> DispatchResult<ScopeIds> {
    match *scope {
        DependScope::Job(id) => {
            let job = JobRepo::find_by_id(&mut *conn, id)
                .await?
                .ok_or(DispatchError::NotFound { entity: "Job", id })?;
            Ok(ScopeIds {
                job_id: job.id,
                layer_id: None,
                frame_id: None,
            })
        }
        DependScope::Layer(id) => {
            let layer = LayerRepo::find_by_id(&mut *conn, id)
                .await?
                .ok_or(DispatchError::NotFound { entity: "Layer", id })?;
            Ok(ScopeIds {
                job_id: layer.job_id,
                layer_id: Some(layer.id),
                frame_id: None,
            })
        }
        DependScope::Frame(id) => {
            let frame = FrameRepo::find_by_id(&mut *conn, id)
                .await?
                .ok_or(DispatchError::NotFound { entity: "Frame", id })?;
            Ok(ScopeIds {
                job_id: frame.job_id,
                layer_id: Some(frame.layer_id),
                frame_id: Some(frame.id),
            })
        }
    }
}

/// Whether the upstream side of a new edge has already done what the edge
/// waits for.
///
/// The upstream frames are share-locked first: a stop racing with this
/// insert either commits before the check (and is seen here) or waits for
/// this transaction (and then sees the new edge).
async fn already_satisfied(conn: &mut PgConnection, edge: &DependEdge) -> DispatchResult<bool> {
    FrameRepo::lock_scope_for_share(&mut *conn, &edge.on).await?;
    let satisfied = match edge.on {
        DependScope::Job(id) => JobRepo::is_satisfied(&mut *conn, id).await?,
        DependScope::Layer(id) if edge.any_frame => LayerRepo::has_satisfied_frame(&mut *conn, id).await?,
        DependScope::Layer(id) => LayerRepo::is_complete(&mut *conn, id).await?,
        DependScope::Frame(id) => match FrameRepo::find_by_id(&mut *conn, id).await? {
            Some(frame) => frame.state()?.satisfies_dependents(),
            None => return Err(DispatchError::NotFound { entity: "Frame", id }),
        },
    };
    Ok(satisfied)
}

/// Insert `input`, or return the active edge it duplicates.
async fn insert_or_existing(
    conn: &mut PgConnection,
    input: &NewDepend,
) -> DispatchResult<(Depend, bool)> {
    if let Some(depend) = DependRepo::insert(&mut *conn, input).await? {
        return Ok((depend, true));
    }
    let existing = DependRepo::find_active_by_signature(&mut *conn, &input.signature)
        .await?
        .ok_or_else(|| {
            DispatchError::ReservationConflict(format!(
                "Dependency {} changed while it was being added",
                input.signature
            ))
        })?;
    Ok((existing, false))
}

async fn add_simple(
    conn: &mut PgConnection,
    edge: &DependEdge,
    input: &NewDepend,
) -> DispatchResult<Depend> {
    let (depend, inserted) = insert_or_existing(conn, input).await?;
    if !inserted {
        return Ok(depend);
    }

    if already_satisfied(conn, edge).await? {
        DependRepo::deactivate(&mut *conn, depend.id).await?;
        return refetch(conn, depend.id).await;
    }

    let touched = FrameRepo::increment_depend_count(&mut *conn, &edge.er).await?;
    if touched == 0 && matches!(edge.er, DependScope::Frame(_)) {
        return Err(DispatchError::DependencyInvariantViolation(format!(
            "Dependency {} blocks no frame",
            input.signature
        )));
    }
    Ok(depend)
}

/// Insert a composite parent and one `FrameOnFrame` child per frame pair
/// whose upstream frame has not already finished.
async fn add_composite(
    conn: &mut PgConnection,
    edge: &DependEdge,
    input: &NewDepend,
) -> DispatchResult<Depend> {
    let (parent, inserted) = insert_or_existing(conn, input).await?;
    if !inserted {
        return Ok(parent);
    }

    FrameRepo::lock_scope_for_share(&mut *conn, &edge.on).await?;
    let er_frames = FrameRepo::list_by_layer(&mut *conn, edge.er.id()).await?;
    let on_frames = FrameRepo::list_by_layer(&mut *conn, edge.on.id()).await?;
    let er_refs: Vec<_> = er_frames.iter().map(Frame::frame_ref).collect();
    let on_refs: Vec<_> = on_frames.iter().map(Frame::frame_ref).collect();

    let mut active_children = 0;
    for pair in expand_composite(edge.kind, &er_refs, &on_refs)? {
        let on_frame = on_frames.iter().find(|f| f.id == pair.on_frame_id);
        if let Some(on_frame) = on_frame {
            if on_frame.state()?.satisfies_dependents() {
                continue;
            }
        }

        let child = DependEdge::new(
            DependType::FrameOnFrame,
            DependScope::Frame(pair.er_frame_id),
            DependScope::Frame(pair.on_frame_id),
            false,
        )?;
        let child_input = NewDepend {
            kind: DependType::FrameOnFrame,
            any_frame: false,
            parent_id: Some(parent.id),
            signature: child.signature(),
            er_frame_id: Some(pair.er_frame_id),
            on_frame_id: Some(pair.on_frame_id),
            ..input.clone()
        };
        if DependRepo::insert(&mut *conn, &child_input).await?.is_none() {
            continue;
        }
        let touched = FrameRepo::increment_depend_count(&mut *conn, &child.er).await?;
        if touched == 0 {
            return Err(DispatchError::DependencyInvariantViolation(format!(
                "Child dependency {} blocks no frame",
                child_input.signature
            )));
        }
        active_children += 1;
    }

    if active_children == 0 {
        DependRepo::deactivate_composite(&mut *conn, parent.id).await?;
        return refetch(conn, parent.id).await;
    }
    tracing::debug!(depend_id = parent.id, children = active_children, "Composite dependency expanded");
    Ok(parent)
}

async fn refetch(conn: &mut PgConnection, depend_id: DbId) -> DispatchResult<Depend> {
    DependRepo::find_by_id(&mut *conn, depend_id)
        .await?
        .ok_or(DispatchError::NotFound {
            entity: "Depend",
            id: depend_id,
        })
}
