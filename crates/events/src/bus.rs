//! Fan-out of committed dispatch transitions.
//!
//! Services build a [`DispatchEvent`] per state change and hand it to the
//! shared [`EventBus`] once their transaction has committed. Listeners get
//! their own `broadcast` receiver; nobody listening is not an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spool_core::types::DbId;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

pub const FRAME_STARTED: &str = "frame.started";
pub const FRAME_STOPPED: &str = "frame.stopped";
pub const FRAME_CLEARED: &str = "frame.cleared";
pub const FRAME_RETRIED: &str = "frame.retried";
pub const FRAME_EATEN: &str = "frame.eaten";
pub const FRAME_CHECKPOINTED: &str = "frame.checkpointed";
pub const JOB_FINISHED: &str = "job.finished";
pub const DEPEND_SATISFIED: &str = "depend.satisfied";
pub const PROC_RELEASED: &str = "proc.released";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// The row a transition happened to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// `"frame"`, `"job"`, `"depend"` or `"proc"`.
    pub kind: String,
    pub id: DbId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEvent {
    /// One of the `*_STARTED`/`*_STOPPED`/... names above.
    pub event_type: String,
    pub subject: Option<Subject>,
    pub host_id: Option<DbId>,
    /// Transition-specific fields (exit status, counts, resource label).
    pub detail: serde_json::Value,
    pub committed_at: DateTime<Utc>,
}

impl DispatchEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            subject: None,
            host_id: None,
            detail: serde_json::Value::Null,
            committed_at: Utc::now(),
        }
    }

    pub fn about(mut self, kind: impl Into<String>, id: DbId) -> Self {
        self.subject = Some(Subject {
            kind: kind.into(),
            id,
        });
        self
    }

    pub fn on_host(mut self, host_id: DbId) -> Self {
        self.host_id = Some(host_id);
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    /// Id of the subject if it is a `kind` row.
    pub fn subject_id(&self, kind: &str) -> Option<DbId> {
        self.subject
            .as_ref()
            .filter(|s| s.kind == kind)
            .map(|s| s.id)
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Events a listener may fall behind by before it starts losing the oldest.
const BACKLOG: usize = 1024;

pub struct EventBus {
    sender: broadcast::Sender<DispatchEvent>,
}

impl EventBus {
    pub fn new(backlog: usize) -> Self {
        let (sender, _) = broadcast::channel(backlog);
        Self { sender }
    }

    pub fn publish(&self, event: DispatchEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            tracing::trace!(event_type = %event.event_type, "No listeners for dispatch event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.sender.subscribe()
    }

    pub fn listeners(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BACKLOG)
    }
}
