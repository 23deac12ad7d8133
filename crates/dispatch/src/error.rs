use spool_core::error::CoreError;
use spool_core::types::DbId;

/// Postgres `lock_not_available`, raised by `FOR UPDATE NOWAIT`.
const PG_LOCK_NOT_AVAILABLE: &str = "55P03";

/// Postgres `unique_violation`.
const PG_UNIQUE_VIOLATION: &str = "23505";

/// Unique index allowing at most one proc per frame.
const ONE_PROC_PER_FRAME: &str = "uq_procs_frame";

/// Error type for the dispatch services.
///
/// The first four variants are expected and frequent: a caller handles them
/// by moving on to its next candidate. The rest propagate.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A reservation did not fit the idle pool it was taken from.
    #[error("Insufficient resources on host {host_id}")]
    InsufficientResources { host_id: DbId },

    /// Booking would take a job, its group or its show past `max_cores`.
    #[error("Core ceiling reached for job {job_id}")]
    CoreCeiling { job_id: DbId },

    /// A versioned update found the row changed since the caller read it.
    #[error("Stale version: {entity} {id} changed since it was read")]
    StaleVersion { entity: &'static str, id: DbId },

    /// Another booking holds the row (lock contention or duplicate proc).
    #[error("Reservation conflict: {0}")]
    ReservationConflict(String),

    /// The dependency graph and the frames it counts disagree.
    #[error("Dependency invariant violated: {0}")]
    DependencyInvariantViolation(String),

    #[error("Not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: DbId },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(sqlx::Error),
}

/// Convenience alias for service return values.
pub type DispatchResult<T> = Result<T, DispatchError>;

impl DispatchError {
    /// Whether the caller should move on to its next candidate rather than
    /// fail the whole operation.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DispatchError::InsufficientResources { .. }
                | DispatchError::CoreCeiling { .. }
                | DispatchError::StaleVersion { .. }
                | DispatchError::ReservationConflict(_)
        )
    }

    /// Lost a race with another booking for the same row.
    pub fn is_lost_race(&self) -> bool {
        matches!(
            self,
            DispatchError::StaleVersion { .. } | DispatchError::ReservationConflict(_)
        )
    }
}

impl From<sqlx::Error> for DispatchError {
    /// Lock contention on a frame and a second proc for the same frame are
    /// races, not failures.
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.code().as_deref() {
                Some(PG_LOCK_NOT_AVAILABLE) => {
                    return DispatchError::ReservationConflict(
                        "row is locked by another booking".to_string(),
                    );
                }
                Some(PG_UNIQUE_VIOLATION) if db_err.constraint() == Some(ONE_PROC_PER_FRAME) => {
                    return DispatchError::ReservationConflict(
                        "frame already has a proc".to_string(),
                    );
                }
                _ => {}
            }
        }
        DispatchError::Database(err)
    }
}
