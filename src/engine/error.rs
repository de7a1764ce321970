use ulid::Ulid;

use crate::model::{ChannelId, ReservationId, Span, ValidationErrors};
use crate::reservation::ReservationState;

/// What a refused booking or edit collided with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictSource {
    Reservation(ReservationId),
    Unavailable(Span),
}

impl std::fmt::Display for ConflictSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictSource::Reservation(id) => write!(f, "reservation {id}"),
            ConflictSource::Unavailable(span) => {
                write!(f, "unavailable time {} - {}", span.start, span.end)
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed input; every offending field is listed.
    #[error("invalid: {0}")]
    Validation(ValidationErrors),
    /// The slot is taken. Callers should re-read availability and retry.
    #[error("conflict with {0}")]
    Conflict(ConflictSource),
    /// The reservation is in the wrong state for the requested transition.
    #[error("cannot {action} reservation {id} while {state}")]
    IllegalState {
        id: ReservationId,
        state: ReservationState,
        action: &'static str,
    },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    /// The channel's occupancy lock could not be taken in time.
    #[error("channel {0} busy")]
    Busy(ChannelId),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl From<ValidationErrors> for EngineError {
    fn from(errors: ValidationErrors) -> Self {
        EngineError::Validation(errors)
    }
}

impl EngineError {
    pub(crate) fn field(field: &'static str, message: impl Into<String>) -> Self {
        let mut errors = ValidationErrors::default();
        errors.push(field, message);
        EngineError::Validation(errors)
    }
}
