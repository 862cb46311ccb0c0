use std::fmt;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{BookingStatus, ConflictReason, Slot, Span};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("{0}")]
    Conflict(Box<ConflictDetail>),
    #[error("cannot remove provider {0}: it still has bookings")]
    HasBookings(Ulid),
    #[error("cannot move booking from {from} to {to}")]
    InvalidTransition { from: BookingStatus, to: BookingStatus },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Short machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Conflict(_) => "conflict",
            EngineError::HasBookings(_) => "has_bookings",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Unavailable(_) => "unavailable",
        }
    }
}

/// Everything a caller needs to explain a rejected booking and offer another time.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ConflictDetail {
    pub provider_id: Ulid,
    pub date: NaiveDate,
    #[serde(skip)]
    pub requested: Span,
    pub reasons: Vec<ConflictReason>,
    pub next_available: Option<Slot>,
}

impl fmt::Display for ConflictDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} is unavailable: ", self.requested, self.date)?;
        for (i, reason) in self.reasons.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{reason}")?;
        }
        Ok(())
    }
}
