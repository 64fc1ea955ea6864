use chrono::NaiveDateTime;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{AppointmentStatus, Span};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("overlaps existing appointment {with}")]
    OverlapConflict { with: Ulid },
    #[error("{span} is outside working hours")]
    OutsideWorkingHours { span: Span },
    #[error("invalid duration: {0} minutes")]
    InvalidDuration(i64),
    #[error("resource not found: {0}")]
    ResourceNotFound(Ulid),
    #[error("start {start} is in the past")]
    PastDateRejected { start: NaiveDateTime },
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("cannot move appointment from {from} to {to}")]
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    #[error("appointment {0} is cancelled or a no-show")]
    AppointmentClosed(Ulid),
    #[error("invalid query: {0}")]
    InvalidQuery(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("journal error: {0}")]
    JournalError(String),
}

impl EngineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::OverlapConflict { .. } => "overlap_conflict",
            EngineError::OutsideWorkingHours { .. } => "outside_working_hours",
            EngineError::InvalidDuration(_) => "invalid_duration",
            EngineError::ResourceNotFound(_) => "resource_not_found",
            EngineError::PastDateRejected { .. } => "past_date_rejected",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::AppointmentClosed(_) => "appointment_closed",
            EngineError::InvalidQuery(_) => "invalid_query",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::JournalError(_) => "journal_error",
        }
    }
}
