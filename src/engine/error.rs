use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Malformed or unacceptable request; nothing was written.
    Validation(String),
    /// Invalid operating-hours policy or slot granularity.
    Configuration(String),
    /// Admission lost to an existing booking.
    SlotTaken(Ulid),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    LimitExceeded(&'static str),
    StoreUnavailable(String),
}

impl EngineError {
    /// Expected business outcomes, as opposed to infrastructure faults.
    pub fn is_business(&self) -> bool {
        !matches!(self, EngineError::StoreUnavailable(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::Configuration(msg) => write!(f, "invalid configuration: {msg}"),
            EngineError::SlotTaken(id) => write!(f, "slot taken: conflicts with booking {id}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
