use rust_decimal::Decimal;
use ulid::Ulid;

use crate::model::AppointmentStatus;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input: bad window, bad money, missing custom-service fields.
    Validation(String),
    NotFound {
        entity: &'static str,
        id: Ulid,
    },
    AlreadyExists(Ulid),
    /// The requested window overlaps this scheduled appointment.
    Conflict(Ulid),
    InvalidTransition {
        from: AppointmentStatus,
        to: String,
    },
    InsufficientPoints {
        required: u64,
        available: u64,
    },
    Inactive(Ulid),
    AlreadyUsed(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub(crate) fn not_found(entity: &'static str, id: Ulid) -> Self {
        EngineError::NotFound { entity, id }
    }

    pub(crate) fn negative_money(field: &str, value: Decimal) -> Self {
        EngineError::Validation(format!("{field} must not be negative (got {value})"))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation error: {msg}"),
            EngineError::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => {
                write!(f, "time window conflicts with appointment: {id}")
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            EngineError::InsufficientPoints {
                required,
                available,
            } => write!(
                f,
                "insufficient points: {required} required, {available} available"
            ),
            EngineError::Inactive(id) => write!(f, "inactive: {id}"),
            EngineError::AlreadyUsed(id) => {
                write!(f, "redemption {id} already used or expired")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
